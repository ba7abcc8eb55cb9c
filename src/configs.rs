use crate::settings::SETTINGS_FILE_NAME;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LauncherConfig {
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(with = "humantime_serde", default = "default_stop_timeout")]
    pub stop_timeout: Duration,
    /// Defaults to `bundle/` next to the executable.
    pub bundle_dir: Option<PathBuf>,
    /// Defaults to the system temp directory.
    pub extract_dir: Option<PathBuf>,
    /// Defaults to the settings file name next to the executable.
    pub settings_file: Option<PathBuf>,
    /// Bytes of worker output kept for the `log` command.
    #[serde(default = "default_scrollback")]
    pub scrollback: usize,
}

impl LauncherConfig {
    /// A missing file yields the defaults, a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        serde_yaml::from_reader(File::open(path).wrap_err("Failed to read config")?)
            .wrap_err("Failed to parse config!")
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.bundle_dir
            .clone()
            .unwrap_or_else(|| exe_dir().join("bundle"))
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.extract_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.settings_file
            .clone()
            .unwrap_or_else(|| exe_dir().join(SETTINGS_FILE_NAME))
    }
}

fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_log_filter() -> String {
    "info".into()
}

fn default_stop_timeout() -> Duration {
    Duration::from_millis(3000)
}

fn default_scrollback() -> usize {
    64 * 1024
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            stop_timeout: default_stop_timeout(),
            bundle_dir: Default::default(),
            extract_dir: Default::default(),
            settings_file: Default::default(),
            scrollback: default_scrollback(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = LauncherConfig::load(&dir.path().join("config.yml")).unwrap();
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.stop_timeout, Duration::from_secs(3));
        assert_eq!(config.scrollback, 64 * 1024);
        assert!(config.settings_file().ends_with(SETTINGS_FILE_NAME));
    }

    #[test]
    fn parses_kebab_case_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "log-filter: debug\nstop-timeout: 500ms\nbundle-dir: /opt/wc3proxy\nscrollback: 1024\n",
        )
        .unwrap();

        let config = LauncherConfig::load(&path).unwrap();
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.stop_timeout, Duration::from_millis(500));
        assert_eq!(config.bundle_dir(), PathBuf::from("/opt/wc3proxy"));
        assert_eq!(config.extract_dir(), std::env::temp_dir());
        assert_eq!(config.scrollback, 1024);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "stop-timeout: [not a duration\n").unwrap();
        assert!(LauncherConfig::load(&path).is_err());
    }
}
