use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const SETTINGS_FILE_NAME: &str = "wc3proxy-gui-settings.json";

pub const DEFAULT_ADDRESS: &str = "1.0.0.1";
pub const DEFAULT_VERSION: &str = "1.29";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserSettings {
    pub ip: String,
    pub version: String,
    pub is_tft: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            ip: DEFAULT_ADDRESS.into(),
            version: DEFAULT_VERSION.into(),
            is_tft: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to write settings to {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// JSON settings file, replaced atomically on every save.
pub struct SettingsStore {
    path: PathBuf,
    save_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Missing, empty or unreadable files all load as `None`.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn load(&self) -> Option<UserSettings> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(?err, "Failed to read settings");
                return None;
            }
        };
        if json.trim().is_empty() {
            return None;
        }
        match serde_json::from_str(&json) {
            Ok(settings) => Some(settings),
            Err(err) => {
                warn!(?err, "Ignoring malformed settings file");
                None
            }
        }
    }

    #[instrument(skip(self, settings), fields(path = %self.path.display()))]
    pub fn save(&self, settings: &UserSettings) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(settings)?;
        let _guard = self.save_lock.lock();

        let temp = self.temp_path();
        let result = (|| -> io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(json.as_bytes())?;
            // Data must be on disk before the rename makes it visible.
            file.sync_all()?;
            drop(file);
            fs::rename(&temp, &self.path)
        })();
        if let Err(source) = result {
            if temp.exists() {
                if let Err(err) = fs::remove_file(&temp) {
                    warn!(?err, "Failed to remove temporary settings file");
                }
            }
            return Err(SettingsError::Io {
                path: self.path.clone(),
                source,
            });
        }
        debug!("Settings saved");
        Ok(())
    }

    pub fn ensure_exists(&self, default: &UserSettings) -> Result<(), SettingsError> {
        if self.path.exists() {
            return Ok(());
        }
        self.save(default)
    }
}
