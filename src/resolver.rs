use globwalk::GlobWalkerBuilder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub const EMBEDDED_MARKER: &str = "embeddedcli";
pub const PRODUCT_TOKEN: &str = "wc3proxy";
pub const EXECUTABLE_SUFFIX: &str = ".exe";
pub const DEFAULT_FILE_NAME: &str = "wc3proxy.exe";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Embedded CLI not found")]
    NotFound,
    #[error("Failed to scan bundled resources: {0}")]
    Scan(String),
    #[error("Failed to extract {name}: {source}")]
    Extract { name: String, source: io::Error },
}

/// A named entry of the bundled resource set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateResource {
    pub name: String,
    pub len: u64,
}

pub trait ResourceSet: Send + Sync {
    /// Every resource, in a stable order.
    fn candidates(&self) -> Result<Vec<CandidateResource>, ResolveError>;

    /// `Ok(None)` when the resource vanished since enumeration.
    fn open(&self, name: &str) -> io::Result<Option<Box<dyn Read + '_>>>;
}

/// In-memory resource table.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct StaticResources {
    entries: Vec<(String, Vec<u8>)>,
}

#[cfg(test)]
impl StaticResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.entries.push((name.into(), bytes.into()));
        self
    }
}

#[cfg(test)]
impl ResourceSet for StaticResources {
    fn candidates(&self) -> Result<Vec<CandidateResource>, ResolveError> {
        Ok(self
            .entries
            .iter()
            .map(|(name, bytes)| CandidateResource {
                name: name.clone(),
                len: bytes.len() as u64,
            })
            .collect())
    }

    fn open(&self, name: &str) -> io::Result<Option<Box<dyn Read + '_>>> {
        Ok(self
            .entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bytes)| Box::new(bytes.as_slice()) as Box<dyn Read + '_>))
    }
}

/// Files shipped next to the launcher in a bundle directory.
#[derive(Debug, Clone)]
pub struct BundleDir {
    root: PathBuf,
}

impl BundleDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceSet for BundleDir {
    fn candidates(&self) -> Result<Vec<CandidateResource>, ResolveError> {
        if !self.root.is_dir() {
            debug!(root = ?self.root, "Bundle directory missing");
            return Ok(Vec::new());
        }
        let mut found = GlobWalkerBuilder::from_patterns(&self.root, &["*"])
            .max_depth(1)
            .follow_links(true)
            .build()
            .map_err(|err| ResolveError::Scan(err.to_string()))?
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| CandidateResource {
                name: e.file_name().to_string_lossy().into_owned(),
                len: e.metadata().map(|m| m.len()).unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn open(&self, name: &str) -> io::Result<Option<Box<dyn Read + '_>>> {
        match File::open(self.root.join(name)) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub marker: String,
    pub product: String,
    pub suffix: String,
    pub host_module: String,
    pub default_file_name: String,
    pub output_dir: PathBuf,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            marker: EMBEDDED_MARKER.into(),
            product: PRODUCT_TOKEN.into(),
            suffix: EXECUTABLE_SUFFIX.into(),
            host_module: env!("CARGO_PKG_NAME").to_lowercase(),
            default_file_name: DEFAULT_FILE_NAME.into(),
            output_dir: std::env::temp_dir(),
        }
    }
}

/// Produces the path of a ready-to-run worker executable.
pub trait Resolve: Send + Sync {
    fn resolve(&self) -> Result<PathBuf, ResolveError>;
}

pub struct BinaryResolver<R> {
    resources: R,
    config: ResolverConfig,
}

impl<R: ResourceSet> BinaryResolver<R> {
    pub fn new(resources: R, config: ResolverConfig) -> Self {
        Self { resources, config }
    }

    fn qualifies(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        let suffix = self.config.suffix.to_lowercase();
        if !(lower.contains(&self.config.marker.to_lowercase()) || lower.ends_with(&suffix)) {
            return false;
        }
        if !self.config.host_module.is_empty() && lower.contains(&self.config.host_module) {
            return false;
        }
        lower.contains(&self.config.product.to_lowercase()) && lower.ends_with(&suffix)
    }

    fn output_name(&self, name: &str) -> String {
        let tokens = name.split('.').collect::<Vec<_>>();
        let ext = tokens.last().copied().unwrap_or_default();
        let file_name = match tokens
            .iter()
            .find(|t| t.eq_ignore_ascii_case(&self.config.product))
        {
            Some(product) => format!("{product}.{ext}"),
            None if tokens.len() >= 2 => format!("{}.{ext}", tokens[tokens.len() - 2]),
            None => name.to_string(),
        };
        // Never let a resource name escape the output directory.
        match Path::new(&file_name).file_name() {
            Some(f) if !f.is_empty() && !file_name.starts_with('.') => {
                f.to_string_lossy().into_owned()
            }
            _ => self.config.default_file_name.clone(),
        }
    }

    fn extract(&self, candidate: &CandidateResource, out_path: &Path) -> Result<bool, ResolveError> {
        let to_err = |source| ResolveError::Extract {
            name: candidate.name.clone(),
            source,
        };
        let Some(mut reader) = self.resources.open(&candidate.name).map_err(to_err)? else {
            return Ok(false);
        };

        let mut part = out_path.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);
        let copied = (|| -> io::Result<u64> {
            let mut file = File::create(&part)?;
            let n = io::copy(&mut reader, &mut file)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&part, out_path)?;
            Ok(n)
        })();
        let size = match copied {
            Ok(n) => n,
            Err(err) => {
                let _ = fs::remove_file(&part);
                return Err(to_err(err));
            }
        };

        mark_executable(out_path);
        info!(
            "Extracted {} to {:?} ({})",
            candidate.name,
            out_path,
            human_bytes::human_bytes(size as f64)
        );
        Ok(true)
    }
}

impl<R: ResourceSet> Resolve for BinaryResolver<R> {
    #[instrument(skip(self))]
    fn resolve(&self) -> Result<PathBuf, ResolveError> {
        for candidate in self.resources.candidates()? {
            if !self.qualifies(&candidate.name) {
                continue;
            }
            debug!(name = %candidate.name, len = candidate.len, "Found worker resource");
            let out_path = self
                .config
                .output_dir
                .join(self.output_name(&candidate.name));
            if self.extract(&candidate, &out_path)? {
                return Ok(out_path);
            }
            debug!(name = %candidate.name, "Resource disappeared, skipping");
        }
        Err(ResolveError::NotFound)
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let result = fs::metadata(path).and_then(|meta| {
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(path, perms)
    });
    if let Err(err) = result {
        warn!(?err, "Failed to mark {:?} executable", path);
    }
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) {}
