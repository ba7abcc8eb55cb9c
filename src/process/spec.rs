use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid IP")]
    InvalidAddress,
    #[error("Invalid Version")]
    InvalidVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    RoC,
    Tft,
}

impl Expansion {
    pub fn from_tft(is_tft: bool) -> Self {
        if is_tft {
            Expansion::Tft
        } else {
            Expansion::RoC
        }
    }

    pub fn as_arg(&self) -> &'static str {
        match self {
            Expansion::RoC => "RoC",
            Expansion::Tft => "TFT",
        }
    }
}

impl fmt::Display for Expansion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// How to invoke the worker. Only constructible through [`WorkerSpec::new`],
/// so an instance always holds a valid address and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    address: String,
    version: String,
    expansion: Expansion,
}

impl WorkerSpec {
    pub fn new(address: &str, version: &str, expansion: Expansion) -> Result<Self, ValidationError> {
        let address = address.trim();
        let version = version.trim();
        if !is_valid_address(address) {
            return Err(ValidationError::InvalidAddress);
        }
        if !is_valid_version(version) {
            return Err(ValidationError::InvalidVersion);
        }
        Ok(Self {
            address: address.to_string(),
            version: version.to_string(),
            expansion,
        })
    }

    /// Positional arguments, in invocation order.
    pub fn args(&self) -> [&str; 3] {
        [&self.address, &self.version, self.expansion.as_arg()]
    }

    /// Printable command line: address and version quoted, expansion bare.
    pub fn command_line(&self, program: &str) -> String {
        format!(
            "{program} \"{}\" \"{}\" {}",
            self.address, self.version, self.expansion
        )
    }
}

/// Dotted-quad IPv4 with exactly four groups, each 0-255.
pub fn is_valid_address(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty() && s.parse::<Ipv4Addr>().is_ok()
}

/// `1.2d` or `1.3d` for a single digit `d`.
pub fn is_valid_version(s: &str) -> bool {
    matches!(
        s.as_bytes(),
        [b'1', b'.', b'2' | b'3', d] if d.is_ascii_digit()
    )
}
