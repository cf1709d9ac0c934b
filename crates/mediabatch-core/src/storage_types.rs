use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Storage backend kinds
///
/// This enum defines the available storage backends. It's defined in core
/// because it's used in configuration before the storage crate is involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Wasabi,
    Backblaze,
    DigitalOcean,
    Local,
}

impl StorageBackendKind {
    pub fn is_remote(&self) -> bool {
        !matches!(self, StorageBackendKind::Local)
    }
}

impl FromStr for StorageBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wasabi" => Ok(StorageBackendKind::Wasabi),
            "backblaze" | "b2" => Ok(StorageBackendKind::Backblaze),
            "digitalocean" | "spaces" => Ok(StorageBackendKind::DigitalOcean),
            "local" => Ok(StorageBackendKind::Local),
            _ => Err(anyhow::anyhow!("Invalid storage backend: {}", s)),
        }
    }
}

impl Display for StorageBackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            StorageBackendKind::Wasabi => write!(f, "wasabi"),
            StorageBackendKind::Backblaze => write!(f, "backblaze"),
            StorageBackendKind::DigitalOcean => write!(f, "digitalocean"),
            StorageBackendKind::Local => write!(f, "local"),
        }
    }
}
