//! Persistence for the last connected peripheral address.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

/// Key under which the address is stored.
pub const LAST_DEVICE_ADDRESS_KEY: &str = "LastDeviceAddress";

/// Stores a single peripheral address across restarts.
///
/// Empty strings are treated as "no cached target".
#[cfg_attr(test, mockall::automock)]
pub trait AddressCache: Send {
    /// Load the cached address, if any.
    fn load(&self) -> Option<String>;

    /// Replace the cached address.
    fn save(&mut self, address: &str) -> Result<()>;

    /// Forget the cached address.
    fn clear(&mut self) -> Result<()>;
}

/// In-memory cache. Does not survive restarts.
#[derive(Debug, Clone, Default)]
pub struct MemoryAddressCache {
    address: Option<String>,
}

impl MemoryAddressCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache pre-populated with an address.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
        }
    }
}

impl AddressCache for MemoryAddressCache {
    fn load(&self) -> Option<String> {
        self.address.clone().filter(|a| !a.is_empty())
    }

    fn save(&mut self, address: &str) -> Result<()> {
        self.address = Some(address.to_string());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.address = None;
        Ok(())
    }
}

/// Cache backed by a small JSON preferences file.
///
/// Other keys in the file are preserved, so the file can be shared with
/// other settings of the host application.
#[derive(Debug, Clone)]
pub struct FileAddressCache {
    path: PathBuf,
    key: String,
}

impl FileAddressCache {
    /// Create a cache stored at `path` under the default key.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_key(path, LAST_DEVICE_ADDRESS_KEY)
    }

    /// Create a cache stored at `path` under a custom key.
    pub fn with_key(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(values)?;
        // Replace atomically via a sibling file.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl AddressCache for FileAddressCache {
    fn load(&self) -> Option<String> {
        match self.read_all() {
            Ok(mut values) => values.remove(&self.key).filter(|a| !a.is_empty()),
            Err(e) => {
                warn!("Failed to read address cache {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn save(&mut self, address: &str) -> Result<()> {
        let mut values = self.read_all().unwrap_or_default();
        values.insert(self.key.clone(), address.to_string());
        self.write_all(&values)?;
        debug!("Cached device address {}", address);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let mut values = self.read_all().unwrap_or_default();
        if values.remove(&self.key).is_some() {
            self.write_all(&values)?;
            debug!("Cleared cached device address");
        }
        Ok(())
    }
}
