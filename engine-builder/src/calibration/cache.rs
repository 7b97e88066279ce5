use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::info;

/// Calibration cache persisted as a single opaque file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalibrationCache {
    path: PathBuf,
}

impl CalibrationCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Returns the cache content, or `None` when no cache was written yet.
    pub fn load(&self) -> std::io::Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                info!("Using calibration cache file: {}", self.path.display());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Overwrites the cache file with `bytes`.
    pub fn store(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        info!("Writing calibration cache data to: {}", self.path.display());
        std::fs::write(&self.path, bytes)
    }
}
