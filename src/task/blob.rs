//! Spillover storage for task payloads too large to pass inline.

use crate::error::{ForkpoolError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Prefix for spilled payload files.
const SPILL_PREFIX: &str = "forkpool_task_";

/// Storage for oversized payloads.
///
/// `take` is destructive: a payload can be consumed at most once.
pub trait BlobStore {
    /// Persist `bytes` and return a reference to them.
    fn put(&self, bytes: &[u8]) -> Result<PathBuf>;

    /// Read the payload behind `path` and delete it.
    fn take(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Blob store backed by files in a temporary directory.
#[derive(Debug, Clone)]
pub struct TempFileStore {
    dir: PathBuf,
}

impl TempFileStore {
    /// Store blobs in the system temporary directory.
    pub fn new() -> Self {
        Self {
            dir: std::env::temp_dir(),
        }
    }

    /// Store blobs in `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Default for TempFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for TempFileStore {
    fn put(&self, bytes: &[u8]) -> Result<PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix(SPILL_PREFIX)
            .tempfile_in(&self.dir)?;
        file.write_all(bytes)?;
        file.flush()?;

        // The child deletes the file once it has read it.
        let (_, path) = file.keep().map_err(|e| ForkpoolError::Io(e.error))?;
        tracing::trace!(path = %path.display(), bytes = bytes.len(), "Spilled task payload");
        Ok(path)
    }

    fn take(&self, path: &Path) -> Result<Vec<u8>> {
        let bytes = std::fs::read(path).map_err(|source| ForkpoolError::SpilloverMissing {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::remove_file(path).map_err(|source| ForkpoolError::SpilloverMissing {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(bytes)
    }
}
