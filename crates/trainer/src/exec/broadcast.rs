//! Broadcast handles and per-iteration resource tracking
//!
//! Every per-iteration read-only datum travels into partition closures
//! as a [`Broadcast`] handle; spill files created for the iteration are
//! registered with the [`ResourceCleaner`] and released when the
//! iteration ends, on every exit path.

use parking_lot::Mutex;
use std::fs;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use thicket_core::{GbmError, Result};
use tracing::warn;

/// Shared read-only value visible to every partition task.
#[derive(Debug)]
pub struct Broadcast<T>(Arc<T>);

impl<T> Broadcast<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Deref for Broadcast<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Registry of disposable per-iteration resources.
#[derive(Debug, Default)]
pub struct ResourceCleaner {
    files: Mutex<Vec<PathBuf>>,
}

impl ResourceCleaner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track spill files for release at iteration end.
    pub fn register_files(&self, files: Vec<PathBuf>) {
        self.files.lock().extend(files);
    }

    /// Delete every tracked file. With `blocking = false` failures are
    /// logged and swallowed; with `blocking = true` the first failure
    /// is returned after attempting the rest.
    pub fn clear(&self, blocking: bool) -> Result<()> {
        let files: Vec<PathBuf> = std::mem::take(&mut *self.files.lock());
        let mut first_err: Option<GbmError> = None;
        for path in files {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() == std::io::ErrorKind::NotFound {
                    continue;
                }
                if blocking {
                    first_err.get_or_insert_with(|| {
                        GbmError::Checkpoint(format!("remove {}: {e}", path.display()))
                    });
                } else {
                    warn!(path = %path.display(), error = %e, "spill cleanup failed");
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shares_value() {
        let b = Broadcast::new(vec![1, 2, 3]);
        let c = b.clone();
        assert_eq!(*b, *c);
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn test_cleaner_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        fs::write(&path, b"x").unwrap();
        let cleaner = ResourceCleaner::new();
        cleaner.register_files(vec![path.clone()]);
        cleaner.clear(true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_cleaner_swallows_missing_files() {
        let cleaner = ResourceCleaner::new();
        cleaner.register_files(vec![PathBuf::from("/nonexistent/thicket-spill.bin")]);
        assert!(cleaner.clear(false).is_ok());
    }
}
