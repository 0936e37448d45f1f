//! Removal of temporary filesystem entries on scope exit.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Removes the wrapped path when dropped, on every exit path.
#[derive(Debug)]
pub(crate) struct ScopedPath {
    path: PathBuf,
}

impl ScopedPath {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedPath {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed reply endpoint"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove reply endpoint"
            ),
        }
    }
}
