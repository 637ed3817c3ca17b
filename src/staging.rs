//! The per-build staging directory.
//!
//! A [`StagingDir`] is created fresh for one build and removed, with all of
//! its contents, when the guard is dropped. Success, error and panic paths
//! all go through `Drop`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::error::{BuildError, Result};

const STAGING_PREFIX: &str = "hostiso-staging";

/// Exclusively owned staging tree.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Create a new, empty staging directory under `parent`.
    ///
    /// The name embeds the process id and a timestamp so two builds never
    /// share a tree. A leftover directory with the same name is removed
    /// first.
    pub fn create_in(parent: &Path) -> Result<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let name = format!("{}-{}-{}", STAGING_PREFIX, std::process::id(), nanos);
        let path = parent.join(name);

        let staging_err = |source| BuildError::Staging {
            path: parent.to_path_buf(),
            source,
        };

        // Clean up if it exists from a previous run
        if path.exists() {
            fs::remove_dir_all(&path).map_err(staging_err)?;
        }
        fs::create_dir_all(&path).map_err(staging_err)?;

        // Canonical form so exclusion patterns match what the copy tool sees.
        let path = fs::canonicalize(&path).map_err(staging_err)?;
        debug!("staging directory: {}", path.display());

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "failed to remove staging directory {}: {}",
                    self.path.display(),
                    e
                );
            }
        } else {
            debug!("removed staging directory {}", self.path.display());
        }
    }
}
