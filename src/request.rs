//! Build request model and output-path normalisation.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use crate::error::{BuildError, Result};

/// Extension every produced image carries.
pub const IMAGE_EXTENSION: &str = "iso";

/// Operating system class of the image to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TargetOs {
    Linux,
    /// Recognised, rejected by the pipeline.
    Windows,
}

impl FromStr for TargetOs {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            other => Err(format!("unknown target OS '{}'", other)),
        }
    }
}

impl fmt::Display for TargetOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "Linux"),
            Self::Windows => write!(f, "Windows"),
        }
    }
}

/// How much the snapshot is customised before mastering.
///
/// `Minimal` and `Moderate` behave identically. `Full` is reserved and
/// currently runs the same path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Customization {
    #[default]
    Minimal,
    Moderate,
    Full,
}

impl FromStr for Customization {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(Self::Minimal),
            "moderate" => Ok(Self::Moderate),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown customization level '{}'", other)),
        }
    }
}

/// Encryption passphrase. Never printed; its buffer is overwritten on drop.
///
/// Copies made before the value was wrapped (terminal buffers, the process
/// environment) are outside its reach.
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

impl Drop for Passphrase {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.0).into_bytes();
        wipe(&mut bytes);
    }
}

/// Zero `bytes` with writes the optimiser may not drop.
pub(crate) fn wipe(bytes: &mut [u8]) {
    for byte in bytes.iter_mut() {
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

/// A fully resolved build request.
#[derive(Debug)]
pub struct BuildRequest {
    pub target: TargetOs,
    pub output: PathBuf,
    pub customization: Customization,
    pub passphrase: Option<Passphrase>,
    /// Exclusion patterns on top of the mandatory set.
    pub extra_exclusions: Vec<String>,
    /// Replace an existing file at the output path.
    pub overwrite: bool,
    /// Write `<image>.sha512` next to the image.
    pub checksum: bool,
}

impl BuildRequest {
    pub fn linux(output: impl Into<PathBuf>) -> Self {
        Self {
            target: TargetOs::Linux,
            output: output.into(),
            customization: Customization::default(),
            passphrase: None,
            extra_exclusions: Vec::new(),
            overwrite: false,
            checksum: true,
        }
    }

    pub fn encrypted(&self) -> bool {
        self.passphrase.is_some()
    }
}

/// Force the image extension onto `path`.
///
/// `/tmp/out` becomes `/tmp/out.iso`; any other extension is replaced.
pub fn normalize_output_path(path: &Path) -> Result<PathBuf> {
    let has_name = path
        .file_name()
        .map(|n| !n.to_string_lossy().trim().is_empty())
        .unwrap_or(false);
    if !has_name {
        return Err(BuildError::InvalidOutput {
            path: path.to_path_buf(),
            reason: "no file name".to_string(),
        });
    }

    let is_image = path
        .extension()
        .map(|ext| ext == IMAGE_EXTENSION)
        .unwrap_or(false);
    if is_image {
        Ok(path.to_path_buf())
    } else {
        Ok(path.with_extension(IMAGE_EXTENSION))
    }
}

/// Normalise the output path and check that it can be written.
///
/// The result is absolute: the canonical parent directory joined with the
/// image name. The parent must exist and accept new files. An existing image
/// is only accepted with `overwrite`.
pub fn prepare_output_path(path: &Path, overwrite: bool) -> Result<PathBuf> {
    let output = normalize_output_path(path)?;

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !parent.is_dir() {
        return Err(BuildError::InvalidOutput {
            path: output,
            reason: format!("parent directory '{}' does not exist", parent.display()),
        });
    }
    let parent = fs::canonicalize(&parent).map_err(|e| BuildError::InvalidOutput {
        path: output.clone(),
        reason: format!("cannot resolve '{}': {}", parent.display(), e),
    })?;
    let output = match output.file_name() {
        Some(name) => parent.join(name),
        None => {
            return Err(BuildError::InvalidOutput {
                path: output,
                reason: "no file name".to_string(),
            })
        }
    };

    let marker = parent.join(format!(".hostiso-write-test-{}", std::process::id()));
    match fs::write(&marker, b"") {
        Ok(()) => {
            let _ = fs::remove_file(&marker);
        }
        Err(e) => {
            return Err(BuildError::InvalidOutput {
                path: output,
                reason: format!("parent directory '{}' is not writable: {}", parent.display(), e),
            });
        }
    }

    if output.is_dir() {
        return Err(BuildError::InvalidOutput {
            path: output,
            reason: "is a directory".to_string(),
        });
    }
    if output.exists() && !overwrite {
        return Err(BuildError::OutputExists(output));
    }

    Ok(output)
}
