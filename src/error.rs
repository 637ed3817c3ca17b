//! Error taxonomy for the image build pipeline.
//!
//! Stage functions return [`BuildError`]; only the orchestrator decides
//! whether a build failed, and only the CLI turns that into an exit code.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the pipeline.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Which boot asset a resolution error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAssetKind {
    Kernel,
    Initrd,
}

impl std::fmt::Display for BootAssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kernel => write!(f, "kernel"),
            Self::Initrd => write!(f, "initrd"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    // Preconditions: reported before anything destructive happens.
    #[error("invalid output path '{path}': {reason}")]
    InvalidOutput { path: PathBuf, reason: String },

    #[error("output image '{0}' already exists (pass --overwrite to replace it)")]
    OutputExists(PathBuf),

    #[error("{0} images are not supported yet")]
    Unsupported(String),

    #[error("cannot create staging directory under '{path}': {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // External tools.
    #[error("failed to execute '{tool}'. Is it installed? ({source})")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} failed (exit code {code}){}", format_output(.output))]
    Tool {
        tool: String,
        code: i32,
        output: String,
    },

    // Logical resolution failures: no external process failed.
    #[error("boot asset unresolved: {asset} ({detail})")]
    Unresolved { asset: BootAssetKind, detail: String },

    #[error("no installable package matches '{prefix}'")]
    NoPackage { prefix: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("'{path}' is too short to hold a boot sector ({len} bytes read)")]
    ShortRead { path: PathBuf, len: usize },
}

fn format_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{}", trimmed)
    }
}

impl BuildError {
    /// Build a `map_err` adapter that attaches context to an I/O error.
    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> BuildError {
        let context = context.into();
        move |source| BuildError::Io { context, source }
    }

    /// True for errors raised before any destructive action.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidOutput { .. }
                | Self::OutputExists(_)
                | Self::Unsupported(_)
                | Self::Staging { .. }
        )
    }

    /// True when an external process failed or could not be started.
    pub fn is_tool_failure(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Tool { .. })
    }
}
