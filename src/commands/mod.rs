//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Snapshot the host into an image
//! - `verify` - Check an image's boot sector
//! - `show` - Display information
//! - `preflight` - Run preflight checks

pub mod build;
mod preflight;
pub mod show;
mod verify;

pub use build::{cmd_build, BuildArgs};
pub use preflight::cmd_preflight;
pub use show::cmd_show;
pub use verify::cmd_verify;
