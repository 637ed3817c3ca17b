//! hostiso library exports.
//!
//! The binary in `main.rs` is a thin clap front end over these modules;
//! integration tests drive the pipeline through them directly.

pub mod artifact;
pub mod boot;
pub mod commands;
pub mod config;
pub mod error;
pub mod exclude;
pub mod packages;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod report;
pub mod request;
pub mod snapshot;
pub mod staging;
pub mod timing;
pub mod verify;
mod xattrs;

pub use error::{BuildError, Result};
pub use pipeline::{BuildOutcome, Pipeline, Stage, Verification};
pub use request::BuildRequest;
