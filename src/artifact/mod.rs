//! Build artifacts.
//!
//! - `iso` - masters the staging tree into the output image and writes
//!   its checksum sidecar

pub mod iso;

pub use iso::{assemble_image, write_checksum, AssemblyOptions};
