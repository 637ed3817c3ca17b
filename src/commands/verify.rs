//! Verify command - checks an existing image's boot sector.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::verify::verify_bootable;

/// Execute the verify command. Fails unless the image is bootable.
pub fn cmd_verify(image: &Path) -> Result<()> {
    let bootable = verify_bootable(image)
        .with_context(|| format!("Cannot check {}", image.display()))?;
    if !bootable {
        bail!("{} has no boot signature", image.display());
    }
    println!("{}: boot signature OK", image.display());
    Ok(())
}
