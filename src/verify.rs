//! Boot-sector check for produced images.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use crate::error::{BuildError, Result};

/// Bytes in the first sector.
pub const SECTOR_SIZE: usize = 512;
/// Little-endian value of bytes 510..512 on a bootable image.
pub const BOOT_SIGNATURE: u16 = 0xAA55;

/// Whether the image's first sector ends with the boot signature.
///
/// An unreadable or short file is an error, not `Ok(false)`.
pub fn verify_bootable(image: &Path) -> Result<bool> {
    let mut file =
        File::open(image).map_err(BuildError::io(format!("opening {}", image.display())))?;

    let mut sector = [0u8; SECTOR_SIZE];
    let mut filled = 0;
    while filled < SECTOR_SIZE {
        match file.read(&mut sector[filled..]) {
            Ok(0) => {
                return Err(BuildError::ShortRead {
                    path: image.to_path_buf(),
                    len: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(BuildError::Io {
                    context: format!("reading boot sector of {}", image.display()),
                    source: e,
                })
            }
        }
    }

    Ok(u16::from_le_bytes([sector[510], sector[511]]) == BOOT_SIGNATURE)
}
