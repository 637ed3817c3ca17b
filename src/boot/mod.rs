//! Boot support for the staging tree.
//!
//! - `assets` - make sure a kernel and initrd exist under `boot/`
//! - `grub` - write the bootloader configuration that references them

pub mod assets;
pub mod grub;

pub use assets::{resolve_boot_assets, AssetSources, BootAssets};
pub use grub::{write_boot_config, BootConfigOutcome, PrimaryConfig};
