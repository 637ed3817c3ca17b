//! Configuration management for hostiso.
//!
//! Reads configuration from environment variables. `main` loads a `.env`
//! file first, so values there act as defaults that the real environment
//! overrides.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_SOURCE_ROOT: &str = "/";
pub const DEFAULT_HOST_BOOT: &str = "/boot";
pub const DEFAULT_RSYNC: &str = "rsync";
pub const DEFAULT_MASTERING_TOOL: &str = "xorriso";
pub const DEFAULT_VOLUME_LABEL: &str = "HOSTISO";
pub const DEFAULT_ISOHYBRID_MBR: &str = "/usr/lib/ISOLINUX/isohdpfx.bin";
pub const DEFAULT_CIPHER: &str = "aes256";
pub const DEFAULT_BOOTLOADER_CMD: &str = "update-grub";
pub const DEFAULT_INITRD_CMD: &str = "update-initramfs -u";
pub const DEFAULT_KERNEL_PACKAGE: &str = "linux-image-";
pub const DEFAULT_INITRD_PACKAGE: &str = "initramfs-tools";

/// Which copier snapshots the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CopyTool {
    #[default]
    Rsync,
    Builtin,
}

impl FromStr for CopyTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rsync" => Ok(Self::Rsync),
            "builtin" | "walk" => Ok(Self::Builtin),
            other => Err(format!("unknown copy tool '{}' (expected rsync or builtin)", other)),
        }
    }
}

impl fmt::Display for CopyTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsync => write!(f, "rsync"),
            Self::Builtin => write!(f, "builtin"),
        }
    }
}

/// hostiso configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the tree to snapshot (default: /)
    pub source_root: PathBuf,
    /// Host boot directory that package installs write to (default: /boot)
    pub host_boot: PathBuf,
    /// Parent of the per-build staging directory (default: system temp dir)
    pub staging_parent: PathBuf,
    pub copy_tool: CopyTool,
    pub rsync: String,
    pub mastering_tool: String,
    pub volume_label: String,
    pub isohybrid_mbr: PathBuf,
    pub cipher: String,
    /// Bootloader regeneration command line (default: update-grub)
    pub bootloader_cmd: String,
    /// Initrd regeneration command line (default: update-initramfs -u)
    pub initrd_cmd: String,
    pub kernel_package: String,
    pub initrd_package: String,
    /// Variables that held unusable values and were replaced by defaults.
    pub ignored: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_vars(HashMap::new())
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Self {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build configuration from a variable map, filling in defaults.
    pub fn from_vars(vars: HashMap<String, String>) -> Self {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let string = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let path = |key: &str, default: &str| PathBuf::from(string(key, default));

        let mut ignored = Vec::new();
        let copy_tool = match get("HOSTISO_COPY_TOOL") {
            Some(v) => v.parse().unwrap_or_else(|_| {
                ignored.push(format!("HOSTISO_COPY_TOOL={}", v));
                CopyTool::default()
            }),
            None => CopyTool::default(),
        };

        Self {
            source_root: path("HOSTISO_SOURCE_ROOT", DEFAULT_SOURCE_ROOT),
            host_boot: path("HOSTISO_HOST_BOOT", DEFAULT_HOST_BOOT),
            staging_parent: get("HOSTISO_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            copy_tool,
            rsync: string("HOSTISO_RSYNC", DEFAULT_RSYNC),
            mastering_tool: string("HOSTISO_MASTERING_TOOL", DEFAULT_MASTERING_TOOL),
            volume_label: string("HOSTISO_VOLUME_LABEL", DEFAULT_VOLUME_LABEL),
            isohybrid_mbr: path("HOSTISO_ISOHYBRID_MBR", DEFAULT_ISOHYBRID_MBR),
            cipher: string("HOSTISO_CIPHER", DEFAULT_CIPHER),
            bootloader_cmd: string("HOSTISO_BOOTLOADER_CMD", DEFAULT_BOOTLOADER_CMD),
            initrd_cmd: string("HOSTISO_INITRD_CMD", DEFAULT_INITRD_CMD),
            kernel_package: string("HOSTISO_KERNEL_PACKAGE", DEFAULT_KERNEL_PACKAGE),
            initrd_package: string("HOSTISO_INITRD_PACKAGE", DEFAULT_INITRD_PACKAGE),
            ignored,
        }
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  HOSTISO_SOURCE_ROOT: {}", self.source_root.display());
        println!("  HOSTISO_HOST_BOOT: {}", self.host_boot.display());
        println!("  HOSTISO_STAGING_DIR: {}", self.staging_parent.display());
        println!("  HOSTISO_COPY_TOOL: {}", self.copy_tool);
        println!("  HOSTISO_RSYNC: {}", self.rsync);
        println!("  HOSTISO_MASTERING_TOOL: {}", self.mastering_tool);
        println!("  HOSTISO_VOLUME_LABEL: {}", self.volume_label);
        println!("  HOSTISO_ISOHYBRID_MBR: {}", self.isohybrid_mbr.display());
        if !self.isohybrid_mbr.is_file() {
            println!("    (not found - images will not be hybrid)");
        }
        println!("  HOSTISO_CIPHER: {}", self.cipher);
        println!("  HOSTISO_BOOTLOADER_CMD: {}", self.bootloader_cmd);
        println!("  HOSTISO_INITRD_CMD: {}", self.initrd_cmd);
        println!("  HOSTISO_KERNEL_PACKAGE: {}", self.kernel_package);
        println!("  HOSTISO_INITRD_PACKAGE: {}", self.initrd_package);
        for bad in &self.ignored {
            println!("  [WARN] ignored {}", bad);
        }
    }
}
