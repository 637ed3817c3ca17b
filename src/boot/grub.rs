//! GRUB configuration for the staging tree.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use super::assets::BootAssets;
use crate::error::{BuildError, Result};
use crate::report::{self, Reporter};

/// Primary config, relative to the staging root.
pub const GRUB_CFG: &str = "boot/grub/grub.cfg";
/// Rescue config for booting from the image file itself.
pub const LOOPBACK_CFG: &str = "boot/grub/loopback.cfg";

/// Kernel command-line flag that selects the installer entry.
const INSTALL_FLAG: &str = "install";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryConfig {
    Written,
    /// An existing `grub.cfg` from the snapshot was left alone.
    Preserved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootConfigOutcome {
    pub grub_cfg: PathBuf,
    pub primary: PrimaryConfig,
    pub rescue: Option<PathBuf>,
}

/// Render the two-entry menu: "Try" and "Install".
pub fn render_grub_cfg(assets: &BootAssets, label: &str) -> String {
    format!(
        r#"set timeout=10
set default=0

menuentry "Try {label}" {{
    linux /boot/{kernel}
    initrd /boot/{initrd}
}}

menuentry "Install {label}" {{
    linux /boot/{kernel} {flag}
    initrd /boot/{initrd}
}}
"#,
        label = label,
        kernel = assets.kernel,
        initrd = assets.initrd,
        flag = INSTALL_FLAG,
    )
}

/// Render the rescue config that loop-mounts the image at `image_path` and
/// boots from it. The path is the absolute output path, as seen from the
/// root of the filesystem the image is written to.
pub fn render_loopback_cfg(assets: &BootAssets, label: &str, image_path: &Path) -> String {
    format!(
        r#"menuentry "Rescue {label} (loopback)" {{
    loopback loop {image}
    linux (loop)/boot/{kernel}
    initrd (loop)/boot/{initrd}
}}
"#,
        label = label,
        image = image_path.display(),
        kernel = assets.kernel,
        initrd = assets.initrd,
    )
}

/// Write `boot/grub/grub.cfg` (unless present) and, for encrypted builds,
/// `boot/grub/loopback.cfg`.
pub fn write_boot_config(
    staging_root: &Path,
    assets: &BootAssets,
    output_image: &Path,
    encrypted: bool,
    label: &str,
    reporter: &mut dyn Reporter,
) -> Result<BootConfigOutcome> {
    let grub_cfg = staging_root.join(GRUB_CFG);
    let grub_dir = grub_cfg
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| staging_root.join("boot/grub"));
    fs::create_dir_all(&grub_dir)
        .map_err(BuildError::io(format!("creating {}", grub_dir.display())))?;

    let primary = if grub_cfg.exists() {
        report::info(reporter, format!("Keeping existing {}", GRUB_CFG));
        let existing = fs::read_to_string(&grub_cfg).unwrap_or_default();
        if !existing.contains(&assets.kernel) || !existing.contains(&assets.initrd) {
            report::warn(
                reporter,
                format!(
                    "Existing {} does not reference {} and {}",
                    GRUB_CFG, assets.kernel, assets.initrd
                ),
            );
        }
        PrimaryConfig::Preserved
    } else {
        fs::write(&grub_cfg, render_grub_cfg(assets, label))
            .map_err(BuildError::io(format!("writing {}", grub_cfg.display())))?;
        debug!("wrote {}", grub_cfg.display());
        PrimaryConfig::Written
    };

    let rescue = if encrypted {
        let loopback = staging_root.join(LOOPBACK_CFG);
        fs::write(&loopback, render_loopback_cfg(assets, label, output_image))
            .map_err(BuildError::io(format!("writing {}", loopback.display())))?;
        report::info(reporter, format!("Wrote rescue {}", LOOPBACK_CFG));
        Some(loopback)
    } else {
        None
    };

    Ok(BootConfigOutcome {
        grub_cfg,
        primary,
        rescue,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RecordingReporter;
    use tempfile::TempDir;

    fn assets() -> BootAssets {
        BootAssets {
            kernel: "vmlinuz".into(),
            initrd: "initrd.img-6.1".into(),
        }
    }

    #[test]
    fn test_render_has_two_entries() {
        let cfg = render_grub_cfg(&assets(), "HOSTISO");
        assert_eq!(cfg.matches("menuentry").count(), 2);
        assert!(cfg.contains("menuentry \"Try HOSTISO\""));
        assert!(cfg.contains("linux /boot/vmlinuz install"));
        assert_eq!(cfg.matches("initrd /boot/initrd.img-6.1").count(), 2);
    }

    #[test]
    fn test_existing_config_is_preserved() {
        let temp = TempDir::new().unwrap();
        let cfg = temp.path().join(GRUB_CFG);
        fs::create_dir_all(cfg.parent().unwrap()).unwrap();
        fs::write(&cfg, "menuentry custom {}\n").unwrap();

        let mut rec = RecordingReporter::new();
        let out = write_boot_config(
            temp.path(),
            &assets(),
            Path::new("/out/host.iso"),
            false,
            "HOSTISO",
            &mut rec,
        )
        .unwrap();

        assert_eq!(out.primary, PrimaryConfig::Preserved);
        assert_eq!(fs::read_to_string(&cfg).unwrap(), "menuentry custom {}\n");
        assert_eq!(rec.warnings().len(), 1);
        assert!(out.rescue.is_none());
    }

    #[test]
    fn test_encrypted_writes_loopback() {
        let temp = TempDir::new().unwrap();
        let mut rec = RecordingReporter::new();
        let out = write_boot_config(
            temp.path(),
            &assets(),
            Path::new("/out/host.iso"),
            true,
            "HOSTISO",
            &mut rec,
        )
        .unwrap();

        assert_eq!(out.primary, PrimaryConfig::Written);
        let loopback = fs::read_to_string(out.rescue.unwrap()).unwrap();
        assert!(loopback.contains("loopback loop /out/host.iso\n"));
        assert!(loopback.contains("linux (loop)/boot/vmlinuz"));
    }

    #[test]
    fn test_loopback_keeps_nested_image_directory() {
        let cfg = render_loopback_cfg(&assets(), "HOSTISO", Path::new("/srv/images/host.iso"));
        assert!(cfg.contains("loopback loop /srv/images/host.iso\n"));
        assert!(!cfg.contains("loopback loop /host.iso"));
        assert!(cfg.contains("initrd (loop)/boot/initrd.img-6.1"));
    }
}
