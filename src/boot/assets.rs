//! Kernel and initrd resolution.
//!
//! Each asset goes through lookup, install-if-missing, second lookup. A second
//! miss is final.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;
use serde::Serialize;

use crate::error::{BootAssetKind, BuildError, Result};
use crate::packages::{BootRegenerator, PackageManager};
use crate::report::{self, Reporter};

/// Canonical kernel file name under `boot/`.
pub const KERNEL_NAME: &str = "vmlinuz";
/// Versioned kernels on the host, e.g. `vmlinuz-6.1.0-18-amd64`.
const KERNEL_VERSIONED_PREFIX: &str = "vmlinuz-";
/// Initrd files start with this, e.g. `initrd.img-6.1.0-18-amd64`.
pub const INITRD_PREFIX: &str = "initrd";

/// Kernel and initrd file names, relative to `boot/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootAssets {
    pub kernel: String,
    pub initrd: String,
}

/// Collaborators used when an asset is missing from the snapshot.
pub struct AssetSources<'a> {
    pub packages: &'a mut dyn PackageManager,
    pub regenerator: &'a mut dyn BootRegenerator,
    /// The live host's boot directory, where installs land.
    pub host_boot: &'a Path,
    pub kernel_package: &'a str,
    pub initrd_package: &'a str,
}

/// A file that could serve as a boot asset, with its modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub timestamp: SystemTime,
}

/// Newest candidate; ties go to the lexicographically greater name.
pub fn pick_newest(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates
        .iter()
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)))
}

/// Regular files in `dir` whose names start with `prefix`.
///
/// A missing directory yields no candidates.
fn candidates_in(dir: &Path, prefix: &str) -> Result<Vec<Candidate>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(BuildError::Io {
                context: format!("listing {}", dir.display()),
                source: e,
            })
        }
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(BuildError::io(format!("listing {}", dir.display())))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) {
            continue;
        }
        // Follows symlinks: a link to a regular file counts.
        let Ok(meta) = entry.path().metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        // Snapshot copies keep mtime but get a fresh birth time.
        let timestamp = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        found.push(Candidate { name, timestamp });
    }
    Ok(found)
}

/// `boot/vmlinuz` if present.
pub fn find_kernel(boot_dir: &Path) -> Option<String> {
    boot_dir
        .join(KERNEL_NAME)
        .is_file()
        .then(|| KERNEL_NAME.to_string())
}

/// Newest `initrd*` file in `boot_dir`.
pub fn find_initrd(boot_dir: &Path) -> Result<Option<String>> {
    let candidates = candidates_in(boot_dir, INITRD_PREFIX)?;
    Ok(pick_newest(&candidates).map(|c| c.name.clone()))
}

/// Ensure the staging tree has a kernel and initrd.
///
/// When a lookup succeeds no package manager call is made. Otherwise the
/// newest matching package is installed on the host, boot files are
/// regenerated and copied into the staging tree, and the lookup runs again.
pub fn resolve_boot_assets(
    staging_root: &Path,
    sources: &mut AssetSources<'_>,
    reporter: &mut dyn Reporter,
) -> Result<BootAssets> {
    let boot_dir = staging_root.join("boot");

    let kernel = match find_kernel(&boot_dir) {
        Some(k) => k,
        None => {
            report::warn(reporter, "No kernel in snapshot, installing one");
            install(BootAssetKind::Kernel, sources, reporter)?;
            copy_kernel_from_host(sources.host_boot, &boot_dir)?;
            find_kernel(&boot_dir).ok_or_else(|| BuildError::Unresolved {
                asset: BootAssetKind::Kernel,
                detail: format!("{} still missing after install", boot_dir.join(KERNEL_NAME).display()),
            })?
        }
    };
    report::info(reporter, format!("Kernel: boot/{}", kernel));

    let initrd = match find_initrd(&boot_dir)? {
        Some(i) => i,
        None => {
            report::warn(reporter, "No initrd in snapshot, installing one");
            install(BootAssetKind::Initrd, sources, reporter)?;
            copy_initrd_from_host(sources.host_boot, &boot_dir)?;
            find_initrd(&boot_dir)?.ok_or_else(|| BuildError::Unresolved {
                asset: BootAssetKind::Initrd,
                detail: format!("no {}* file in {} after install", INITRD_PREFIX, boot_dir.display()),
            })?
        }
    };
    report::info(reporter, format!("Initrd: boot/{}", initrd));

    Ok(BootAssets { kernel, initrd })
}

fn install(
    kind: BootAssetKind,
    sources: &mut AssetSources<'_>,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let prefix = match kind {
        BootAssetKind::Kernel => sources.kernel_package,
        BootAssetKind::Initrd => sources.initrd_package,
    };

    let package = sources
        .packages
        .find_newest(prefix)?
        .ok_or_else(|| BuildError::NoPackage {
            prefix: prefix.to_string(),
        })?;
    report::info(
        reporter,
        format!("Installing {} {} ({})", kind, package.name, package.version),
    );

    sources.packages.mark_install(&package)?;
    sources.packages.commit()?;

    match kind {
        BootAssetKind::Kernel => sources.regenerator.regenerate_kernel_boot(),
        BootAssetKind::Initrd => sources.regenerator.regenerate_initrd(),
    }
}

fn copy_into_staging(src: &Path, dest: PathBuf) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(BuildError::io(format!("creating {}", parent.display())))?;
    }
    debug!("copying {} -> {}", src.display(), dest.display());
    fs::copy(src, &dest).map_err(BuildError::io(format!(
        "copying {} to {}",
        src.display(),
        dest.display()
    )))?;
    Ok(())
}

/// Host `vmlinuz` if present, else the newest `vmlinuz-*`, stored as `vmlinuz`.
fn copy_kernel_from_host(host_boot: &Path, boot_dir: &Path) -> Result<()> {
    let canonical = host_boot.join(KERNEL_NAME);
    let source = if canonical.is_file() {
        Some(canonical)
    } else {
        let candidates = candidates_in(host_boot, KERNEL_VERSIONED_PREFIX)?;
        pick_newest(&candidates).map(|c| host_boot.join(&c.name))
    };

    match source {
        Some(src) => copy_into_staging(&src, boot_dir.join(KERNEL_NAME)),
        None => {
            debug!("no kernel found in {}", host_boot.display());
            Ok(())
        }
    }
}

fn copy_initrd_from_host(host_boot: &Path, boot_dir: &Path) -> Result<()> {
    let candidates = candidates_in(host_boot, INITRD_PREFIX)?;
    match pick_newest(&candidates) {
        Some(c) => copy_into_staging(&host_boot.join(&c.name), boot_dir.join(&c.name)),
        None => {
            debug!("no initrd found in {}", host_boot.display());
            Ok(())
        }
    }
}
