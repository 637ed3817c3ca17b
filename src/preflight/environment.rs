//! Build environment checks (privileges, directories, disk space).

use std::fs;
use std::path::Path;

use crate::boot::assets::{find_initrd, find_kernel};
use crate::config::Config;
use crate::process::Cmd;
use crate::snapshot::estimate_used_bytes;

use super::types::CheckResult;

const GIB: u64 = 1024 * 1024 * 1024;

/// Check the host environment the build runs in.
pub fn check_build_environment(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        results.push(CheckResult::pass("root privileges"));
    } else {
        results.push(CheckResult::fail(
            "root privileges",
            format!("Running as uid {} - snapshotting the host needs root", euid),
        ));
    }

    if config.source_root.is_dir() {
        results.push(CheckResult::pass_with(
            "source root",
            config.source_root.display().to_string(),
        ));
    } else {
        results.push(CheckResult::fail(
            "source root",
            format!("{} is not a directory", config.source_root.display()),
        ));
    }

    results.push(check_host_boot(&config.host_boot));
    results.push(check_writable(&config.staging_parent));
    results.extend(check_disk_space(&config.source_root, &config.staging_parent));

    if config.isohybrid_mbr.is_file() {
        results.push(CheckResult::pass("hybrid MBR template"));
    } else {
        results.push(CheckResult::warn(
            "hybrid MBR template",
            format!(
                "{} not found - image will only boot from optical media. Install 'isolinux'.",
                config.isohybrid_mbr.display()
            ),
        ));
    }

    results
}

fn check_host_boot(host_boot: &Path) -> CheckResult {
    let kernel = find_kernel(host_boot);
    let initrd = find_initrd(host_boot).ok().flatten();
    match (kernel, initrd) {
        (Some(k), Some(i)) => CheckResult::pass_with("boot assets", format!("{}, {}", k, i)),
        _ => CheckResult::warn(
            "boot assets",
            format!(
                "No vmlinuz/initrd in {} - the build will install packages",
                host_boot.display()
            ),
        ),
    }
}

fn check_writable(dir: &Path) -> CheckResult {
    let name = "staging directory";
    if let Err(e) = fs::create_dir_all(dir) {
        return CheckResult::fail(name, format!("Cannot create {}: {}", dir.display(), e));
    }
    let test_file = dir.join(".hostiso-preflight-test");
    match fs::write(&test_file, "test") {
        Ok(()) => {
            let _ = fs::remove_file(&test_file);
            CheckResult::pass_with(name, dir.display().to_string())
        }
        Err(e) => CheckResult::fail(name, format!("Cannot write to {}: {}", dir.display(), e)),
    }
}

/// Compare free space under the staging parent with used space on the source.
fn check_disk_space(source_root: &Path, staging_parent: &Path) -> Option<CheckResult> {
    let result = Cmd::new("df")
        .args(["--output=avail", "-B1"])
        .arg_path(staging_parent)
        .allow_fail()
        .run()
        .ok()?;
    if !result.success() {
        return None;
    }
    // Skip header line
    let avail: u64 = result.stdout.lines().nth(1)?.trim().parse().ok()?;

    let Some(needed) = estimate_used_bytes(source_root) else {
        return Some(CheckResult::pass_with(
            "disk space",
            format!("{}GB free", avail / GIB),
        ));
    };
    // Staging copy plus the image itself.
    let needed = needed.saturating_mul(2);
    Some(if avail < needed {
        CheckResult::warn(
            "disk space",
            format!(
                "{}GB free - a full snapshot and image need about {}GB",
                avail / GIB,
                needed / GIB
            ),
        )
    } else {
        CheckResult::pass_with("disk space", format!("{}GB free", avail / GIB))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::types::CheckStatus;
    use tempfile::TempDir;

    #[test]
    fn test_writable_staging_parent() {
        let temp = TempDir::new().unwrap();
        let result = check_writable(&temp.path().join("nested/staging"));
        assert_eq!(result.status, CheckStatus::Pass);
    }

    #[test]
    fn test_boot_assets_found() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("vmlinuz"), "k").unwrap();
        fs::write(temp.path().join("initrd.img-6.1"), "i").unwrap();
        let result = check_host_boot(temp.path());
        assert_eq!(result.status, CheckStatus::Pass);
        assert_eq!(result.details.as_deref(), Some("vmlinuz, initrd.img-6.1"));
    }

    #[test]
    fn test_boot_assets_missing_is_warning() {
        let temp = TempDir::new().unwrap();
        assert_eq!(check_host_boot(temp.path()).status, CheckStatus::Warn);
    }
}
