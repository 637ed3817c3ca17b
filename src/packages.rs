//! Package-management and boot-regeneration collaborators.
//!
//! The boot asset resolver only talks to the [`PackageManager`] and
//! [`BootRegenerator`] traits. The shipped implementations drive
//! `apt-cache`/`apt-get` and plain command lines.

use std::cmp::Ordering;

use log::debug;

use crate::error::{BuildError, Result};
use crate::process::Cmd;

/// An installable package and its candidate version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: String,
}

pub trait PackageManager {
    /// Newest installable package whose name starts with `prefix`.
    fn find_newest(&mut self, prefix: &str) -> Result<Option<Package>>;

    fn mark_install(&mut self, package: &Package) -> Result<()>;

    /// Install everything marked so far.
    fn commit(&mut self) -> Result<()>;
}

pub trait BootRegenerator {
    /// Refresh the bootloader after a kernel install.
    fn regenerate_kernel_boot(&mut self) -> Result<()>;

    /// Rebuild the initial ramdisk.
    fn regenerate_initrd(&mut self) -> Result<()>;
}

/// Debian/Ubuntu package manager.
#[derive(Debug, Clone)]
pub struct AptPackageManager {
    apt_cache: String,
    apt_get: String,
    marked: Vec<String>,
}

impl AptPackageManager {
    pub fn new() -> Self {
        Self {
            apt_cache: "apt-cache".to_string(),
            apt_get: "apt-get".to_string(),
            marked: Vec::new(),
        }
    }
}

impl Default for AptPackageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageManager for AptPackageManager {
    fn find_newest(&mut self, prefix: &str) -> Result<Option<Package>> {
        let names = Cmd::new(&self.apt_cache)
            .args(["pkgnames", prefix])
            .run()?;
        let names: Vec<&str> = names
            .stdout
            .lines()
            .map(str::trim)
            .filter(|n| n.starts_with(prefix))
            .collect();
        if names.is_empty() {
            return Ok(None);
        }

        let policy = Cmd::new(&self.apt_cache).arg("policy").args(&names).run()?;
        let candidates = parse_policy_candidates(&policy.stdout);
        debug!("{} candidates for '{}'", candidates.len(), prefix);
        Ok(newest_package(candidates))
    }

    fn mark_install(&mut self, package: &Package) -> Result<()> {
        if !self.marked.contains(&package.name) {
            self.marked.push(package.name.clone());
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.marked.is_empty() {
            return Ok(());
        }
        Cmd::new(&self.apt_get)
            .args(["install", "-y"])
            .args(&self.marked)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .label("apt-get install")
            .run()?;
        self.marked.clear();
        Ok(())
    }
}

/// Parse `apt-cache policy` output into (name, candidate version) pairs.
///
/// Packages without a candidate (`(none)`) are dropped.
pub fn parse_policy_candidates(output: &str) -> Vec<Package> {
    let mut packages = Vec::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        if !line.starts_with(char::is_whitespace) {
            current = line.trim().strip_suffix(':').map(str::to_string);
            continue;
        }
        let Some(version) = line.trim().strip_prefix("Candidate:") else {
            continue;
        };
        let version = version.trim();
        if let Some(name) = current.take() {
            if !version.is_empty() && version != "(none)" {
                packages.push(Package {
                    name,
                    version: version.to_string(),
                });
            }
        }
    }
    packages
}

/// Highest version wins; equal versions resolve to the greater name.
pub fn newest_package(packages: Vec<Package>) -> Option<Package> {
    packages.into_iter().max_by(|a, b| {
        compare_versions(&a.version, &b.version).then_with(|| a.name.cmp(&b.name))
    })
}

/// Order two Debian version strings (`[epoch:]upstream[-revision]`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a_epoch, a_upstream, a_rev) = split_version(a);
    let (b_epoch, b_upstream, b_rev) = split_version(b);

    a_epoch
        .cmp(&b_epoch)
        .then_with(|| compare_fragment(a_upstream, b_upstream))
        .then_with(|| compare_fragment(a_rev, b_rev))
}

fn split_version(v: &str) -> (u64, &str, &str) {
    let v = v.trim();
    let (epoch, rest) = match v.split_once(':') {
        Some((e, rest)) => (e.parse().unwrap_or(0), rest),
        None => (0, v),
    };
    match rest.rsplit_once('-') {
        Some((upstream, rev)) => (epoch, upstream, rev),
        None => (epoch, rest, ""),
    }
}

// `~` sorts before everything, even the end of the string; letters sort
// before other symbols.
fn char_order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(b'~') => -1,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(c) => c as i32 + 256,
    }
}

fn compare_fragment(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);
    let is_digit = |s: &[u8], k: usize| k < s.len() && s[k].is_ascii_digit();

    while i < a.len() || j < b.len() {
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let ac = char_order(a.get(i).copied());
            let bc = char_order(b.get(j).copied());
            if ac != bc {
                return ac.cmp(&bc);
            }
            i += 1;
            j += 1;
        }

        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }

        let mut first_diff = Ordering::Equal;
        while is_digit(a, i) && is_digit(b, j) {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
        if is_digit(a, i) {
            return Ordering::Greater;
        }
        if is_digit(b, j) {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }
    Ordering::Equal
}

/// Regenerates boot files by running configured command lines.
#[derive(Debug, Clone)]
pub struct CommandRegenerator {
    kernel_boot: String,
    initrd: String,
}

impl CommandRegenerator {
    pub fn new(kernel_boot: impl Into<String>, initrd: impl Into<String>) -> Self {
        Self {
            kernel_boot: kernel_boot.into(),
            initrd: initrd.into(),
        }
    }

    fn run_line(line: &str, what: &str) -> Result<()> {
        let Some(cmd) = Cmd::from_command_line(line) else {
            return Err(BuildError::Tool {
                tool: what.to_string(),
                code: -1,
                output: "no command configured".to_string(),
            });
        };
        cmd.label(what).run()?;
        Ok(())
    }
}

impl Default for CommandRegenerator {
    fn default() -> Self {
        Self::new("update-grub", "update-initramfs -u")
    }
}

impl BootRegenerator for CommandRegenerator {
    fn regenerate_kernel_boot(&mut self) -> Result<()> {
        Self::run_line(&self.kernel_boot, "bootloader regeneration")
    }

    fn regenerate_initrd(&mut self) -> Result<()> {
        Self::run_line(&self.initrd, "initrd regeneration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert_eq!(compare_versions("6.1.76-1", "6.1.69-1"), Ordering::Greater);
        assert_eq!(compare_versions("6.1.10", "6.1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1:1.0", "2.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0~rc1", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0a", "1.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0-1", "1.0-1"), Ordering::Equal);
        assert_eq!(compare_versions("0.140ubuntu13", "0.140ubuntu2"), Ordering::Greater);
        assert_eq!(compare_versions("1.01", "1.1"), Ordering::Equal);
    }

    #[test]
    fn test_parse_policy() {
        let out = "\
linux-image-6.1.0-17-amd64:
  Installed: (none)
  Candidate: 6.1.69-1
  Version table:
     6.1.69-1 500
linux-image-6.1.0-18-amd64:
  Installed: (none)
  Candidate: 6.1.76-1
linux-image-rt-amd64:
  Installed: (none)
  Candidate: (none)
";
        let pkgs = parse_policy_candidates(out);
        assert_eq!(pkgs.len(), 2);
        let newest = newest_package(pkgs).unwrap();
        assert_eq!(newest.name, "linux-image-6.1.0-18-amd64");
        assert_eq!(newest.version, "6.1.76-1");
    }

    #[test]
    fn test_newest_tie_prefers_greater_name() {
        let pkgs = vec![
            Package {
                name: "initramfs-tools".into(),
                version: "0.142".into(),
            },
            Package {
                name: "initramfs-tools-core".into(),
                version: "0.142".into(),
            },
        ];
        assert_eq!(newest_package(pkgs).unwrap().name, "initramfs-tools-core");
    }

    #[test]
    fn test_mark_install_deduplicates() {
        let mut apt = AptPackageManager::new();
        let pkg = Package {
            name: "initramfs-tools".into(),
            version: "0.142".into(),
        };
        apt.mark_install(&pkg).unwrap();
        apt.mark_install(&pkg).unwrap();
        assert_eq!(apt.marked, ["initramfs-tools"]);
    }

    #[test]
    fn test_regenerator_reports_failing_command() {
        let mut regen = CommandRegenerator::new("false", "true");
        regen.regenerate_initrd().unwrap();
        let err = regen.regenerate_kernel_boot().unwrap_err();
        assert!(matches!(err, BuildError::Tool { code: 1, .. }));
    }

    #[test]
    fn test_regenerator_empty_command_is_error() {
        let mut regen = CommandRegenerator::new("  ", "true");
        assert!(regen.regenerate_kernel_boot().is_err());
    }
}
