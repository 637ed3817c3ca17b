//! Filesystem snapshotter.
//!
//! Copies the live root into the staging tree through a [`Copier`]:
//! - [`RsyncCopier`] - the default, drives `rsync` with archive flags
//! - [`WalkCopier`] - an in-process copier for hosts without rsync
//!
//! Both stay on one filesystem, honour the [`ExclusionSet`], keep hardlinks,
//! ACLs and extended attributes, and skip files that disappear while the copy
//! is running.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{lchown, symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{BuildError, Result};
use crate::exclude::ExclusionSet;
use crate::pipeline::Stage;
use crate::process::Cmd;
use crate::report::{self, Reporter};
use crate::xattrs;

/// rsync: "Partial transfer due to error" (unreadable or busy files).
pub const RSYNC_PARTIAL_TRANSFER: i32 = 23;
/// rsync: "Partial transfer due to vanished source files".
pub const RSYNC_VANISHED: i32 = 24;

/// Progress is reported at most once per this many bytes.
const PROGRESS_STEP: u64 = 4 * 1024 * 1024;

/// What a snapshot copied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
    pub files: u64,
    pub bytes: u64,
    /// Entries skipped because they vanished or could not be read.
    pub skipped: u64,
}

/// A strategy for copying the source tree.
pub trait Copier {
    fn name(&self) -> &str;

    fn copy_tree(
        &self,
        source_root: &Path,
        dest: &Path,
        exclusions: &ExclusionSet,
        estimate: Option<u64>,
        reporter: &mut dyn Reporter,
    ) -> Result<SnapshotStats>;
}

/// Copy `source_root` into `dest`, skipping everything in `exclusions`.
///
/// # Arguments
///
/// * `source_root` - Root of the tree to snapshot (`/` for the live host)
/// * `dest` - Staging directory, must already exist
/// * `exclusions` - Skip rules; must contain `dest` itself when it lives
///   inside `source_root`
pub fn snapshot(
    copier: &dyn Copier,
    source_root: &Path,
    dest: &Path,
    exclusions: &ExclusionSet,
    reporter: &mut dyn Reporter,
) -> Result<SnapshotStats> {
    let source_root = fs::canonicalize(source_root).map_err(BuildError::io(format!(
        "resolving snapshot source {}",
        source_root.display()
    )))?;
    if !dest.is_dir() {
        return Err(BuildError::Io {
            context: format!("snapshot destination {}", dest.display()),
            source: std::io::Error::new(ErrorKind::NotFound, "not a directory"),
        });
    }

    let estimate = estimate_used_bytes(&source_root);
    debug!(
        "snapshot {} -> {} with {} ({} exclusion patterns, estimate {:?})",
        source_root.display(),
        dest.display(),
        copier.name(),
        exclusions.len(),
        estimate
    );

    let stats = copier.copy_tree(&source_root, dest, exclusions, estimate, reporter)?;
    report::info(
        reporter,
        format!(
            "Copied {} files ({} MB)",
            stats.files,
            stats.bytes / 1024 / 1024
        ),
    );
    if stats.skipped > 0 {
        report::warn(
            reporter,
            format!("{} entries vanished or were unreadable and were skipped", stats.skipped),
        );
    }
    Ok(stats)
}

/// Used bytes on the filesystem holding `root`, as a progress ceiling.
pub fn estimate_used_bytes(root: &Path) -> Option<u64> {
    let result = Cmd::new("df")
        .args(["--output=used", "-B1"])
        .arg_path(root)
        .allow_fail()
        .run()
        .ok()?;
    if !result.success() {
        return None;
    }
    // Skip header line
    result.stdout.lines().nth(1)?.trim().parse().ok()
}

/// Drives `rsync` in archive mode.
#[derive(Debug, Clone)]
pub struct RsyncCopier {
    program: String,
}

impl RsyncCopier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The full rsync invocation for a snapshot.
    pub fn command(&self, source_root: &Path, dest: &Path, exclusions: &ExclusionSet) -> Cmd {
        let mut source = source_root.to_string_lossy().into_owned();
        if !source.ends_with('/') {
            source.push('/');
        }

        Cmd::new(&self.program)
            .args([
                "-aHAXx",
                "--numeric-ids",
                "--ignore-missing-args",
                "--no-inc-recursive",
                "--info=progress2",
                "--stats",
            ])
            .args(
                exclusions
                    .tool_patterns(source_root)
                    .into_iter()
                    .map(|p| format!("--exclude={}", p)),
            )
            .arg(source)
            .arg_path(dest)
            .ok_codes(&[RSYNC_PARTIAL_TRANSFER, RSYNC_VANISHED])
            .label("rsync snapshot")
    }
}

impl Default for RsyncCopier {
    fn default() -> Self {
        Self::new("rsync")
    }
}

impl Copier for RsyncCopier {
    fn name(&self) -> &str {
        "rsync"
    }

    fn copy_tree(
        &self,
        source_root: &Path,
        dest: &Path,
        exclusions: &ExclusionSet,
        estimate: Option<u64>,
        reporter: &mut dyn Reporter,
    ) -> Result<SnapshotStats> {
        let mut last_reported = 0u64;
        let result = self
            .command(source_root, dest, exclusions)
            .run_streaming(|line| {
                if let Some(done) = parse_progress_bytes(line) {
                    if done >= last_reported + PROGRESS_STEP || done < last_reported {
                        last_reported = done;
                        report::progress(reporter, Stage::Snapshotting, done, estimate);
                    }
                }
            })?;

        let mut stats = parse_rsync_stats(&result.stdout);
        match result.code() {
            RSYNC_PARTIAL_TRANSFER => {
                if !only_source_read_errors(&result.stderr) {
                    return Err(BuildError::Tool {
                        tool: "rsync snapshot".to_string(),
                        code: RSYNC_PARTIAL_TRANSFER,
                        output: result.stderr_trimmed().to_string(),
                    });
                }
                stats.skipped = stats.skipped.max(1);
                report::warn(
                    reporter,
                    "rsync could not read some files (exit 23); they are missing from the image",
                );
                debug!("rsync stderr:\n{}", result.stderr_trimmed());
            }
            RSYNC_VANISHED => {
                stats.skipped = stats.skipped.max(1);
                debug!("rsync: some source files vanished during the copy");
            }
            _ => {}
        }
        report::progress(reporter, Stage::Snapshotting, stats.bytes, estimate);
        Ok(stats)
    }
}

/// Messages rsync prints when a source file could not be opened or stat'ed.
const SOURCE_READ_ERRORS: &[&str] = &[
    "send_files failed to open",
    "link_stat",
    "readlink_stat",
    "opendir",
    "file has vanished",
];

/// True when every `rsync:` error line in `stderr` is a source-side read
/// failure. Exit 23 also covers receiver errors (xattrs, ACLs, a full
/// staging disk), which must fail the snapshot.
pub fn only_source_read_errors(stderr: &str) -> bool {
    let mut errors = stderr
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("rsync:") || l.starts_with("file has vanished"))
        .peekable();
    if errors.peek().is_none() {
        return false;
    }
    errors.all(|line| {
        !line.contains("[receiver]")
            && !line.contains("[generator]")
            && SOURCE_READ_ERRORS.iter().any(|m| line.contains(m))
    })
}

/// Leading byte count of an `--info=progress2` line, e.g.
/// `  1,234,567  12%  10.00MB/s  0:00:01 (xfr#1, to-chk=5/9)`.
pub fn parse_progress_bytes(line: &str) -> Option<u64> {
    let first = line.split_whitespace().next()?;
    let rest = line.split_whitespace().nth(1)?;
    if !rest.ends_with('%') {
        return None;
    }
    first.replace(',', "").parse().ok()
}

/// Extract file and byte counts from rsync's `--stats` block.
pub fn parse_rsync_stats(output: &str) -> SnapshotStats {
    let mut stats = SnapshotStats::default();
    for line in output.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("Number of regular files transferred:") {
            stats.files = leading_number(v).unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("Total transferred file size:") {
            stats.bytes = leading_number(v).unwrap_or(0);
        }
    }
    stats
}

fn leading_number(s: &str) -> Option<u64> {
    s.split_whitespace().next()?.replace(',', "").parse().ok()
}

/// In-process copier built on `walkdir`.
///
/// Regular files, directories and symlinks are copied; device nodes, FIFOs
/// and sockets are skipped. Hardlinked files stay linked. Ownership is
/// restored when permitted, and extended attributes (ACLs included) follow
/// the same namespace rules as `rsync -X`. An attribute that cannot be
/// written to the staging tree fails the copy.
#[derive(Debug, Clone, Default)]
pub struct WalkCopier;

impl WalkCopier {
    pub fn new() -> Self {
        Self
    }
}

/// A directory whose mode and attributes are applied after its contents.
struct PendingDir {
    source: PathBuf,
    target: PathBuf,
    mode: u32,
}

impl Copier for WalkCopier {
    fn name(&self) -> &str {
        "builtin"
    }

    fn copy_tree(
        &self,
        source_root: &Path,
        dest: &Path,
        exclusions: &ExclusionSet,
        estimate: Option<u64>,
        reporter: &mut dyn Reporter,
    ) -> Result<SnapshotStats> {
        let privileged = unsafe { libc::geteuid() } == 0;
        let mut stats = SnapshotStats::default();
        let mut last_reported = 0u64;
        // Read-only dirs must stay writable until filled, and a default ACL
        // must not leak onto copied children.
        let mut pending_dirs: Vec<PendingDir> = Vec::new();
        // (dev, ino) of multiply-linked files -> first staged path.
        let mut linked: HashMap<(u64, u64), PathBuf> = HashMap::new();

        let walker = WalkDir::new(source_root)
            .min_depth(1)
            .follow_links(false)
            .same_file_system(true)
            .into_iter()
            .filter_entry(|entry| {
                let rel = entry.path().strip_prefix(source_root).unwrap_or(entry.path());
                !exclusions.is_excluded(rel, source_root)
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let vanished = e
                        .io_error()
                        .map(|io| io.kind() == ErrorKind::NotFound)
                        .unwrap_or(false);
                    if !vanished {
                        debug!("skipping unreadable entry: {}", e);
                    }
                    stats.skipped += 1;
                    continue;
                }
            };

            let rel = match entry.path().strip_prefix(source_root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let target = dest.join(rel);
            let meta = match entry.path().symlink_metadata() {
                Ok(m) => m,
                Err(_) => {
                    stats.skipped += 1;
                    continue;
                }
            };
            let file_type = meta.file_type();

            if file_type.is_dir() {
                fs::create_dir_all(&target)
                    .map_err(BuildError::io(format!("creating {}", target.display())))?;
                restore_owner(&target, meta.uid(), meta.gid());
                pending_dirs.push(PendingDir {
                    source: entry.path().to_path_buf(),
                    target,
                    mode: meta.mode(),
                });
                continue;
            } else if file_type.is_symlink() {
                let link = match fs::read_link(entry.path()) {
                    Ok(l) => l,
                    Err(_) => {
                        stats.skipped += 1;
                        continue;
                    }
                };
                if target.symlink_metadata().is_ok() {
                    fs::remove_file(&target)
                        .map_err(BuildError::io(format!("replacing {}", target.display())))?;
                }
                symlink(&link, &target)
                    .map_err(BuildError::io(format!("creating symlink {}", target.display())))?;
                restore_owner(&target, meta.uid(), meta.gid());
                xattrs::copy_all(entry.path(), &target, privileged)?;
            } else if file_type.is_file() {
                let key = (meta.dev(), meta.ino());
                if meta.nlink() > 1 {
                    if let Some(first) = linked.get(&key) {
                        if target.symlink_metadata().is_ok() {
                            fs::remove_file(&target)
                                .map_err(BuildError::io(format!("replacing {}", target.display())))?;
                        }
                        fs::hard_link(first, &target).map_err(BuildError::io(format!(
                            "linking {} to {}",
                            target.display(),
                            first.display()
                        )))?;
                        continue;
                    }
                }

                match fs::copy(entry.path(), &target) {
                    Ok(n) => {
                        stats.files += 1;
                        stats.bytes += n;
                    }
                    Err(e) if source_vanished_or_unreadable(entry.path(), &e) => {
                        debug!("skipping {}: {}", entry.path().display(), e);
                        stats.skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        return Err(BuildError::Io {
                            context: format!("copying {}", entry.path().display()),
                            source: e,
                        })
                    }
                }
                // Non-root writers need the copy writable until the final chmod.
                if !privileged {
                    set_mode(&target, meta.mode() | 0o600)?;
                }
                if let Ok(mtime) = meta.modified() {
                    if let Ok(f) = fs::File::options().write(true).open(&target) {
                        let _ = f.set_modified(mtime);
                    }
                }
                restore_owner(&target, meta.uid(), meta.gid());
                // Attributes go on after chown, which drops security.capability.
                xattrs::copy_all(entry.path(), &target, privileged)?;
                // Also restores setuid/setgid cleared by chown.
                set_mode(&target, meta.mode())?;
                if meta.nlink() > 1 {
                    linked.insert(key, target.clone());
                }
            } else {
                debug!("skipping special file {}", entry.path().display());
                continue;
            }

            if stats.bytes >= last_reported + PROGRESS_STEP {
                last_reported = stats.bytes;
                report::progress(reporter, Stage::Snapshotting, stats.bytes, estimate);
            }
        }

        for dir in pending_dirs.into_iter().rev() {
            xattrs::copy_all(&dir.source, &dir.target, privileged)?;
            set_mode(&dir.target, dir.mode)?;
        }

        report::progress(reporter, Stage::Snapshotting, stats.bytes, estimate);
        Ok(stats)
    }
}

/// Source-side failures are skipped; destination-side ones are fatal.
fn source_vanished_or_unreadable(source: &Path, err: &std::io::Error) -> bool {
    match err.kind() {
        ErrorKind::NotFound => !source.exists() || source.symlink_metadata().is_err(),
        ErrorKind::PermissionDenied => fs::File::open(source).is_err(),
        _ => false,
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(BuildError::io(format!("setting mode on {}", path.display())))
}

fn restore_owner(path: &Path, uid: u32, gid: u32) {
    if let Err(e) = lchown(path, Some(uid), Some(gid)) {
        // Unprivileged runs cannot hand files to other users.
        if e.kind() != ErrorKind::PermissionDenied {
            debug!("chown {} failed: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RecordingReporter;
    use tempfile::TempDir;

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_bytes("  1,234,567  12%   10.00MB/s    0:00:01 (xfr#1, to-chk=5/9)"),
            Some(1_234_567)
        );
        assert_eq!(parse_progress_bytes("sending incremental file list"), None);
        assert_eq!(parse_progress_bytes("Number of files: 3"), None);
    }

    #[test]
    fn test_parse_rsync_stats() {
        let out = "\
Number of files: 3,456 (reg: 2,345, dir: 1,000, link: 111)
Number of created files: 3,455
Number of regular files transferred: 2,345
Total file size: 9,876,543 bytes
Total transferred file size: 9,800,000 bytes
";
        let stats = parse_rsync_stats(out);
        assert_eq!(stats.files, 2345);
        assert_eq!(stats.bytes, 9_800_000);
    }

    #[test]
    fn test_exit_23_classification() {
        let unreadable = "rsync: [sender] send_files failed to open \"/etc/shadow-\": Permission denied (13)\n\
rsync: [sender] link_stat \"/run/user/1000/gvfs\" failed: Permission denied (13)\n\
rsync error: some files/attrs were not transferred (see previous errors) (code 23) at main.c(1338) [sender=3.2.7]\n";
        assert!(only_source_read_errors(unreadable));

        let xattr = "rsync: [receiver] rsync_xal_set: lsetxattr(\"/stage/usr/bin/ping\",\"security.capability\") failed: Operation not supported (95)\n\
rsync error: some files/attrs were not transferred (see previous errors) (code 23) at main.c(1338) [generator=3.2.7]\n";
        assert!(!only_source_read_errors(xattr));

        let mixed = format!("{}{}", unreadable, xattr);
        assert!(!only_source_read_errors(&mixed));
        assert!(!only_source_read_errors(""));
    }

    #[test]
    fn test_rsync_command_shape() {
        let set = ExclusionSet::for_staging(Path::new("/var/tmp/stage"));
        let cmd = RsyncCopier::default().command(Path::new("/"), Path::new("/var/tmp/stage"), &set);
        let args = cmd.get_args();

        assert_eq!(args[0], "-aHAXx");
        assert!(args.contains(&"--ignore-missing-args".to_string()));
        assert!(args.contains(&"--exclude=/var/tmp/stage".to_string()));
        assert!(args.contains(&"--exclude=/**/.cache/**".to_string()));
        assert_eq!(args[args.len() - 2], "/");
        assert_eq!(args[args.len() - 1], "/var/tmp/stage");
    }

    #[test]
    fn test_walk_copier_skips_staging_inside_source() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("root");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::create_dir_all(src.join("home/ann/.cache/big")).unwrap();
        fs::write(src.join("etc/hostname"), "box\n").unwrap();
        fs::write(src.join("home/ann/.cache/big/blob"), vec![0u8; 1024]).unwrap();
        symlink("hostname", src.join("etc/name-link")).unwrap();

        let staging = src.join("var/stage");
        fs::create_dir_all(&staging).unwrap();
        let src = fs::canonicalize(&src).unwrap();
        let staging = fs::canonicalize(&staging).unwrap();

        let set = ExclusionSet::for_staging(&staging);
        let mut rec = RecordingReporter::new();
        let stats = snapshot(&WalkCopier::new(), &src, &staging, &set, &mut rec).unwrap();

        assert_eq!(stats.files, 1);
        assert_eq!(fs::read_to_string(staging.join("etc/hostname")).unwrap(), "box\n");
        assert!(staging.join("etc/name-link").is_symlink());
        assert!(staging.join("home/ann/.cache").is_dir());
        assert!(!staging.join("home/ann/.cache/big").exists());
        // No self-copy: the staging tree does not contain itself.
        assert!(!staging.join("var/stage").exists());
    }

    #[test]
    fn test_walk_copier_keeps_hardlinks() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("root");
        let dest = temp.path().join("dest");
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(src.join("usr/bin/gzip"), "#!/bin/sh\n").unwrap();
        fs::hard_link(src.join("usr/bin/gzip"), src.join("usr/bin/gunzip")).unwrap();

        let stats = snapshot(&WalkCopier::new(), &src, &dest, &ExclusionSet::new(), &mut RecordingReporter::new())
            .unwrap();

        let a = fs::metadata(dest.join("usr/bin/gzip")).unwrap();
        let b = fs::metadata(dest.join("usr/bin/gunzip")).unwrap();
        assert_eq!(a.ino(), b.ino());
        assert_eq!(a.nlink(), 2);
        assert_eq!(stats.files, 1);
    }

    #[test]
    fn test_walk_copier_copies_user_xattrs() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("root");
        let dest = temp.path().join("dest");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(src.join("etc/motd"), "hi\n").unwrap();

        let attr = std::ffi::CString::new("user.hostiso.label").unwrap();
        if xattrs::set(&src.join("etc/motd"), &attr, b"motd").is_err()
            || xattrs::set(&src.join("etc"), &attr, b"etc").is_err()
        {
            eprintln!("user xattrs unsupported here, skipping");
            return;
        }

        snapshot(&WalkCopier::new(), &src, &dest, &ExclusionSet::new(), &mut RecordingReporter::new())
            .unwrap();

        assert_eq!(
            xattrs::get(&dest.join("etc/motd"), &attr).unwrap().as_deref(),
            Some(&b"motd"[..])
        );
        assert_eq!(
            xattrs::get(&dest.join("etc"), &attr).unwrap().as_deref(),
            Some(&b"etc"[..])
        );
    }

    #[test]
    fn test_walk_copier_preserves_modes() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("root");
        let dest = temp.path().join("dest");
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(src.join("usr/bin/tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(src.join("usr/bin/tool"), fs::Permissions::from_mode(0o750)).unwrap();

        let set = ExclusionSet::new();
        snapshot(&WalkCopier::new(), &src, &dest, &set, &mut RecordingReporter::new()).unwrap();

        let mode = fs::metadata(dest.join("usr/bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}
