//! Shared test utilities for hostiso tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use hostiso::config::{Config, CopyTool};
use hostiso::packages::{BootRegenerator, Package, PackageManager};
use hostiso::pipeline::Pipeline;
use hostiso::Result;
use tempfile::TempDir;

/// Shared call log for fake collaborators.
pub type CallLog = Rc<RefCell<Vec<String>>>;

/// Test environment: a fake host root, its /boot, and an output directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Snapshot source (stands in for `/`)
    pub source_root: PathBuf,
    /// Live host boot directory that package installs write to
    pub host_boot: PathBuf,
    /// Staging parent, inside the source root like `/var/tmp`
    pub staging_parent: PathBuf,
    /// Where images are written
    pub output_dir: PathBuf,
    /// Where fake tools record what they saw
    pub capture_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = fs::canonicalize(temp_dir.path()).expect("Failed to canonicalize temp dir");

        let source_root = base.join("root");
        let host_boot = base.join("host-boot");
        let staging_parent = source_root.join("var/tmp/hostiso");
        let output_dir = base.join("out");
        let capture_dir = base.join("capture");

        for dir in [&host_boot, &staging_parent, &output_dir, &capture_dir] {
            fs::create_dir_all(dir).expect("Failed to create test dir");
        }
        create_mock_root(&source_root);

        Self {
            _temp_dir: temp_dir,
            source_root,
            host_boot,
            staging_parent,
            output_dir,
            capture_dir,
        }
    }

    /// Put a kernel and initrd into the snapshot source's `boot/`.
    pub fn with_boot_assets(self) -> Self {
        let boot = self.source_root.join("boot");
        fs::write(boot.join("vmlinuz"), "kernel").expect("Failed to write kernel");
        fs::write(boot.join("initrd.img-6.1"), "initrd").expect("Failed to write initrd");
        self
    }

    /// Configuration pointing every path at this environment.
    pub fn config(&self, mastering_tool: &Path) -> Config {
        let mut config = Config::default();
        config.source_root = self.source_root.clone();
        config.host_boot = self.host_boot.clone();
        config.staging_parent = self.staging_parent.clone();
        config.copy_tool = CopyTool::Builtin;
        config.mastering_tool = mastering_tool.display().to_string();
        config.isohybrid_mbr = self.capture_dir.join("no-such-mbr.bin");
        config
    }

    /// Pipeline with the builtin copier and recording fakes.
    pub fn pipeline(&self, mastering_tool: &Path, packages: FakePackages, regen: FakeRegenerator) -> Pipeline {
        Pipeline::from_config(&self.config(mastering_tool))
            .with_package_manager(Box::new(packages))
            .with_regenerator(Box::new(regen))
    }

    pub fn capture(&self, name: &str) -> PathBuf {
        self.capture_dir.join(name)
    }

    /// Entries left under the staging parent.
    pub fn staging_leftovers(&self) -> usize {
        fs::read_dir(&self.staging_parent)
            .map(|d| d.count())
            .unwrap_or(0)
    }
}

/// Create a small host tree.
pub fn create_mock_root(root: &Path) {
    let dirs = [
        "boot",
        "etc",
        "usr/bin",
        "home/ann/.cache/thumbnails",
        "srv/private",
    ];
    for dir in dirs {
        fs::create_dir_all(root.join(dir)).expect("Failed to create mock root dir");
    }

    fs::write(root.join("etc/hostname"), "testhost\n").expect("Failed to create hostname");
    fs::write(
        root.join("etc/passwd"),
        "root:x:0:0:root:/root:/bin/bash\n",
    )
    .expect("Failed to create passwd");
    fs::write(root.join("home/ann/.cache/thumbnails/a.png"), "png").expect("Failed to create cache file");
    fs::write(root.join("srv/private/key"), "secret").expect("Failed to create private file");
    create_mock_binary(&root.join("usr/bin/tool"), "#!/bin/sh\necho mock\n");
}

/// Write an executable shell script.
pub fn create_mock_binary(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir for binary");
    }
    fs::write(path, body).expect("Failed to create mock binary");

    let mut perms = fs::metadata(path).expect("Failed to get metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("Failed to set permissions");
}

/// How the fake mastering tool behaves.
#[derive(Clone, Copy)]
pub enum Mastering {
    /// Writes an image ending its first sector with 0x55 0xAA.
    Bootable,
    /// Writes 512 zero bytes.
    Unbootable,
    /// Writes a partial file, then exits 3.
    Fails,
}

/// Fake `xorriso` that records its arguments and the staging tree.
///
/// Captures (in `capture_dir`): `args` (one per line), `grub.cfg`,
/// `loopback.cfg`, and `listing` (the staging tree, relative paths).
pub fn create_mastering_tool(env: &TestEnv, mode: Mastering) -> PathBuf {
    let tool = env.capture_dir.join("fake-xorriso");
    let cap = env.capture_dir.display();

    let write_image = match mode {
        Mastering::Bootable => "head -c 510 /dev/zero > \"$out\"\nprintf '\\125\\252' >> \"$out\"",
        Mastering::Unbootable => "head -c 512 /dev/zero > \"$out\"",
        Mastering::Fails => "printf 'partial' > \"$out\"\necho 'libisofs: FAILURE : out of space' >&2\nexit 3",
    };

    let script = format!(
        r#"#!/bin/sh
out=""
prev=""
last=""
for a in "$@"; do
    if [ "$prev" = "-o" ]; then out="$a"; fi
    prev="$a"
    last="$a"
done
printf '%s\n' "$@" > "{cap}/args"
[ -f "$last/boot/grub/grub.cfg" ] && cp "$last/boot/grub/grub.cfg" "{cap}/grub.cfg"
[ -f "$last/boot/grub/loopback.cfg" ] && cp "$last/boot/grub/loopback.cfg" "{cap}/loopback.cfg"
(cd "$last" && find . | sort) > "{cap}/listing"
{write_image}
exit 0
"#,
        cap = cap,
        write_image = write_image,
    );
    create_mock_binary(&tool, &script);
    tool
}

/// Records calls; on commit, writes the given files into the host boot dir.
pub struct FakePackages {
    pub log: CallLog,
    pub newest: Option<Package>,
    pub installs: Vec<PathBuf>,
}

impl FakePackages {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: Rc::clone(log),
            newest: None,
            installs: Vec::new(),
        }
    }

    pub fn offering(mut self, name: &str, version: &str) -> Self {
        self.newest = Some(Package {
            name: name.to_string(),
            version: version.to_string(),
        });
        self
    }

    pub fn installing(mut self, file: PathBuf) -> Self {
        self.installs.push(file);
        self
    }
}

impl PackageManager for FakePackages {
    fn find_newest(&mut self, prefix: &str) -> Result<Option<Package>> {
        self.log.borrow_mut().push(format!("find_newest {}", prefix));
        Ok(self.newest.clone().filter(|p| p.name.starts_with(prefix)))
    }

    fn mark_install(&mut self, package: &Package) -> Result<()> {
        self.log.borrow_mut().push(format!("mark {}", package.name));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.log.borrow_mut().push("commit".to_string());
        for file in &self.installs {
            fs::write(file, "installed").expect("Failed to write installed file");
        }
        Ok(())
    }
}

/// Records calls; `regenerate_initrd` writes the given files.
pub struct FakeRegenerator {
    pub log: CallLog,
    pub initrd_outputs: Vec<PathBuf>,
}

impl FakeRegenerator {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: Rc::clone(log),
            initrd_outputs: Vec::new(),
        }
    }

    pub fn producing_initrd(mut self, file: PathBuf) -> Self {
        self.initrd_outputs.push(file);
        self
    }
}

impl BootRegenerator for FakeRegenerator {
    fn regenerate_kernel_boot(&mut self) -> Result<()> {
        self.log.borrow_mut().push("regenerate_kernel_boot".to_string());
        Ok(())
    }

    fn regenerate_initrd(&mut self) -> Result<()> {
        self.log.borrow_mut().push("regenerate_initrd".to_string());
        for file in &self.initrd_outputs {
            fs::write(file, "initrd").expect("Failed to write initrd");
        }
        Ok(())
    }
}

/// Set a file's modification time to `secs` after the epoch.
pub fn set_mtime(path: &Path, secs: u64) {
    let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
    fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(time))
        .expect("Failed to set mtime");
}

/// Switches the working directory, restoring it on drop.
pub struct CwdGuard {
    previous: PathBuf,
}

impl CwdGuard {
    pub fn enter(dir: &Path) -> Self {
        let previous = std::env::current_dir().expect("Failed to read cwd");
        std::env::set_current_dir(dir).expect("Failed to change cwd");
        Self { previous }
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.previous);
    }
}

pub fn new_log() -> CallLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// Assert that a file contains expected content.
pub fn assert_file_contains(path: &Path, expected: &str) {
    let content =
        fs::read_to_string(path).unwrap_or_else(|_| panic!("Failed to read file: {}", path.display()));
    assert!(
        content.contains(expected),
        "File {} does not contain expected content.\nExpected to find: {}\nActual content: {}",
        path.display(),
        expected,
        content
    );
}
