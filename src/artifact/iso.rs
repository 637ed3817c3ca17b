//! ISO assembly - masters the staging tree into the output image.
//!
//! The mastering tool writes to `<output>.partial`, which is renamed into
//! place only on success. A failed run leaves nothing at the output path.

use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use log::debug;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{BuildError, Result};
use crate::pipeline::Stage;
use crate::process::Cmd;
use crate::report::{self, Reporter};
use crate::request::Passphrase;

/// Suffix of the temporary image written by the mastering tool.
const PARTIAL_SUFFIX: &str = "partial";
/// Suffix of the checksum sidecar.
pub const CHECKSUM_SUFFIX: &str = "sha512";
/// Two spaces, as `sha512sum -c` expects.
const CHECKSUM_SEPARATOR: &str = "  ";

/// El Torito boot image, relative to the staging root.
const ISOLINUX_BIN: &str = "isolinux/isolinux.bin";
const ISOLINUX_CAT: &str = "isolinux/boot.cat";

/// Mastering tool settings.
#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    pub tool: String,
    pub label: String,
    /// Hybrid MBR template; used only if the file exists.
    pub isohybrid_mbr: Option<PathBuf>,
    pub cipher: String,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            tool: "xorriso".to_string(),
            label: "HOSTISO".to_string(),
            isohybrid_mbr: Some(PathBuf::from("/usr/lib/ISOLINUX/isohdpfx.bin")),
            cipher: "aes256".to_string(),
        }
    }
}

/// Hex SHA-256 of the passphrase. The only form handed to the tool.
pub fn passphrase_digest(passphrase: &Passphrase) -> String {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.expose().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `<output>.partial` next to the output.
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Build the mastering invocation.
pub fn mastering_command(
    staging_root: &Path,
    target: &Path,
    passphrase: Option<&Passphrase>,
    options: &AssemblyOptions,
) -> Cmd {
    let mut cmd = Cmd::new(&options.tool)
        .args(["-as", "mkisofs", "-o"])
        .arg_path(target)
        .args(["-V", options.label.as_str(), "-J", "-joliet-long", "-R"])
        .label("image mastering");

    if let Some(mbr) = options.isohybrid_mbr.as_deref().filter(|p| p.is_file()) {
        cmd = cmd.arg("-isohybrid-mbr").arg_path(mbr);
    }

    if staging_root.join(ISOLINUX_BIN).is_file() {
        cmd = cmd
            .args(["-c", ISOLINUX_CAT, "-b", ISOLINUX_BIN])
            .args(["-no-emul-boot", "-boot-load-size", "4", "-boot-info-table"]);
    }

    if let Some(pass) = passphrase {
        cmd = cmd
            .args(["-encrypt", options.cipher.as_str()])
            .arg_secret(passphrase_digest(pass));
    }

    cmd.arg_path(staging_root)
}

/// Master `staging_root` into `output_image`.
///
/// A previous image at `output_image` and its checksum are removed before
/// the tool starts. On failure the partial file is removed as well, so
/// nothing is left at the output path.
pub fn assemble_image(
    staging_root: &Path,
    output_image: &Path,
    passphrase: Option<&Passphrase>,
    options: &AssemblyOptions,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let partial = partial_path(output_image);
    for stale in [output_image.to_path_buf(), checksum_path(output_image), partial.clone()] {
        remove_if_present(&stale)?;
    }

    if passphrase.is_some() {
        report::info(reporter, format!("Encrypting image ({})", options.cipher));
    }

    let cmd = mastering_command(staging_root, &partial, passphrase, options);
    if let Err(e) = cmd.run() {
        if let Err(rm) = fs::remove_file(&partial) {
            debug!("no partial image to remove at {}: {}", partial.display(), rm);
        }
        return Err(e);
    }

    fs::rename(&partial, output_image).map_err(BuildError::io(format!(
        "moving {} into place",
        output_image.display()
    )))?;

    let size = fs::metadata(output_image).map(|m| m.len()).unwrap_or(0);
    report::progress(reporter, Stage::AssemblingImage, size, Some(size));
    report::info(
        reporter,
        format!("Image: {} ({} MB)", output_image.display(), size / 1024 / 1024),
    );
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("removed previous {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::Io {
            context: format!("removing previous {}", path.display()),
            source: e,
        }),
    }
}

/// `<image>.sha512` next to the image.
pub fn checksum_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(".");
    name.push(CHECKSUM_SUFFIX);
    PathBuf::from(name)
}

/// Write `<image>.sha512` in `sha512sum -c` format.
pub fn write_checksum(image: &Path) -> Result<PathBuf> {
    let file = File::open(image).map_err(BuildError::io(format!("opening {}", image.display())))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(BuildError::io(format!("reading {}", image.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let hash = format!("{:x}", hasher.finalize());

    let filename = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let path = checksum_path(image);
    fs::write(&path, format!("{}{}{}\n", hash, CHECKSUM_SEPARATOR, filename))
        .map_err(BuildError::io(format!("writing {}", path.display())))?;

    debug!("SHA512 {}...{}", &hash[..8], &hash[hash.len() - 8..]);
    Ok(path)
}
