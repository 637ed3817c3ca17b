//! Build command - snapshots the host into an image.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::pipeline::{BuildOutcome, Pipeline, Verification};
use crate::report::{ConsoleReporter, NullReporter, Reporter};
use crate::request::{BuildRequest, Customization, Passphrase, TargetOs};

/// Environment variable holding the encryption passphrase.
pub const PASSPHRASE_ENV: &str = "HOSTISO_PASSPHRASE";

/// Options for the build command.
#[derive(Debug, Clone)]
pub struct BuildArgs {
    pub output: PathBuf,
    pub exclude: Vec<String>,
    pub level: Customization,
    pub os: TargetOs,
    pub encrypt: bool,
    /// Overrides the bootloader regeneration command.
    pub bootloader: Option<String>,
    pub overwrite: bool,
    pub checksum: bool,
    pub json: bool,
}

/// Execute the build command.
pub fn cmd_build(args: BuildArgs, config: &Config) -> Result<()> {
    let mut config = config.clone();
    if let Some(cmd) = &args.bootloader {
        config.bootloader_cmd = cmd.clone();
    }

    let passphrase = if args.encrypt {
        Some(read_passphrase()?)
    } else {
        None
    };

    let request = BuildRequest {
        target: args.os,
        output: args.output,
        customization: args.level,
        passphrase,
        extra_exclusions: args.exclude,
        overwrite: args.overwrite,
        checksum: args.checksum,
    };

    let mut pipeline = Pipeline::from_config(&config);
    // JSON mode keeps stdout clean for the outcome document.
    let mut console = ConsoleReporter::new();
    let mut quiet = NullReporter;
    let reporter: &mut dyn Reporter = if args.json { &mut quiet } else { &mut console };

    let outcome = match pipeline.run(&request, reporter) {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.is_precondition() {
                eprintln!("Nothing was written.");
            } else if e.is_tool_failure() {
                eprintln!("Run 'hostiso preflight' to check the host tools.");
            }
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to build image at {}", request.output.display())));
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_summary(&outcome);
    }
    Ok(())
}

/// Passphrase from the environment, else the first line of stdin.
///
/// The variable is removed once read so the tools the build runs do not
/// inherit it.
fn read_passphrase() -> Result<Passphrase> {
    if let Some(secret) = std::env::var_os(PASSPHRASE_ENV) {
        std::env::remove_var(PASSPHRASE_ENV);
        if let Ok(secret) = secret.into_string() {
            let passphrase = Passphrase::new(secret);
            if !passphrase.is_empty() {
                return Ok(passphrase);
            }
        }
    }

    eprintln!("Enter image passphrase (or set {}):", PASSPHRASE_ENV);
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read passphrase from stdin")?;
    passphrase_from_line(line)
}

/// Strip the line ending in place and take ownership of the buffer.
fn passphrase_from_line(mut line: String) -> Result<Passphrase> {
    let len = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(len);
    let passphrase = Passphrase::new(line);
    if passphrase.is_empty() {
        bail!("An empty passphrase cannot encrypt the image");
    }
    Ok(passphrase)
}

fn print_summary(outcome: &BuildOutcome) {
    println!("\n=== Build Complete ===");
    println!("  Image: {}", outcome.image.display());
    if let Some(sum) = &outcome.checksum {
        println!("  Checksum: {}", sum.display());
    }
    println!(
        "  Kernel: boot/{}  Initrd: boot/{}",
        outcome.assets.kernel, outcome.assets.initrd
    );
    if outcome.encrypted {
        println!("  Encrypted: yes");
    }
    match &outcome.verification {
        Verification::Bootable => println!("  Boot sector: OK"),
        Verification::NotBootable => println!("  Boot sector: missing signature"),
        Verification::Unchecked(reason) => println!("  Boot sector: not checked ({})", reason),
    }
    let total: f64 = outcome.timings.iter().map(|t| t.seconds).sum();
    println!("  Total: {:.1}s", total);
}
