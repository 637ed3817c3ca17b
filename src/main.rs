//! hostiso - turns the running Linux host into a bootable ISO.
//!
//! Pipeline:
//! - Snapshot the live filesystem into a staging tree
//! - Make sure the tree has a kernel and initrd
//! - Write a GRUB config with "try" and "install" entries
//! - Master the tree into an ISO, optionally encrypted
//! - Check the image's boot sector

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hostiso::commands::{self, BuildArgs};
use hostiso::config::Config;
use hostiso::request::{Customization, TargetOs};

#[derive(Parser)]
#[command(name = "hostiso")]
#[command(about = "Build a bootable ISO from the running Linux host")]
#[command(
    after_help = "QUICK START:\n  hostiso preflight           Check tools and privileges\n  hostiso build /srv/host     Build /srv/host.iso\n  hostiso verify /srv/host.iso  Check the boot sector"
)]
struct Cli {
    /// Show diagnostic output (command lines, boot asset decisions)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot this host into a bootable image
    Build {
        /// Output image path (extension is forced to .iso)
        output: PathBuf,

        /// Extra exclusion pattern (repeatable)
        #[arg(long, value_name = "PATTERN")]
        exclude: Vec<String>,

        /// Customization level: minimal, moderate or full
        #[arg(long, default_value = "minimal")]
        level: Customization,

        /// Target operating system
        #[arg(long, default_value = "linux")]
        os: TargetOs,

        /// Encrypt the image (passphrase from HOSTISO_PASSPHRASE or stdin)
        #[arg(long)]
        encrypt: bool,

        /// Bootloader regeneration command used after a kernel install
        #[arg(long, value_name = "COMMAND")]
        bootloader: Option<String>,

        /// Replace an existing image at the output path
        #[arg(long)]
        overwrite: bool,

        /// Skip writing the .sha512 checksum
        #[arg(long)]
        no_checksum: bool,

        /// Print the build outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check an image's boot sector (exit 1 if not bootable)
    Verify {
        /// Image to check
        image: PathBuf,
    },

    /// Run preflight checks (tools, privileges, disk space)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = Config::load();

    match cli.command {
        Commands::Build {
            output,
            exclude,
            level,
            os,
            encrypt,
            bootloader,
            overwrite,
            no_checksum,
            json,
        } => {
            let args = BuildArgs {
                output,
                exclude,
                level,
                os,
                encrypt,
                bootloader,
                overwrite,
                checksum: !no_checksum,
                json,
            };
            commands::cmd_build(args, &config)?;
        }

        Commands::Verify { image } => {
            commands::cmd_verify(&image)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&config, strict)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
            };
            commands::cmd_show(show_target, &config)?;
        }
    }

    Ok(())
}
