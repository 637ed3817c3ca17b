//! Build orchestration.
//!
//! One run walks `Init -> Snapshotting -> ResolvingBootAssets ->
//! WritingBootConfig -> AssemblingImage -> Verifying -> Done`. Any error
//! moves the run to `Failed`, is reported, and is returned unchanged. The
//! staging directory lives exactly as long as the run.

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;

use crate::artifact::iso::{self, AssemblyOptions};
use crate::boot::{self, AssetSources, BootAssets, PrimaryConfig};
use crate::config::{Config, CopyTool};
use crate::error::{BuildError, Result};
use crate::exclude::ExclusionSet;
use crate::packages::{AptPackageManager, BootRegenerator, CommandRegenerator, PackageManager};
use crate::report::{self, BuildEvent, Reporter};
use crate::request::{prepare_output_path, BuildRequest, Customization, TargetOs};
use crate::snapshot::{self, Copier, RsyncCopier, SnapshotStats, WalkCopier};
use crate::staging::StagingDir;
use crate::timing::Timer;
use crate::verify::verify_bootable;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Snapshotting,
    ResolvingBootAssets,
    WritingBootConfig,
    AssemblingImage,
    Verifying,
    Done,
    Failed,
}

impl Stage {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Init => "Checking build request",
            Self::Snapshotting => "Snapshotting filesystem",
            Self::ResolvingBootAssets => "Resolving kernel and initrd",
            Self::WritingBootConfig => "Writing bootloader configuration",
            Self::AssemblingImage => "Assembling image",
            Self::Verifying => "Verifying boot sector",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }
}

/// Result of the post-build boot-sector check. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Verification {
    Bootable,
    NotBootable,
    /// The check itself could not run.
    Unchecked(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub seconds: f64,
}

/// Everything a successful run produced.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub image: PathBuf,
    pub verification: Verification,
    pub snapshot: SnapshotStats,
    pub assets: BootAssets,
    pub boot_config: PrimaryConfig,
    pub rescue_config: bool,
    pub encrypted: bool,
    pub checksum: Option<PathBuf>,
    pub timings: Vec<StageTiming>,
}

/// The image build pipeline and its collaborators.
pub struct Pipeline {
    source_root: PathBuf,
    host_boot: PathBuf,
    staging_parent: PathBuf,
    kernel_package: String,
    initrd_package: String,
    assembly: AssemblyOptions,
    copier: Box<dyn Copier>,
    packages: Box<dyn PackageManager>,
    regenerator: Box<dyn BootRegenerator>,
}

impl Pipeline {
    /// Pipeline wired to the real host tools.
    pub fn from_config(config: &Config) -> Self {
        let copier: Box<dyn Copier> = match config.copy_tool {
            CopyTool::Rsync => Box::new(RsyncCopier::new(&config.rsync)),
            CopyTool::Builtin => Box::new(WalkCopier::new()),
        };

        Self {
            source_root: config.source_root.clone(),
            host_boot: config.host_boot.clone(),
            staging_parent: config.staging_parent.clone(),
            kernel_package: config.kernel_package.clone(),
            initrd_package: config.initrd_package.clone(),
            assembly: AssemblyOptions {
                tool: config.mastering_tool.clone(),
                label: config.volume_label.clone(),
                isohybrid_mbr: Some(config.isohybrid_mbr.clone()),
                cipher: config.cipher.clone(),
            },
            copier,
            packages: Box::new(AptPackageManager::new()),
            regenerator: Box::new(CommandRegenerator::new(
                &config.bootloader_cmd,
                &config.initrd_cmd,
            )),
        }
    }

    pub fn with_copier(mut self, copier: Box<dyn Copier>) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_package_manager(mut self, packages: Box<dyn PackageManager>) -> Self {
        self.packages = packages;
        self
    }

    pub fn with_regenerator(mut self, regenerator: Box<dyn BootRegenerator>) -> Self {
        self.regenerator = regenerator;
        self
    }

    pub fn with_assembly(mut self, assembly: AssemblyOptions) -> Self {
        self.assembly = assembly;
        self
    }

    /// Run one build.
    pub fn run(&mut self, request: &BuildRequest, reporter: &mut dyn Reporter) -> Result<BuildOutcome> {
        let mut stage = Stage::Init;
        reporter.report(BuildEvent::StageStarted(Stage::Init));

        match self.execute(request, reporter, &mut stage) {
            Ok(outcome) => {
                reporter.report(BuildEvent::StageStarted(Stage::Done));
                Ok(outcome)
            }
            Err(e) => {
                reporter.report(BuildEvent::Failed {
                    stage,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn execute(
        &mut self,
        request: &BuildRequest,
        reporter: &mut dyn Reporter,
        stage: &mut Stage,
    ) -> Result<BuildOutcome> {
        // Preconditions: nothing is touched until these pass.
        if request.target == TargetOs::Windows {
            return Err(BuildError::Unsupported(request.target.to_string()));
        }
        let output = prepare_output_path(&request.output, request.overwrite)?;
        if request.customization == Customization::Full {
            info!("'full' customization is reserved; using the standard build");
            report::info(reporter, "Customization 'full' uses the standard build path");
        }

        let staging = StagingDir::create_in(&self.staging_parent)?;
        let mut timings = Vec::new();

        let mut exclusions = ExclusionSet::for_staging(staging.path());
        exclusions.extend(&request.extra_exclusions);
        // A previous image at the output path must not end up inside the new one.
        exclusions.push(&output.to_string_lossy());
        exclusions.push(&iso::partial_path(&output).to_string_lossy());
        debug!("exclusions: {:?}", exclusions.patterns());

        *stage = Stage::Snapshotting;
        let timer = Timer::start(*stage, reporter);
        let stats = snapshot::snapshot(
            self.copier.as_ref(),
            &self.source_root,
            staging.path(),
            &exclusions,
            reporter,
        )?;
        timings.push(record(*stage, timer.finish(reporter)));

        *stage = Stage::ResolvingBootAssets;
        let timer = Timer::start(*stage, reporter);
        let mut sources = AssetSources {
            packages: self.packages.as_mut(),
            regenerator: self.regenerator.as_mut(),
            host_boot: &self.host_boot,
            kernel_package: &self.kernel_package,
            initrd_package: &self.initrd_package,
        };
        let assets = boot::resolve_boot_assets(staging.path(), &mut sources, reporter)?;
        timings.push(record(*stage, timer.finish(reporter)));

        *stage = Stage::WritingBootConfig;
        let timer = Timer::start(*stage, reporter);
        let boot_config = boot::write_boot_config(
            staging.path(),
            &assets,
            &output,
            request.encrypted(),
            &self.assembly.label,
            reporter,
        )?;
        timings.push(record(*stage, timer.finish(reporter)));

        *stage = Stage::AssemblingImage;
        let timer = Timer::start(*stage, reporter);
        iso::assemble_image(
            staging.path(),
            &output,
            request.passphrase.as_ref(),
            &self.assembly,
            reporter,
        )?;
        let checksum = if request.checksum {
            match iso::write_checksum(&output) {
                Ok(path) => Some(path),
                Err(e) => {
                    report::warn(reporter, format!("Checksum not written: {}", e));
                    None
                }
            }
        } else {
            None
        };
        timings.push(record(*stage, timer.finish(reporter)));

        *stage = Stage::Verifying;
        let timer = Timer::start(*stage, reporter);
        let verification = match verify_bootable(&output) {
            Ok(true) => Verification::Bootable,
            Ok(false) => {
                report::warn(reporter, "Image has no boot signature; it may not boot");
                Verification::NotBootable
            }
            Err(e) => {
                report::warn(reporter, format!("Boot sector not checked: {}", e));
                Verification::Unchecked(e.to_string())
            }
        };
        timings.push(record(*stage, timer.finish(reporter)));

        *stage = Stage::Done;
        Ok(BuildOutcome {
            image: output,
            verification,
            snapshot: stats,
            assets,
            boot_config: boot_config.primary,
            rescue_config: boot_config.rescue.is_some(),
            encrypted: request.encrypted(),
            checksum,
            timings,
        })
    }
}

fn record(stage: Stage, elapsed: Duration) -> StageTiming {
    StageTiming {
        stage,
        seconds: elapsed.as_secs_f64(),
    }
}
