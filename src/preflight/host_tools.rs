//! Host tool availability checks.

use crate::config::{Config, CopyTool};
use crate::process;

use super::types::CheckResult;

/// Check the external tools the pipeline may run.
pub fn check_host_tools(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    match config.copy_tool {
        CopyTool::Rsync => results.push(check_tool_exists(
            &config.rsync,
            "rsync",
            "Required to snapshot the filesystem",
            true,
        )),
        CopyTool::Builtin => results.push(CheckResult::skip(
            config.rsync.as_str(),
            "HOSTISO_COPY_TOOL=builtin, rsync not used",
        )),
    }

    results.push(check_tool_exists(
        &config.mastering_tool,
        "xorriso",
        "Required to create the ISO image",
        true,
    ));
    results.push(check_tool_exists(
        "df",
        "coreutils",
        "Used for progress estimates",
        false,
    ));

    // Only needed when the snapshot lacks a kernel or initrd.
    let fallback_tools = [
        ("apt-cache", "apt", "Used to find kernel/initrd packages"),
        ("apt-get", "apt", "Used to install kernel/initrd packages"),
    ];
    for (tool, package, purpose) in fallback_tools {
        results.push(check_tool_exists(tool, package, purpose, false));
    }

    for (line, package) in [
        (&config.bootloader_cmd, "grub2-common"),
        (&config.initrd_cmd, "initramfs-tools"),
    ] {
        match line.split_whitespace().next() {
            Some(program) => results.push(check_tool_exists(
                program,
                package,
                "Used after installing boot packages",
                false,
            )),
            None => results.push(CheckResult::warn(
                "regeneration command",
                "Empty command configured",
            )),
        }
    }

    results
}

fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, path.display().to_string()),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, msg)
            } else {
                CheckResult::warn(tool, msg)
            }
        }
    }
}
