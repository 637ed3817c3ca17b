//! Centralized command execution with consistent error handling.
//!
//! Every external tool the pipeline touches (copy tool, package manager,
//! regeneration commands, mastering tool) is run through [`Cmd`], so failures
//! always surface as [`BuildError::Tool`] with the exit code and captured
//! output, and logged command lines never contain secret arguments.

use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;

use log::debug;

use crate::error::{BuildError, Result};

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    /// Indices into `args` that must never be logged.
    secret_args: Vec<usize>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Non-zero exit codes treated as success.
    ok_codes: Vec<i32>,
    /// Name used in error messages; defaults to the program.
    label: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            secret_args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            allow_fail: false,
            ok_codes: Vec::new(),
            label: None,
        }
    }

    /// Parse a whitespace-separated command line (`update-initramfs -u`).
    ///
    /// Returns `None` for an empty string.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Add an argument that is passed to the program but redacted from logs.
    pub fn arg_secret(mut self, arg: impl AsRef<str>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Treat the given non-zero exit codes as success.
    pub fn ok_codes(mut self, codes: &[i32]) -> Self {
        self.ok_codes.extend_from_slice(codes);
        self
    }

    /// Name the tool in error messages (e.g. "rsync snapshot").
    pub fn label(mut self, label: impl AsRef<str>) -> Self {
        self.label = Some(label.as_ref().to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// The command line as it may be logged, secrets replaced.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for (i, arg) in self.args.iter().enumerate() {
            line.push(' ');
            if self.secret_args.contains(&i) {
                line.push_str("<redacted>");
            } else {
                line.push_str(arg);
            }
        }
        line
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> BuildError {
        BuildError::Spawn {
            tool: self.program.clone(),
            source,
        }
    }

    fn accepts(&self, status: &ExitStatus) -> bool {
        self.allow_fail
            || status.success()
            || status.code().is_some_and(|c| self.ok_codes.contains(&c))
    }

    fn failure(&self, status: &ExitStatus, stdout: &str, stderr: &str) -> BuildError {
        let output = if stderr.trim().is_empty() {
            stdout
        } else {
            stderr
        };
        BuildError::Tool {
            tool: self.label.clone().unwrap_or_else(|| self.program.clone()),
            code: status.code().unwrap_or(-1),
            output: output.trim().to_string(),
        }
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        debug!("running: {}", self.display());

        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.accepts(&result.status) {
            return Err(self.failure(&result.status, &result.stdout, &result.stderr));
        }

        Ok(result)
    }

    /// Run the command, handing each stdout line to `on_line` as it arrives.
    ///
    /// Lines are split on both `\n` and `\r`, so tools that redraw a
    /// progress line in place still produce one callback per update.
    /// Stderr is collected on a helper thread and returned in the result.
    pub fn run_streaming(self, mut on_line: impl FnMut(&str)) -> Result<CommandResult> {
        debug!("running (streaming): {}", self.display());

        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let stdout = match child.stdout.take() {
            Some(out) => pump_lines(out, &mut on_line),
            None => Ok(String::new()),
        };
        let stdout = match stdout {
            Ok(stdout) => stdout,
            Err(e) => {
                abandon(&mut child, stderr_reader);
                return Err(BuildError::Io {
                    context: format!("reading output of {}", self.program),
                    source: e,
                });
            }
        };

        let status = child
            .wait()
            .map_err(BuildError::io(format!("waiting for {}", self.program)))?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !self.accepts(&status) {
            return Err(self.failure(&status, &stdout, &stderr));
        }

        Ok(CommandResult {
            status,
            stdout,
            stderr,
        })
    }
}

/// Feed `reader` to `on_line` one line at a time, splitting on `\n` and
/// `\r`, and return everything read with `\n` endings.
fn pump_lines(reader: impl Read, on_line: &mut impl FnMut(&str)) -> std::io::Result<String> {
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut chunk = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    on_line(&line);
                    collected.push_str(&line);
                    collected.push('\n');
                }
                pending.clear();
            } else {
                pending.push(byte);
            }
        }
    }
    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        on_line(&line);
        collected.push_str(&line);
        collected.push('\n');
    }
    Ok(collected)
}

/// Kill and reap a child whose output can no longer be read.
fn abandon(child: &mut Child, stderr_reader: Option<thread::JoinHandle<String>>) {
    if let Err(e) = child.kill() {
        debug!("kill {} failed: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        debug!("wait for {} failed: {}", child.id(), e);
    }
    // The pipe closes with the child, so this returns.
    if let Some(handle) = stderr_reader {
        let _ = handle.join();
    }
}

/// Check if a program exists in PATH (or is an existing path).
///
/// Returns the full path if found, None otherwise.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Check if a program exists in PATH (bool version).
pub fn exists(program: &str) -> bool {
    which(program).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_failure_carries_code_and_stderr() {
        let err = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .label("listing")
            .run()
            .unwrap_err();

        match err {
            BuildError::Tool { tool, code, output } => {
                assert_eq!(tool, "listing");
                assert_ne!(code, 0);
                assert!(output.contains("No such file") || output.contains("cannot access"));
            }
            other => panic!("expected tool error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let err = Cmd::new("nonexistent_program_12345").run().unwrap_err();
        assert!(matches!(err, BuildError::Spawn { .. }));
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
        assert_eq!(result.code(), 1);
    }

    #[test]
    fn test_ok_codes() {
        let result = Cmd::new("sh")
            .args(["-c", "exit 24"])
            .ok_codes(&[23, 24])
            .run()
            .unwrap();
        assert_eq!(result.code(), 24);

        let err = Cmd::new("sh")
            .args(["-c", "exit 12"])
            .ok_codes(&[23, 24])
            .run()
            .unwrap_err();
        assert!(matches!(err, BuildError::Tool { code: 12, .. }));
    }

    #[test]
    fn test_display_redacts_secrets() {
        let cmd = Cmd::new("xorriso")
            .args(["-encrypt", "aes256"])
            .arg_secret("deadbeef")
            .arg("/staging");
        let shown = cmd.display();
        assert_eq!(shown, "xorriso -encrypt aes256 <redacted> /staging");
        assert_eq!(cmd.get_args()[2], "deadbeef");
    }

    #[test]
    fn test_streaming_splits_carriage_returns() {
        let mut lines = Vec::new();
        let result = Cmd::new("printf")
            .arg("one\\rtwo\\nthree")
            .run_streaming(|line| lines.push(line.to_string()))
            .unwrap();
        assert!(result.success());
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    /// Yields one chunk of output, then fails.
    struct BrokenPipe {
        sent: bool,
    }

    impl Read for BrokenPipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.sent {
                return Err(std::io::Error::other("pipe broke"));
            }
            self.sent = true;
            let chunk = b"partial\n";
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_read_error_surfaces_after_delivered_lines() {
        let mut lines = Vec::new();
        let err = pump_lines(BrokenPipe { sent: false }, &mut |line: &str| {
            lines.push(line.to_string())
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "pipe broke");
        assert_eq!(lines, vec!["partial"]);
    }

    #[test]
    fn test_abandoned_child_is_reaped() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut stderr = child.stderr.take().unwrap();
        let reader = thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        });

        abandon(&mut child, Some(reader));
        let status = child.try_wait().unwrap().expect("child reaped");
        assert!(!status.success());
    }

    #[test]
    fn test_from_command_line() {
        let cmd = Cmd::from_command_line("update-initramfs -u -k all").unwrap();
        assert_eq!(cmd.program(), "update-initramfs");
        assert_eq!(cmd.get_args(), ["-u", "-k", "all"]);
        assert!(Cmd::from_command_line("   ").is_none());
    }

    #[test]
    fn test_which() {
        assert!(which("sh").is_some());
        assert!(!exists("nonexistent_program_12345"));
    }
}
