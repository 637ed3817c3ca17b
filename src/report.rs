//! Progress and status reporting.
//!
//! The pipeline never prints. It hands [`BuildEvent`]s to an injected
//! [`Reporter`]; the CLI renders them with [`ConsoleReporter`] and tests
//! collect them with [`RecordingReporter`].

use std::io::Write;
use std::time::Duration;

use crate::pipeline::Stage;

/// A structured event emitted by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    /// The orchestrator entered a new state.
    StageStarted(Stage),
    /// A stage completed successfully.
    StageFinished { stage: Stage, elapsed: Duration },
    /// Incremental progress inside a long-running stage.
    ///
    /// `estimate` is a ceiling guess, not a promise: `done` may exceed it.
    Progress {
        stage: Stage,
        done: u64,
        estimate: Option<u64>,
    },
    Info(String),
    Warning(String),
    /// The build reached the `Failed` state.
    Failed { stage: Stage, message: String },
}

/// Sink for pipeline events.
pub trait Reporter {
    fn report(&mut self, event: BuildEvent);

    fn info(&mut self, message: impl Into<String>)
    where
        Self: Sized,
    {
        self.report(BuildEvent::Info(message.into()));
    }

    fn warn(&mut self, message: impl Into<String>)
    where
        Self: Sized,
    {
        self.report(BuildEvent::Warning(message.into()));
    }
}

/// Helpers usable through `&mut dyn Reporter`.
pub(crate) fn info(reporter: &mut dyn Reporter, message: impl Into<String>) {
    reporter.report(BuildEvent::Info(message.into()));
}

pub(crate) fn warn(reporter: &mut dyn Reporter, message: impl Into<String>) {
    let message = message.into();
    log::warn!("{}", message);
    reporter.report(BuildEvent::Warning(message));
}

pub(crate) fn progress(reporter: &mut dyn Reporter, stage: Stage, done: u64, estimate: Option<u64>) {
    reporter.report(BuildEvent::Progress {
        stage,
        done,
        estimate,
    });
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&mut self, _event: BuildEvent) {}
}

/// Keeps every event in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub events: Vec<BuildEvent>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages that were started, in order.
    pub fn started_stages(&self) -> Vec<Stage> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BuildEvent::StageStarted(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BuildEvent::Warning(w) => Some(w.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn infos(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BuildEvent::Info(w) => Some(w.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for RecordingReporter {
    fn report(&mut self, event: BuildEvent) {
        self.events.push(event);
    }
}

/// Renders events to the terminal.
pub struct ConsoleReporter {
    /// Last whole percentage printed for the current progress line.
    last_percent: Option<u64>,
    /// Whether a `\r` progress line is currently open.
    progress_open: bool,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            last_percent: None,
            progress_open: false,
        }
    }

    fn close_progress(&mut self) {
        if self.progress_open {
            println!();
            self.progress_open = false;
        }
        self.last_percent = None;
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ConsoleReporter {
    fn report(&mut self, event: BuildEvent) {
        match event {
            BuildEvent::StageStarted(stage) => {
                self.close_progress();
                match stage {
                    Stage::Init => println!("=== Building host image ===\n"),
                    Stage::Done | Stage::Failed => {}
                    other => println!("{}...", other.description()),
                }
            }
            BuildEvent::StageFinished { stage, elapsed } => {
                self.close_progress();
                let secs = elapsed.as_secs_f64();
                if secs >= 60.0 {
                    println!("  [{:.1}m] {}", secs / 60.0, stage.description());
                } else {
                    println!("  [{:.1}s] {}", secs, stage.description());
                }
            }
            BuildEvent::Progress {
                done, estimate, ..
            } => match estimate.filter(|e| *e > 0) {
                Some(total) => {
                    let percent = (done.saturating_mul(100) / total).min(99);
                    if self.last_percent != Some(percent) {
                        self.last_percent = Some(percent);
                        self.progress_open = true;
                        print!("\r  {:>3}%  {} MB", percent, done / 1024 / 1024);
                        let _ = std::io::stdout().flush();
                    }
                }
                None => {
                    self.progress_open = true;
                    print!("\r  {} MB", done / 1024 / 1024);
                    let _ = std::io::stdout().flush();
                }
            },
            BuildEvent::Info(message) => {
                self.close_progress();
                println!("  {}", message);
            }
            BuildEvent::Warning(message) => {
                self.close_progress();
                eprintln!("  [WARN] {}", message);
            }
            BuildEvent::Failed { stage, message } => {
                self.close_progress();
                eprintln!("\n[FAILED] {}: {}", stage.description(), message);
            }
        }
    }
}
