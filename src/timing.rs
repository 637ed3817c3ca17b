//! Stage timing utilities.

use std::time::{Duration, Instant};

use crate::pipeline::Stage;
use crate::report::{BuildEvent, Reporter};

/// Measures one pipeline stage.
pub struct Timer {
    stage: Stage,
    start: Instant,
}

impl Timer {
    /// Start timing `stage` and announce it.
    pub fn start(stage: Stage, reporter: &mut dyn Reporter) -> Self {
        reporter.report(BuildEvent::StageStarted(stage));
        Self {
            stage,
            start: Instant::now(),
        }
    }

    /// Finish the timer, report the elapsed time and return it.
    pub fn finish(self, reporter: &mut dyn Reporter) -> Duration {
        let elapsed = self.start.elapsed();
        reporter.report(BuildEvent::StageFinished {
            stage: self.stage,
            elapsed,
        });
        elapsed
    }
}
