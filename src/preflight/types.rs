//! Preflight check types and report.

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    /// A build on this host will fail.
    Fail,
    /// A build may work, or only some paths will.
    Warn,
    /// Not relevant to the current configuration.
    Skip,
}

impl CheckStatus {
    fn label(self) -> (&'static str, &'static str) {
        match self {
            Self::Pass => ("✓", "PASS"),
            Self::Fail => ("✗", "FAIL"),
            Self::Warn => ("⚠", "WARN"),
            Self::Skip => ("○", "SKIP"),
        }
    }
}

impl CheckResult {
    fn new(name: impl Into<String>, status: CheckStatus, details: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            details,
        }
    }

    pub fn pass(name: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, None)
    }

    pub fn pass_with(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, Some(details.into()))
    }

    pub fn fail(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, Some(details.into()))
    }

    pub fn warn(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, Some(details.into()))
    }

    pub fn skip(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Skip, Some(details.into()))
    }
}

/// Results of all preflight checks.
#[derive(Debug, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    /// True when no check failed.
    pub fn all_passed(&self) -> bool {
        self.fail_count() == 0
    }

    pub fn fail_count(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn warn_count(&self) -> usize {
        self.count(CheckStatus::Warn)
    }

    pub fn find(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        println!("=== Preflight Check Results ===\n");

        for check in &self.checks {
            let (icon, status) = check.status.label();
            match &check.details {
                Some(details) => println!("  {} [{}] {}: {}", icon, status, check.name, details),
                None => println!("  {} [{}] {}", icon, status, check.name),
            }
        }

        let applicable = self.checks.len() - self.count(CheckStatus::Skip);
        println!();
        println!(
            "Summary: {}/{} passed",
            self.count(CheckStatus::Pass),
            applicable
        );
        if self.fail_count() > 0 {
            println!("         {} FAILED - build will not succeed", self.fail_count());
        }
        if self.warn_count() > 0 {
            println!("         {} warnings", self.warn_count());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let report = PreflightReport {
            checks: vec![
                CheckResult::pass("rsync"),
                CheckResult::fail("xorriso", "Not found"),
                CheckResult::warn("apt-get", "Not found"),
                CheckResult::skip("builtin", "unused"),
            ],
        };
        assert!(!report.all_passed());
        assert_eq!(report.fail_count(), 1);
        assert_eq!(report.warn_count(), 1);
        assert_eq!(report.find("apt-get").unwrap().status, CheckStatus::Warn);
    }
}
