//! Verdict accumulation and the final summary.

use std::process::ExitCode;

use serde::Serialize;

use crate::checker::InvariantVerdict;
use crate::error::HarnessError;

/// A step that did not run, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct Skipped {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct Report {
    verdicts: Vec<InvariantVerdict>,
    skipped: Vec<Skipped>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a verdict. Failed verdicts never stop the run.
    pub fn record(&mut self, verdict: InvariantVerdict) -> bool {
        let passed = verdict.passed;
        if passed {
            tracing::info!(
                name = %verdict.name,
                expected = %verdict.expected,
                observed = %verdict.observed,
                "PASS"
            );
        } else {
            tracing::warn!(
                name = %verdict.name,
                expected = %verdict.expected,
                observed = %verdict.observed,
                "FAIL"
            );
        }
        self.verdicts.push(verdict);
        passed
    }

    pub fn skip(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        let skipped = Skipped {
            name: name.into(),
            reason: reason.into(),
        };
        tracing::warn!(name = %skipped.name, reason = %skipped.reason, "SKIP");
        self.skipped.push(skipped);
    }

    /// Record a scenario that stopped early as a failed verdict.
    pub fn abort(&mut self, scenario: &str, err: &HarnessError) {
        tracing::error!(scenario, error = %err, "scenario aborted");
        self.verdicts.push(InvariantVerdict::new(
            format!("{}.aborted", scenario),
            "scenario completes",
            err,
            false,
        ));
    }

    pub fn verdicts(&self) -> &[InvariantVerdict] {
        &self.verdicts
    }

    pub fn skipped(&self) -> &[Skipped] {
        &self.skipped
    }

    pub fn passed_count(&self) -> usize {
        self.verdicts.iter().filter(|v| v.passed).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &InvariantVerdict> {
        self.verdicts.iter().filter(|v| !v.passed)
    }

    pub fn all_passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.passed)
    }

    /// Plain-text summary: one line per verdict, then the totals.
    pub fn render(&self) -> String {
        let mut out = String::from("=== SUMMARY ===\n");
        for v in &self.verdicts {
            let status = if v.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "[{}] {} | expected={} actual={}\n",
                status, v.name, v.expected, v.observed
            ));
        }
        for s in &self.skipped {
            out.push_str(&format!("[SKIP] {} | {}\n", s.name, s.reason));
        }
        out.push_str(&format!(
            "checks_passed={}/{}\n",
            self.passed_count(),
            self.verdicts.len()
        ));
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.all_passed() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}
