//! Notifications sent to the host runner while a test executes.

use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stage::{StageNode, StageStatus};

/// Receives stage events and the once-per-test final result.
///
/// Every method defaults to doing nothing.
pub trait RunListener: Send + Sync {
    fn on_stage_started(&self, _stage: &StageNode) {}

    /// Any stage reached a terminal status
    fn on_stage_finished(&self, _stage: &StageNode) {}

    fn on_stage_failed(&self, _stage: &StageNode) {}

    /// Called exactly once per test run with the finished root stage
    fn on_test_finished(&self, _root: &StageNode, _report: Option<&Path>) {}
}

/// Listener that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl RunListener for NoopListener {}

/// Counts of finished tests by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
    /// Stages failed anywhere in any test, roots included
    pub failed_stages: usize,
    pub failed_tests: Vec<String>,
}

impl SummaryCounts {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped + self.ignored
    }
}

/// Per-run aggregator the host runner can read after all tests finish
#[derive(Debug, Default)]
pub struct RunSummary {
    counts: Mutex<SummaryCounts>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SummaryCounts {
        self.counts.lock().clone()
    }
}

impl RunListener for RunSummary {
    fn on_stage_failed(&self, _stage: &StageNode) {
        self.counts.lock().failed_stages += 1;
    }

    fn on_test_finished(&self, root: &StageNode, report: Option<&Path>) {
        debug!(test = %root.title(), status = %root.status(), report = ?report, "test finished");
        let mut counts = self.counts.lock();
        match root.status() {
            StageStatus::Passed => counts.passed += 1,
            StageStatus::Failed => {
                counts.failed += 1;
                counts.failed_tests.push(root.display_title().to_string());
            }
            StageStatus::Skipped => counts.skipped += 1,
            StageStatus::Ignored => counts.ignored += 1,
            StageStatus::Running => {}
        }
    }
}
