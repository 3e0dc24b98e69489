//! Closing a test: stop capture, settle the root, write the report, notify.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::listener::RunListener;
use super::serializer::ReportSerializer;
use crate::capture::ScreenRecorder;
use crate::error::{FailureCause, ReportError, ReportResult};
use crate::stage::{StageStatus, StageTree};
use crate::storage::Storage;

/// How the host runner says the test ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    Failed(FailureCause),
    Ignored,
}

impl RunOutcome {
    /// Whether an active recording should be thrown away
    fn discard_recording(&self, keep_on_success: bool) -> bool {
        match self {
            RunOutcome::Failed(_) => false,
            RunOutcome::Passed | RunOutcome::Ignored => !keep_on_success,
        }
    }
}

/// Finishes a test run exactly once
#[derive(Clone)]
pub struct ReportFinalizer {
    storage: Arc<dyn Storage>,
    serializer: Arc<dyn ReportSerializer>,
    listener: Arc<dyn RunListener>,
}

impl ReportFinalizer {
    pub fn new(
        storage: Arc<dyn Storage>,
        serializer: Arc<dyn ReportSerializer>,
        listener: Arc<dyn RunListener>,
    ) -> Self {
        Self {
            storage,
            serializer,
            listener,
        }
    }

    /// Settle the root stage with `outcome` and publish the report.
    ///
    /// Fails only with [`ReportError::InvalidState`] when the root already
    /// finished, after discarding any active recording. Recording, serialization and storage problems are logged
    /// and leave the result untouched. Returns the stored report path.
    pub fn finalize(
        &self,
        tree: &mut StageTree,
        mut recorder: Option<&mut ScreenRecorder>,
        outcome: RunOutcome,
    ) -> ReportResult<Option<PathBuf>> {
        let root_status = tree.root().status();
        if root_status.is_terminal() {
            if let Some(recorder) = recorder.as_deref_mut() {
                if recorder.is_recording() {
                    warn!(test = %tree.root().title(), "test already finished, discarding its recording");
                    recorder.stop(true, self.storage.as_ref());
                }
            }
            return Err(ReportError::InvalidState {
                stage: tree.root().title().to_string(),
                status: root_status,
            });
        }

        if let Some(recorder) = recorder.as_deref_mut() {
            let discard = outcome.discard_recording(recorder.options().keep_on_success);
            if let Some(video) = recorder.stop(discard, self.storage.as_ref()) {
                tree.root_mut().attach(video);
            }
        }

        match &outcome {
            RunOutcome::Passed => {
                tree.unwind_stack();
                tree.root_mut().pass(self.storage.as_ref())?;
            }
            RunOutcome::Failed(cause) => {
                let listener = Arc::clone(&self.listener);
                tree.propagate_failure(cause, |stage| {
                    listener.on_stage_finished(stage);
                    listener.on_stage_failed(stage);
                })?;
            }
            RunOutcome::Ignored => {
                tree.unwind_stack();
                tree.root_mut().ignore()?;
            }
        }
        if tree.root().status() != StageStatus::Failed {
            self.listener.on_stage_finished(tree.root());
        }

        let report = match self.write_report(tree) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(test = %tree.root().title(), error = %err, "failed to write report");
                None
            }
        };

        self.listener.on_test_finished(tree.root(), report.as_deref());
        info!(
            test = %tree.root().title(),
            status = %tree.root().status(),
            report = ?report,
            "test finalized"
        );

        if let Some(recorder) = recorder {
            recorder.clear_scratch();
        }
        Ok(report)
    }

    fn write_report(&self, tree: &StageTree) -> ReportResult<PathBuf> {
        let bytes = self.serializer.serialize(tree)?;
        let relative = PathBuf::from(self.serializer.file_name(tree.root()));
        let mut out = self
            .storage
            .open_output_stream(&relative)
            .map_err(|e| ReportError::io(&relative, e))?;
        out.write_all(&bytes)
            .and_then(|_| out.flush())
            .map_err(|e| ReportError::io(&relative, e))?;
        Ok(relative)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn listener(&self) -> &Arc<dyn RunListener> {
        &self.listener
    }

    pub fn report_root(&self) -> &Path {
        self.storage.root_output_dir()
    }
}
