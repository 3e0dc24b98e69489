//! One test execution: the stage tree, capture and the host lifecycle hooks.

use std::fmt::Display;
use std::future::Future;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::capture::{CaptureHandle, ScreenRecorder};
use crate::config;
use crate::device::DeviceDriver;
use crate::error::{FailureCause, ReportError, ReportResult, TestBodyFailure, catch_with_trace};
use crate::ids::{next_attachment_id, sanitize_name};
use crate::report::{
    JsonSerializer, NoopListener, ReportFinalizer, ReportSerializer, RunListener, RunOutcome,
};
use crate::stage::{Attachment, PropertyKey, PropertyValue, StageId, StageKind, StageTree};
use crate::storage::Storage;

/// Optional captures taken on the test's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Screenshot every step as it opens. Kept only if the step fails.
    pub step_screenshots: bool,
    /// Attach a screenshot and a hierarchy dump to a stage that fails
    pub failure_artifacts: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            step_screenshots: config::get().report.step_screenshots,
            failure_artifacts: true,
        }
    }
}

/// Collaborators a [`TestRun`] reports through
#[derive(Clone)]
pub struct RunContext {
    pub storage: Arc<dyn Storage>,
    pub device: Option<Arc<dyn DeviceDriver>>,
    pub serializer: Arc<dyn ReportSerializer>,
    pub listener: Arc<dyn RunListener>,
    pub settings: RunSettings,
}

impl RunContext {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            device: None,
            serializer: Arc::new(JsonSerializer::new()),
            listener: Arc::new(NoopListener),
            settings: RunSettings::default(),
        }
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceDriver>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn ReportSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// How a stage opened with [`TestRun::begin_stage`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Passed,
    Failed(FailureCause),
    Skipped,
}

/// Drives one logical test from start to its final report.
///
/// The host runner calls [`on_starting`](Self::on_starting) and then exactly
/// one of [`on_succeeded`](Self::on_succeeded), [`on_failed`](Self::on_failed)
/// or [`on_ignored`](Self::on_ignored), or lets [`run`](Self::run) do it.
/// [`reset`](Self::reset) prepares the same instance for a retry.
pub struct TestRun {
    tree: StageTree,
    context: RunContext,
    finalizer: ReportFinalizer,
    recorder: Option<ScreenRecorder>,
    report: Option<PathBuf>,
}

impl TestRun {
    pub fn new(title: impl Into<String>, id: Option<String>, context: RunContext) -> Self {
        let finalizer = ReportFinalizer::new(
            Arc::clone(&context.storage),
            Arc::clone(&context.serializer),
            Arc::clone(&context.listener),
        );
        Self {
            tree: StageTree::new(title, id),
            context,
            finalizer,
            recorder: None,
            report: None,
        }
    }

    /// Record the screen for the whole test
    pub fn with_recorder(mut self, recorder: ScreenRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn tree(&self) -> &StageTree {
        &self.tree
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn recorder(&self) -> Option<&ScreenRecorder> {
        self.recorder.as_ref()
    }

    /// Where the last finalized report was stored, relative to the report root
    pub fn report_path(&self) -> Option<&Path> {
        self.report.as_deref()
    }

    // ------------------------------------------------------------------
    // Host lifecycle
    // ------------------------------------------------------------------

    /// The test is about to execute. Starts the recording if one is configured.
    pub fn on_starting(&mut self) -> Option<CaptureHandle> {
        self.context.listener.on_stage_started(self.tree.root());
        info!(test = %self.tree.root().title(), "test starting");

        let recorder = self.recorder.as_mut()?;
        let Some(device) = self.context.device.as_ref() else {
            warn!("screen recorder configured without a device, not recording");
            return None;
        };
        let size = match device.display_size() {
            Ok(size) => size,
            Err(err) => {
                warn!(error = %err, "could not read display size, not recording");
                return None;
            }
        };
        let path = PathBuf::from("video").join(format!(
            "{}.{}",
            sanitize_name(self.tree.root().execution_id()),
            recorder.command().extension
        ));
        match recorder.start(size, path) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "screen recording unavailable");
                None
            }
        }
    }

    pub fn on_succeeded(&mut self) -> ReportResult<Option<PathBuf>> {
        self.finish(RunOutcome::Passed)
    }

    pub fn on_failed(&mut self, cause: FailureCause) -> ReportResult<Option<PathBuf>> {
        self.finish(RunOutcome::Failed(cause))
    }

    pub fn on_ignored(&mut self) -> ReportResult<Option<PathBuf>> {
        self.finish(RunOutcome::Ignored)
    }

    fn finish(&mut self, outcome: RunOutcome) -> ReportResult<Option<PathBuf>> {
        let report = self
            .finalizer
            .finalize(&mut self.tree, self.recorder.as_mut(), outcome)?;
        self.report = report.clone();
        Ok(report)
    }

    /// Forget everything recorded so far so the same test can execute again.
    pub fn reset(&mut self) {
        let storage = Arc::clone(&self.context.storage);
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.stop(true, storage.as_ref());
        }
        self.tree.reset(storage.as_ref());
        self.report = None;
        debug!(test = %self.tree.root().title(), "test run reset");
    }

    /// Execute a whole test body and finalize the report.
    ///
    /// An `Err` or a panic escaping `body` fails every stage still open and
    /// then the test itself, and is handed back as a [`TestBodyFailure`].
    pub fn run<T, E, F>(&mut self, body: F) -> Result<T, TestBodyFailure>
    where
        E: Display,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        self.execute(body, |err| FailureCause::new(err.to_string()))
    }

    /// Like [`run`](Self::run), but an `Err` keeps its source chain as the
    /// failure trace.
    pub fn try_run<T, E, F>(&mut self, body: F) -> Result<T, TestBodyFailure>
    where
        E: std::error::Error + 'static,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        self.execute(body, |err| FailureCause::from_error(&err))
    }

    fn execute<T, E, F, C>(&mut self, body: F, to_cause: C) -> Result<T, TestBodyFailure>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        C: FnOnce(E) -> FailureCause,
    {
        self.on_starting();
        let outcome = catch_with_trace(AssertUnwindSafe(|| body(self)));
        let cause = match outcome {
            Ok(Ok(value)) => {
                if let Err(err) = self.on_succeeded() {
                    warn!(error = %err, "could not finalize passed test");
                }
                return Ok(value);
            }
            Ok(Err(err)) => to_cause(err),
            Err(payload) => FailureCause::from_panic(payload.as_ref()),
        };
        if let Err(err) = self.on_failed(cause.clone()) {
            warn!(error = %err, "could not finalize failed test");
        }
        Err(TestBodyFailure { cause })
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    /// Open a stage under the current one.
    pub fn begin_stage(
        &mut self,
        kind: StageKind,
        title: impl Into<String>,
    ) -> ReportResult<StageId> {
        let id = self.tree.open(kind, title, None)?;
        self.context.listener.on_stage_started(self.tree.node(id));
        if kind == StageKind::Step && self.context.settings.step_screenshots {
            self.capture_screenshot(id, "Step start", false);
        }
        Ok(id)
    }

    /// Settle `id` with `outcome` and close it. `id` must be the current stage.
    pub fn end_stage(&mut self, id: StageId, outcome: StageOutcome) -> ReportResult<()> {
        if self.tree.current() != Some(id) {
            // leaves the stack alone and reports what is open instead
            return self.tree.close(id);
        }
        let settled = self.settle_stage(id, outcome);
        self.tree.close(id)?;
        settled
    }

    fn settle_stage(&mut self, id: StageId, outcome: StageOutcome) -> ReportResult<()> {
        let storage = Arc::clone(&self.context.storage);
        match outcome {
            StageOutcome::Passed => self.tree.node_mut(id).pass(storage.as_ref())?,
            StageOutcome::Failed(cause) => {
                if self.context.settings.failure_artifacts {
                    self.attach_failure_artifacts(id);
                }
                self.tree.node_mut(id).fail(cause)?;
                self.context.listener.on_stage_failed(self.tree.node(id));
            }
            StageOutcome::Skipped => self.tree.node_mut(id).skip()?,
        }
        self.context.listener.on_stage_finished(self.tree.node(id));
        Ok(())
    }

    /// Run `body` as a nested stage of `kind`.
    ///
    /// The stage passes when `body` returns `Ok` and fails with the error's
    /// message otherwise; the error is returned unchanged. A panic leaves
    /// the stage open for [`run`](Self::run) to fail.
    ///
    /// # Panics
    ///
    /// Panics if the current stage cannot hold children or no stage is open.
    pub fn stage<T, E, F>(&mut self, kind: StageKind, title: &str, body: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        let id = self.open_or_panic(kind, title);
        let result = body(self);
        self.close_with(id, &result);
        result
    }

    pub fn step<T, E, F>(&mut self, title: &str, body: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        self.stage(StageKind::Step, title, body)
    }

    /// A reusable group of steps
    pub fn scenario<T, E, F>(&mut self, title: &str, body: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        self.stage(StageKind::Scenario, title, body)
    }

    pub fn before<T, E, F>(&mut self, title: &str, body: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        self.stage(StageKind::Before, title, body)
    }

    pub fn after<T, E, F>(&mut self, title: &str, body: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        self.stage(StageKind::After, title, body)
    }

    /// Run a future as a nested stage.
    ///
    /// The future cannot reach the run itself. Bodies that open their own
    /// stages across await points use [`begin_stage`](Self::begin_stage) and
    /// [`end_stage`](Self::end_stage) directly.
    ///
    /// # Panics
    ///
    /// Same as [`stage`](Self::stage).
    pub async fn stage_async<T, E, Fut>(
        &mut self,
        kind: StageKind,
        title: &str,
        body: Fut,
    ) -> Result<T, E>
    where
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let id = self.open_or_panic(kind, title);
        let result = body.await;
        self.close_with(id, &result);
        result
    }

    /// Record a stage that was not executed
    pub fn skip_stage(&mut self, kind: StageKind, title: &str) -> ReportResult<StageId> {
        let id = self.begin_stage(kind, title)?;
        self.end_stage(id, StageOutcome::Skipped)?;
        Ok(id)
    }

    fn open_or_panic(&mut self, kind: StageKind, title: &str) -> StageId {
        match self.begin_stage(kind, title) {
            Ok(id) => id,
            Err(err) => panic!("cannot open {kind} stage '{title}': {err}"),
        }
    }

    fn close_with<T, E: Display>(&mut self, id: StageId, result: &Result<T, E>) {
        let outcome = match result {
            Ok(_) => StageOutcome::Passed,
            Err(err) => StageOutcome::Failed(FailureCause::new(err.to_string())),
        };
        if let Err(err) = self.end_stage(id, outcome) {
            panic!("cannot close stage '{}': {err}", self.tree.node(id).title());
        }
    }

    // ------------------------------------------------------------------
    // Attachments and metadata
    // ------------------------------------------------------------------

    /// Screenshot attached to the innermost stage that takes screenshots
    pub fn screenshot(&mut self, description: &str) -> Option<Attachment> {
        let target = self.tree.screenshot_target()?;
        self.capture_screenshot(target, description, true)
    }

    /// UI hierarchy dump attached to the innermost stage that takes attachments
    pub fn dump_hierarchy(&mut self, description: &str) -> Option<Attachment> {
        let target = self.tree.attach_target()?;
        self.capture_hierarchy(target, description, true)
    }

    /// Store `bytes` and attach them to the innermost stage that takes attachments
    pub fn attach_bytes(
        &mut self,
        description: &str,
        name: &str,
        mime_type: &str,
        bytes: &[u8],
        keep_on_success: bool,
    ) -> ReportResult<Attachment> {
        let target = self.tree.attach_target().ok_or(ReportError::NoActiveStage)?;
        let path = PathBuf::from("attachments").join(format!(
            "{}-{}",
            next_attachment_id("attachment"),
            sanitize_name(name)
        ));
        self.write_attachment(&path, bytes)?;
        let attachment = Attachment::new(description, path, mime_type, keep_on_success);
        self.tree.node_mut(target).attach(attachment.clone());
        Ok(attachment)
    }

    pub fn set_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> ReportResult<()> {
        let current = self.tree.current().ok_or(ReportError::NoActiveStage)?;
        self.tree.node_mut(current).set_parameter(name, value);
        Ok(())
    }

    pub fn set_property(
        &mut self,
        key: PropertyKey,
        value: impl Into<PropertyValue>,
    ) -> ReportResult<()> {
        let current = self.tree.current().ok_or(ReportError::NoActiveStage)?;
        self.tree.node_mut(current).set_property(key, value);
        Ok(())
    }

    fn attach_failure_artifacts(&mut self, id: StageId) {
        let capabilities = self.tree.node(id).kind().capabilities();
        if capabilities.can_screenshot {
            self.capture_screenshot(id, "Failure screenshot", true);
        }
        if capabilities.can_attach {
            self.capture_hierarchy(id, "Failure hierarchy", true);
        }
    }

    fn capture_screenshot(
        &mut self,
        target: StageId,
        description: &str,
        keep_on_success: bool,
    ) -> Option<Attachment> {
        let device = self.context.device.clone()?;
        let png = match device.take_screenshot() {
            Ok(Some(png)) => png,
            Ok(None) => {
                debug!(description, "device returned no screenshot");
                return None;
            }
            Err(err) => {
                warn!(description, error = %err, "screenshot failed");
                return None;
            }
        };
        let path = PathBuf::from("screenshots")
            .join(format!("{}.png", next_attachment_id("screenshot")));
        self.store(target, description, path, "image/png", &png, keep_on_success)
    }

    fn capture_hierarchy(
        &mut self,
        target: StageId,
        description: &str,
        keep_on_success: bool,
    ) -> Option<Attachment> {
        let device = self.context.device.clone()?;
        let xml = match device.dump_hierarchy() {
            Ok(xml) => xml,
            Err(err) => {
                warn!(description, error = %err, "hierarchy dump failed");
                return None;
            }
        };
        let path = PathBuf::from("hierarchy")
            .join(format!("{}.xml", next_attachment_id("hierarchy")));
        self.store(
            target,
            description,
            path,
            "application/xml",
            xml.as_bytes(),
            keep_on_success,
        )
    }

    fn store(
        &mut self,
        target: StageId,
        description: &str,
        path: PathBuf,
        mime_type: &str,
        bytes: &[u8],
        keep_on_success: bool,
    ) -> Option<Attachment> {
        if let Err(err) = self.write_attachment(&path, bytes) {
            warn!(description, error = %err, "could not store attachment");
            return None;
        }
        let attachment = Attachment::new(description, path, mime_type, keep_on_success);
        self.tree.node_mut(target).attach(attachment.clone());
        Some(attachment)
    }

    fn write_attachment(&self, path: &Path, bytes: &[u8]) -> ReportResult<()> {
        let mut out = self
            .context
            .storage
            .open_output_stream(path)
            .map_err(|e| ReportError::io(path, e))?;
        out.write_all(bytes)
            .and_then(|_| out.flush())
            .map_err(|e| ReportError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;
    use crate::report::RunSummary;
    use crate::stage::StageStatus;
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;

    fn settings(step_screenshots: bool) -> RunSettings {
        RunSettings {
            step_screenshots,
            failure_artifacts: true,
        }
    }

    fn test_run(storage: &MemoryStorage, device: Option<MockDevice>) -> TestRun {
        let mut context =
            RunContext::new(Arc::new(storage.clone())).with_settings(settings(false));
        if let Some(device) = device {
            context = context.with_device(Arc::new(device));
        }
        TestRun::new("checkout", None, context)
    }

    #[test]
    fn test_step_passes_and_closes() {
        let storage = MemoryStorage::new();
        let mut run = test_run(&storage, None);

        let value: Result<u32, String> = run.step("open cart", |_| Ok(3));

        assert_eq!(value, Ok(3));
        let step = run.tree().root().test_children()[0];
        assert_eq!(run.tree().node(step).status(), StageStatus::Passed);
        assert_eq!(run.tree().current(), Some(run.tree().root_id()));
    }

    #[test]
    fn test_failed_step_gets_failure_artifacts() {
        let storage = MemoryStorage::new();
        let device = MockDevice::new(16, 16);
        device.set_hierarchy("<hierarchy/>");
        let mut run = test_run(&storage, Some(device));

        let result: Result<(), String> = run.step("pay", |_| Err("declined".to_string()));
        assert!(result.is_err());

        let step = run.tree().node(run.tree().root().test_children()[0]);
        assert_eq!(step.status(), StageStatus::Failed);
        assert_eq!(step.failure_cause().unwrap().message, "declined");
        let mimes: Vec<&str> = step.attachments().iter().map(|a| a.mime_type.as_str()).collect();
        assert_eq!(mimes, vec!["image/png", "application/xml"]);
        for attachment in step.attachments() {
            assert!(storage.contains(&attachment.relative_path));
        }
    }

    #[test]
    fn test_step_screenshot_is_pruned_when_step_passes() {
        let storage = MemoryStorage::new();
        let context = RunContext::new(Arc::new(storage.clone()))
            .with_device(Arc::new(MockDevice::new(8, 8)))
            .with_settings(settings(true));
        let mut run = TestRun::new("checkout", None, context);

        let _: Result<(), String> = run.step("open", |_| Ok(()));

        let step = run.tree().node(run.tree().root().test_children()[0]);
        assert!(step.attachments().is_empty());
        assert_eq!(storage.deleted().len(), 1);
    }

    #[test]
    fn test_scenario_screenshot_lands_on_enclosing_test() {
        let storage = MemoryStorage::new();
        let mut run = test_run(&storage, Some(MockDevice::new(8, 8)));

        let _: Result<(), String> = run.scenario("login flow", |run| {
            run.screenshot("inside scenario");
            Ok(())
        });

        assert_eq!(run.tree().root().attachments().len(), 1);
        let scenario = run.tree().node(run.tree().root().test_children()[0]);
        assert!(scenario.attachments().is_empty());
    }

    #[test]
    fn test_run_reports_error_and_fails_root() {
        let storage = MemoryStorage::new();
        let summary = Arc::new(RunSummary::new());
        let context = RunContext::new(Arc::new(storage.clone()))
            .with_listener(summary.clone())
            .with_settings(settings(false));
        let mut run = TestRun::new("checkout", Some("CASE-1".to_string()), context);

        let failure = run
            .run(|run| run.step("pay", |_| Err::<(), _>("boom".to_string())))
            .unwrap_err();

        assert_eq!(failure.cause.message, "boom");
        assert_eq!(run.tree().root().status(), StageStatus::Failed);
        assert_eq!(run.report_path(), Some(Path::new("CASE-1-result.json")));
        assert!(storage.contains("CASE-1-result.json"));
        assert_eq!(summary.snapshot().failed_tests, vec!["checkout".to_string()]);
    }

    #[test]
    fn test_skip_stage_and_metadata() {
        let storage = MemoryStorage::new();
        let mut run = test_run(&storage, None);

        let skipped = run.skip_stage(StageKind::After, "cleanup").unwrap();
        run.set_parameter("locale", "en").unwrap();
        run.set_property(PropertyKey::Owner, "payments").unwrap();
        let attachment = run
            .attach_bytes("log", "app.log", "text/plain", b"hello", true)
            .unwrap();

        assert_eq!(run.tree().node(skipped).status(), StageStatus::Skipped);
        let root = run.tree().root();
        assert_eq!(root.parameters().get("locale").map(String::as_str), Some("en"));
        assert_eq!(root.property(PropertyKey::Owner), Some(&PropertyValue::from("payments")));
        assert_eq!(storage.contents(&attachment.relative_path).unwrap(), b"hello".to_vec());
    }

    #[test]
    fn test_reset_allows_second_execution() {
        let storage = MemoryStorage::new();
        let mut run = test_run(&storage, Some(MockDevice::new(8, 8)));

        let _ = run.run(|run| {
            run.screenshot("first attempt");
            Err::<(), _>("flaky")
        });
        assert_eq!(run.tree().root().status(), StageStatus::Failed);

        run.reset();
        assert_eq!(run.tree().root().status(), StageStatus::Running);
        assert_eq!(run.tree().len(), 1);
        assert!(run.report_path().is_none());

        run.run(|_| Ok::<_, String>(())).unwrap();
        assert_eq!(run.tree().root().status(), StageStatus::Passed);
    }

    #[test]
    fn test_retry_after_reset_keeps_test_id() {
        let storage = MemoryStorage::new();
        let context = RunContext::new(Arc::new(storage.clone())).with_settings(settings(false));
        let mut run = TestRun::new("checkout", Some("CASE-1".to_string()), context);

        let _ = run.run(|_| Err::<(), _>("flaky"));
        assert_eq!(run.report_path(), Some(Path::new("CASE-1-result.json")));

        run.reset();
        run.run(|_| Ok::<_, String>(())).unwrap();

        assert_eq!(run.tree().root().id(), "CASE-1");
        assert_eq!(run.report_path(), Some(Path::new("CASE-1-result.json")));
        assert_eq!(storage.paths(), vec![PathBuf::from("CASE-1-result.json")]);
    }

    #[derive(Debug, thiserror::Error)]
    #[error("payment rejected")]
    struct PaymentRejected(#[source] std::io::Error);

    #[test]
    fn test_try_run_keeps_error_chain() {
        let storage = MemoryStorage::new();
        let mut run = test_run(&storage, None);

        let failure = run
            .try_run(|_| -> Result<(), PaymentRejected> {
                Err(PaymentRejected(std::io::Error::other("gateway timeout")))
            })
            .unwrap_err();

        assert_eq!(failure.cause.message, "payment rejected");
        assert_eq!(failure.cause.trace, "caused by: gateway timeout");
        assert_eq!(run.tree().root().failure_cause(), Some(&failure.cause));
    }

    #[test]
    fn test_panicking_body_reports_a_trace() {
        let storage = MemoryStorage::new();
        let mut run = test_run(&storage, None);

        let failure = run
            .run(|_| -> Result<(), String> { panic!("no cart") })
            .unwrap_err();

        assert_eq!(failure.cause.message, "no cart");
        assert!(!failure.cause.trace.is_empty());
    }

    #[test]
    fn test_second_terminal_hook_is_rejected() {
        let storage = MemoryStorage::new();
        let mut run = test_run(&storage, None);
        run.on_succeeded().unwrap();
        assert!(matches!(
            run.on_failed(FailureCause::new("late")),
            Err(ReportError::InvalidState { .. })
        ));
    }
}
