//! Stage Report - hierarchical test reports with device captures.
//!
//! This crate provides:
//! - A stage tree (test, step, scenario, before, after) with a strict status lifecycle
//! - An active-stage stack for "current stage" resolution and failure propagation
//! - Screen recording sessions driven by an external recorder process
//! - Screenshots and UI hierarchy dumps through a pluggable device driver
//! - Report finalization into pluggable storage and serializers
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stage_report::{DirectoryStorage, RunContext, TestRun};
//!
//! let context = RunContext::new(Arc::new(DirectoryStorage::new("./stage-report")));
//! let mut run = TestRun::new("Open settings", None, context);
//! let result = run.run(|run| -> Result<(), String> {
//!     run.step("tap settings", |_| Ok::<_, String>(()))?;
//!     run.step("check title", |_| Ok::<_, String>(()))
//! });
//! assert!(result.is_ok());
//! ```

pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod ids;
pub mod report;
pub mod run;
pub mod scratch;
pub mod stage;
pub mod storage;

// Re-export stage model
pub use stage::{
    ActiveStageStack, Attachment, Capabilities, ChildList, PropertyKey, PropertyValue, StageId,
    StageKind, StageNode, StageStatus, StageTree,
};

// Re-export errors
pub use error::{FailureCause, ReportError, ReportResult, TestBodyFailure};

// Re-export capture
pub use capture::{
    CaptureHandle, CaptureLatch, CaptureOptions, CaptureSession, CaptureState, Orientation,
    RecorderCommand, ScreenRecorder, target_size,
};

// Re-export reporting
pub use report::{
    JsonSerializer, NoopListener, ReportDocument, ReportFinalizer, ReportSerializer,
    RunListener, RunOutcome, RunSummary, StageRecord, SummaryCounts,
};

// Re-export orchestration and collaborators
pub use device::{AdbDevice, CommandOutput, DeviceDriver, DeviceError, MockDevice};
pub use run::{RunContext, RunSettings, StageOutcome, TestRun};
pub use scratch::ScratchDir;
pub use storage::{DirectoryStorage, MemoryStorage, Storage};
