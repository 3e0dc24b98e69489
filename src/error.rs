//! Error types for stage reporting.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::panic::{UnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stage::{StageKind, StageStatus};

/// Result type for report operations
pub type ReportResult<T> = Result<T, ReportError>;

/// Error types for report operations
#[derive(Debug, Error)]
pub enum ReportError {
    /// A terminal transition was attempted on a stage that already finished
    #[error("stage '{stage}' is already {status}")]
    InvalidState { stage: String, status: StageStatus },

    /// The stage on top of the stack cannot hold children
    #[error("a {kind} stage cannot contain nested stages")]
    NestingNotAllowed { kind: StageKind },

    /// No stage is open, so there is nothing to attach to or end
    #[error("no stage is currently active")]
    NoActiveStage,

    /// A stage was closed while a different stage was on top of the stack
    #[error("cannot close stage '{closing}': '{top}' is still open above it")]
    UnbalancedStack { closing: String, top: String },

    /// The recording process could not be started or driven
    #[error("capture error: {details}")]
    Capture { details: String },

    /// The device-automation driver failed
    #[error("device error: {details}")]
    Device { details: String },

    /// I/O failure against a specific path
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Report serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ReportError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<crate::device::DeviceError> for ReportError {
    fn from(err: crate::device::DeviceError) -> Self {
        ReportError::Device {
            details: err.to_string(),
        }
    }
}

/// Why a stage failed: a message plus whatever trace the failing code produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub message: String,
    #[serde(default)]
    pub trace: String,
}

impl FailureCause {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }

    /// Build a cause from any error, using its source chain as the trace.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = Vec::new();
        let mut source = err.source();
        while let Some(inner) = source {
            trace.push(format!("caused by: {}", inner));
            source = inner.source();
        }
        Self {
            message: err.to_string(),
            trace: trace.join("\n"),
        }
    }

    /// Build a cause from a panic payload caught at the test boundary.
    ///
    /// The trace is the one recorded where the panic was raised when it
    /// happened inside [`catch_with_trace`], and empty otherwise.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "test body panicked".to_string()
        };
        match LAST_PANIC_TRACE.with(|slot| slot.borrow_mut().take()) {
            Some(trace) => Self::new(message).with_trace(trace),
            None => Self::new(message),
        }
    }
}

static PANIC_TRACE_HOOK: Once = Once::new();

thread_local! {
    static TRACE_PANICS: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Run `f` under `catch_unwind`, keeping the backtrace of a panic as it is
/// raised so [`FailureCause::from_panic`] can report it.
pub(crate) fn catch_with_trace<R>(f: impl FnOnce() -> R + UnwindSafe) -> std::thread::Result<R> {
    PANIC_TRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if TRACE_PANICS.with(Cell::get) {
                let trace = Backtrace::force_capture();
                if trace.status() == BacktraceStatus::Captured {
                    LAST_PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace.to_string()));
                }
            }
            previous(info);
        }));
    });

    LAST_PANIC_TRACE.with(|slot| slot.borrow_mut().take());
    let outer = TRACE_PANICS.with(|armed| armed.replace(true));
    let result = catch_unwind(f);
    TRACE_PANICS.with(|armed| armed.set(outer));
    result
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// An error that escaped the whole test body, re-surfaced to the host runner.
#[derive(Debug, Clone, Error)]
#[error("test body failed: {cause}")]
pub struct TestBodyFailure {
    pub cause: FailureCause,
}
