pub mod finalizer;
pub mod listener;
pub mod serializer;

pub use finalizer::{ReportFinalizer, RunOutcome};
pub use listener::{NoopListener, RunListener, RunSummary, SummaryCounts};
pub use serializer::{FORMAT_VERSION, JsonSerializer, ReportDocument, ReportSerializer, StageRecord};
