pub mod latch;
pub mod recorder;
pub mod session;

pub use latch::CaptureLatch;
pub use recorder::ScreenRecorder;
pub use session::{
    CaptureHandle, CaptureOptions, CaptureSession, CaptureState, Orientation, RecorderCommand,
    target_size,
};
