//! Owner of the single screen recording allowed at a time.

use std::path::PathBuf;

use tracing::info;

use super::session::{CaptureHandle, CaptureOptions, CaptureSession, RecorderCommand, target_size};
use crate::error::{ReportError, ReportResult};
use crate::ids;
use crate::scratch::ScratchDir;
use crate::stage::Attachment;
use crate::storage::Storage;

/// Starts and stops recordings, keeping at most one alive.
///
/// Starting while a recording is active discards the active one first.
#[derive(Debug)]
pub struct ScreenRecorder {
    command: RecorderCommand,
    options: CaptureOptions,
    scratch: ScratchDir,
    active: Option<CaptureSession>,
}

impl ScreenRecorder {
    pub fn new(command: RecorderCommand) -> Self {
        Self {
            command,
            options: CaptureOptions::default(),
            scratch: ScratchDir::with_name("capture"),
            active: None,
        }
    }

    pub fn with_options(mut self, options: CaptureOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a specific scratch directory for temp files
    pub fn with_scratch(mut self, scratch: ScratchDir) -> Self {
        self.scratch = scratch;
        self
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    pub fn command(&self) -> &RecorderCommand {
        &self.command
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&CaptureSession> {
        self.active.as_ref()
    }

    /// Start recording a display of `native_size`, to be stored at `final_relative_path`.
    pub fn start(
        &mut self,
        native_size: (u32, u32),
        final_relative_path: impl Into<PathBuf>,
    ) -> ReportResult<CaptureHandle> {
        if let Some(previous) = self.active.take() {
            info!(
                path = %previous.final_relative_path().display(),
                "new recording requested, discarding the active one"
            );
            previous.discard();
        }

        let size = target_size(native_size, self.options.scale, self.options.orientation);
        self.scratch
            .init()
            .map_err(|e| ReportError::io(&self.scratch.dir, e))?;
        let file_name = format!(
            "{}.{}",
            ids::next_attachment_id("recording"),
            self.command.extension
        );
        let temp_path = self.scratch.file_path(&file_name);

        let session = CaptureSession::start(
            &self.command,
            self.options.clone(),
            size,
            temp_path,
            final_relative_path.into(),
        )?;
        let handle = session.handle();
        info!(
            path = %handle.final_relative_path.display(),
            width = handle.width,
            height = handle.height,
            "recording started"
        );
        self.active = Some(session);
        Ok(handle)
    }

    /// Stop the active recording, if any.
    ///
    /// With `discard` the recording is thrown away. Otherwise it is
    /// finalized into `storage` and described by the returned attachment.
    pub fn stop(&mut self, discard: bool, storage: &dyn Storage) -> Option<Attachment> {
        let session = self.active.take()?;
        if discard {
            session.discard();
            return None;
        }
        let path = session.finalize(storage)?;
        Some(Attachment::new(
            "Screen recording",
            path,
            self.command.mime_type.clone(),
            self.options.keep_on_success,
        ))
    }

    /// Drop leftover temp files from the previous run
    pub fn clear_scratch(&self) {
        self.scratch.clear();
    }
}
