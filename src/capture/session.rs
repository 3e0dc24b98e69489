//! One in-flight screen recording: launch, watch, stop, persist.
//!
//! The recording process is spawned and monitored on a dedicated watcher
//! thread. The watcher polls the temp file and the process, firing the
//! first-write latch once bytes appear and the last-write latch once the
//! process has exited (all handles closed) or the file has been removed.

use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::latch::CaptureLatch;
use crate::config;
use crate::error::{ReportError, ReportResult};
use crate::storage::Storage;

/// Forced orientation of the recorded frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    /// Keep the device's native orientation
    #[default]
    Auto,
    Portrait,
    Landscape,
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Orientation::Auto),
            "portrait" => Ok(Orientation::Portrait),
            "landscape" => Ok(Orientation::Landscape),
            other => Err(format!(
                "unknown orientation '{}', expected auto, portrait or landscape",
                other
            )),
        }
    }
}

/// Encoding and timing options for a recording
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Bits per second handed to the recorder
    pub bitrate: u32,
    /// Scale applied to the native display resolution
    pub scale: f32,
    pub orientation: Orientation,
    /// Keep the recording of a passing test
    pub keep_on_success: bool,
    /// Minimum time to keep recording before a finalizing stop
    pub stop_delay: Duration,
    /// Pause after a finalizing stop before returning
    pub continue_delay: Duration,
    /// Bound on waiting for the first bytes of the recording
    pub start_timeout: Duration,
    /// Bound on waiting for the recording to be closed
    pub finish_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        let cfg = &config::get().capture;
        Self {
            bitrate: cfg.bitrate,
            scale: cfg.scale,
            orientation: cfg.orientation.parse().unwrap_or_default(),
            keep_on_success: cfg.keep_on_success,
            stop_delay: Duration::from_millis(cfg.stop_delay_ms),
            continue_delay: Duration::from_millis(cfg.continue_delay_ms),
            start_timeout: config::FIRST_WRITE_TIMEOUT,
            finish_timeout: config::LAST_WRITE_TIMEOUT,
            poll_interval: config::WATCH_POLL_INTERVAL,
        }
    }
}

/// Frame size for a recording: the native size scaled, rounded down to the
/// encoder alignment, then swapped if the orientation demands it.
pub fn target_size(native: (u32, u32), scale: f32, orientation: Orientation) -> (u32, u32) {
    let align = |value: u32| {
        let scaled = (value as f32 * scale) as u32;
        (scaled / config::ENCODER_ALIGNMENT * config::ENCODER_ALIGNMENT)
            .max(config::ENCODER_ALIGNMENT)
    };
    let (width, height) = (align(native.0), align(native.1));
    match orientation {
        Orientation::Landscape if width < height => (height, width),
        Orientation::Portrait if width > height => (height, width),
        _ => (width, height),
    }
}

/// The external program that records the screen.
///
/// Arguments may contain `{output}`, `{bitrate}`, `{width}`, `{height}` and
/// `{size}` placeholders. With `stdout_to_output` the program's stdout is
/// written to the temp file instead of the program writing it itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdout_to_output: bool,
    /// Extension of the recorded file
    pub extension: String,
    pub mime_type: String,
}

impl RecorderCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout_to_output: false,
            extension: "mp4".to_string(),
            mime_type: "video/mp4".to_string(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout_to_output(mut self, enabled: bool) -> Self {
        self.stdout_to_output = enabled;
        self
    }

    pub fn format(mut self, extension: impl Into<String>, mime_type: impl Into<String>) -> Self {
        self.extension = extension.into();
        self.mime_type = mime_type.into();
        self
    }

    /// `adb exec-out screenrecord` streaming raw H.264 to the temp file
    pub fn adb_screenrecord(serial: Option<&str>) -> Self {
        let mut command = Self::new("adb");
        if let Some(serial) = serial {
            command = command.args(["-s", serial]);
        }
        command
            .args([
                "exec-out",
                "screenrecord",
                "--output-format=h264",
                "--bit-rate",
                "{bitrate}",
                "--size",
                "{size}",
                "-",
            ])
            .stdout_to_output(true)
            .format("h264", "video/h264")
    }

    /// Arguments with placeholders substituted
    pub fn expand_args(&self, output: &Path, bitrate: u32, size: (u32, u32)) -> Vec<String> {
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{output}", &output)
                    .replace("{bitrate}", &bitrate.to_string())
                    .replace("{width}", &size.0.to_string())
                    .replace("{height}", &size.1.to_string())
                    .replace("{size}", &format!("{}x{}", size.0, size.1))
            })
            .collect()
    }

    fn build(&self, output: &Path, bitrate: u32, size: (u32, u32)) -> io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.expand_args(output, bitrate, size))
            .stdin(Stdio::null())
            .stderr(Stdio::null());
        if self.stdout_to_output {
            cmd.stdout(Stdio::from(fs::File::create(output)?));
        } else {
            cmd.stdout(Stdio::null());
        }
        Ok(cmd)
    }
}

/// Lifecycle position of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Starting,
    Recording,
    StoppingDiscard,
    StoppingFinalize,
}

/// Where a recording will end up once finalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureHandle {
    pub final_relative_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

enum Control {
    Interrupt,
    Terminate,
}

/// Which side of a discard finished last removes the temp file, so it is
/// only removed once the recorder can no longer write to it.
#[derive(Debug, Default)]
struct Teardown {
    discarded: bool,
    reaped: bool,
}

/// A running recording process and the latches tracking its file
#[derive(Debug)]
pub struct CaptureSession {
    temp_path: PathBuf,
    final_relative_path: PathBuf,
    size: (u32, u32),
    options: CaptureOptions,
    state: CaptureState,
    first_write: CaptureLatch,
    last_write: CaptureLatch,
    control: Option<Sender<Control>>,
    watcher: Option<JoinHandle<()>>,
    teardown: Arc<Mutex<Teardown>>,
}

impl CaptureSession {
    /// Launch the recorder writing to `temp_path` and wait (bounded) for its first bytes.
    ///
    /// Launching and the first write share one `start_timeout` deadline.
    pub fn start(
        command: &RecorderCommand,
        options: CaptureOptions,
        size: (u32, u32),
        temp_path: PathBuf,
        final_relative_path: PathBuf,
    ) -> ReportResult<Self> {
        let cmd = command
            .build(&temp_path, options.bitrate, size)
            .map_err(|e| ReportError::io(&temp_path, e))?;
        let deadline = Instant::now() + options.start_timeout;
        let first_write = CaptureLatch::new();
        let last_write = CaptureLatch::new();
        let teardown = Arc::new(Mutex::new(Teardown::default()));

        let (control_tx, control_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let watcher = {
            let temp_path = temp_path.clone();
            let latches = (first_write.clone(), last_write.clone());
            let teardown = Arc::clone(&teardown);
            let poll = options.poll_interval;
            thread::Builder::new()
                .name("capture-watch".to_string())
                .spawn(move || {
                    run_recorder(cmd, temp_path, latches, teardown, control_rx, ready_tx, poll)
                })
                .map_err(|e| ReportError::Capture {
                    details: format!("failed to spawn watcher thread: {}", e),
                })?
        };

        let mut session = Self {
            temp_path,
            final_relative_path,
            size,
            options,
            state: CaptureState::Starting,
            first_write,
            last_write,
            control: Some(control_tx),
            watcher: Some(watcher),
            teardown,
        };

        match ready_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(Ok(pid)) => debug!(pid, path = %session.temp_path.display(), "recorder launched"),
            Ok(Err(err)) => {
                session.state = CaptureState::Idle;
                session.control = None;
                return Err(ReportError::Capture {
                    details: format!("failed to launch '{}': {}", command.program, err),
                });
            }
            Err(_) => {
                session.discard();
                return Err(ReportError::Capture {
                    details: format!("'{}' did not launch in time", command.program),
                });
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !session.first_write.wait_timeout(remaining) {
            warn!(
                path = %session.temp_path.display(),
                timeout = ?session.options.start_timeout,
                "capture degraded: nothing written yet, continuing"
            );
        }
        session.state = CaptureState::Recording;
        Ok(session)
    }

    pub fn handle(&self) -> CaptureHandle {
        CaptureHandle {
            final_relative_path: self.final_relative_path.clone(),
            width: self.size.0,
            height: self.size.1,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_relative_path(&self) -> &Path {
        &self.final_relative_path
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    /// Kill the recorder and throw its output away. Returns without waiting.
    pub fn discard(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        self.state = CaptureState::StoppingDiscard;
        let reaped = {
            let mut teardown = self.teardown.lock();
            teardown.discarded = true;
            teardown.reaped
        };
        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Terminate);
        }
        // a live watcher reaps the process and removes the file itself
        self.watcher.take();
        if reaped {
            remove_temp(&self.temp_path);
        }
        self.state = CaptureState::Idle;
        info!(path = %self.temp_path.display(), "recording discarded");
    }

    /// Stop gracefully, wait (bounded) for the file to be closed, then copy
    /// it into storage. Returns the stored relative path, or `None` if the
    /// copy failed; failures are logged, never raised.
    pub fn finalize(mut self, storage: &dyn Storage) -> Option<PathBuf> {
        self.state = CaptureState::StoppingFinalize;
        thread::sleep(self.options.stop_delay);
        if let Some(control) = &self.control {
            let _ = control.send(Control::Interrupt);
        }
        if !self.last_write.wait_timeout(self.options.finish_timeout) {
            warn!(
                path = %self.temp_path.display(),
                timeout = ?self.options.finish_timeout,
                "capture degraded: recorder did not finish, keeping what was written"
            );
        }
        thread::sleep(self.options.continue_delay);

        // dropping the sender makes the watcher kill a recorder that is still alive
        self.control.take();
        if let Some(watcher) = self.watcher.take() {
            if watcher.join().is_err() {
                warn!("capture watcher thread panicked");
            }
        }
        self.state = CaptureState::Idle;

        let relative = storage.normalize(&self.final_relative_path);
        let result = persist(&self.temp_path, storage, &relative);
        remove_temp(&self.temp_path);
        match result {
            Ok(bytes) => {
                info!(path = %relative.display(), bytes, "recording stored");
                Some(relative)
            }
            Err(err) => {
                warn!(path = %relative.display(), error = %err, "failed to store recording");
                None
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.control.is_some() {
            self.abort();
        }
    }
}

/// Copy the temp file into storage through a fixed-size buffer.
///
/// A copy that fails partway deletes what it wrote.
fn persist(temp_path: &Path, storage: &dyn Storage, relative: &Path) -> io::Result<u64> {
    let mut input = fs::File::open(temp_path)?;
    let mut output = storage.open_output_stream(relative)?;
    let copied = copy_buffered(&mut input, output.as_mut());
    drop(output);
    if copied.is_err() && !storage.delete(relative) {
        warn!(path = %relative.display(), "partial recording could not be deleted");
    }
    copied
}

fn copy_buffered(input: &mut impl Read, output: &mut dyn Write) -> io::Result<u64> {
    let mut buffer = [0u8; config::COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        output.write_all(&buffer[..read])?;
        total += read as u64;
    }
    output.flush()?;
    Ok(total)
}

fn remove_temp(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove recording temp file"),
    }
}

/// Body of the watcher thread
fn run_recorder(
    mut cmd: Command,
    temp_path: PathBuf,
    (first_write, last_write): (CaptureLatch, CaptureLatch),
    teardown: Arc<Mutex<Teardown>>,
    control: Receiver<Control>,
    ready: Sender<io::Result<u32>>,
    poll: Duration,
) {
    let mut child = match cmd.spawn() {
        Ok(child) => {
            let _ = ready.send(Ok(child.id()));
            child
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            teardown.lock().reaped = true;
            last_write.signal();
            return;
        }
    };

    loop {
        let written = fs::metadata(&temp_path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        if written {
            first_write.signal();
        } else if first_write.is_signaled() && !temp_path.exists() {
            debug!(path = %temp_path.display(), "recording file removed");
            last_write.signal();
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(%status, "recorder exited");
                break;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "failed to poll recorder");
                break;
            }
        }

        match control.recv_timeout(poll) {
            Ok(Control::Interrupt) => interrupt(&mut child),
            Ok(Control::Terminate) => break,
            Err(RecvTimeoutError::Timeout) => {}
            // owner is gone, stop watching
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !matches!(child.try_wait(), Ok(Some(_))) {
        let _ = child.kill();
        let _ = child.wait();
    }
    let discarded = {
        let mut teardown = teardown.lock();
        teardown.reaped = true;
        teardown.discarded
    };
    if discarded {
        remove_temp(&temp_path);
    }
    last_write.signal();
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Err(err) = kill(Pid::from_raw(child.id() as i32), Signal::SIGINT) {
        warn!(error = %err, "failed to interrupt recorder, killing it");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.kill();
}
