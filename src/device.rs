//! Device-automation drivers the report captures artifacts through.
//!
//! This module provides a narrow driver interface and two drivers:
//! - `AdbDevice` talks to an Android device through the `adb` binary
//! - `MockDevice` serves screenshots from an in-memory framebuffer for tests

use std::io::Cursor;
use std::path::PathBuf;
use std::process::Command;

use image::{GenericImageView, ImageBuffer, RgbImage};
use parking_lot::Mutex;
use thiserror::Error;

/// Errors raised by device drivers
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device or driver binary is not reachable
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// A driver command ran but reported failure
    #[error("command '{command}' failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// Image data could not be decoded or encoded
    #[error("image error: {0}")]
    Image(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<image::ImageError> for DeviceError {
    fn from(err: image::ImageError) -> Self {
        DeviceError::Image(err.to_string())
    }
}

/// Output of a shell command run on the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trait for device drivers
///
/// Only capture payloads are obtained through this interface. Callers treat
/// every failure as "no attachment produced".
pub trait DeviceDriver: Send + Sync {
    /// Run a shell-like command on the device
    fn run_shell_command(&self, command: &str) -> Result<CommandOutput, DeviceError>;

    /// PNG-encoded screenshot, or `None` when the device produced nothing
    fn take_screenshot(&self) -> Result<Option<Vec<u8>>, DeviceError>;

    /// Textual dump of the current UI hierarchy
    fn dump_hierarchy(&self) -> Result<String, DeviceError>;

    /// Native display resolution as (width, height).
    ///
    /// Defaults to decoding a screenshot and reading its dimensions.
    fn display_size(&self) -> Result<(u32, u32), DeviceError> {
        let png = self.take_screenshot()?.ok_or_else(|| {
            DeviceError::Unavailable("no screenshot to measure the display from".to_string())
        })?;
        Ok(image::load_from_memory(&png)?.dimensions())
    }
}

/// Driver for a device reachable through `adb`
#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb: PathBuf,
    serial: Option<String>,
}

impl AdbDevice {
    /// Use `adb` from `PATH` against the only connected device
    pub fn new() -> Self {
        Self {
            adb: PathBuf::from("adb"),
            serial: None,
        }
    }

    /// Target a specific device serial
    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Use a specific `adb` binary
    pub fn adb_path(mut self, adb: impl Into<PathBuf>) -> Self {
        self.adb = adb.into();
        self
    }

    pub fn serial_id(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.args(["-s", serial]);
        }
        cmd
    }

    fn exec_out(&self, args: &[&str]) -> Result<Vec<u8>, DeviceError> {
        let output = self
            .command()
            .arg("exec-out")
            .args(args)
            .output()
            .map_err(|e| DeviceError::Unavailable(format!("failed to run adb: {}", e)))?;
        if !output.status.success() {
            return Err(DeviceError::CommandFailed {
                command: args.join(" "),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl Default for AdbDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for AdbDevice {
    fn run_shell_command(&self, command: &str) -> Result<CommandOutput, DeviceError> {
        let output = self
            .command()
            .args(["shell", command])
            .output()
            .map_err(|e| DeviceError::Unavailable(format!("failed to run adb: {}", e)))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    fn take_screenshot(&self) -> Result<Option<Vec<u8>>, DeviceError> {
        let png = self.exec_out(&["screencap", "-p"])?;
        Ok(if png.is_empty() { None } else { Some(png) })
    }

    fn dump_hierarchy(&self) -> Result<String, DeviceError> {
        let raw = self.exec_out(&["uiautomator", "dump", "/dev/tty"])?;
        Ok(strip_dump_trailer(&String::from_utf8_lossy(&raw)))
    }

    fn display_size(&self) -> Result<(u32, u32), DeviceError> {
        let output = self.run_shell_command("wm size")?;
        parse_wm_size(&output.stdout).ok_or_else(|| DeviceError::CommandFailed {
            command: "wm size".to_string(),
            status: format!("{:?}", output.exit_code),
            stderr: format!("unrecognized output: {}", output.stdout.trim()),
        })
    }
}

/// `uiautomator dump /dev/tty` appends a status line after the XML
fn strip_dump_trailer(raw: &str) -> String {
    match raw.rfind('>') {
        Some(end) => raw[..=end].to_string(),
        None => raw.trim().to_string(),
    }
}

/// Parse `wm size` output, preferring an override size over the physical one
fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let mut physical = None;
    let mut override_size = None;
    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let size = crate::config::parse_dimensions(value);
        match label.trim() {
            "Physical size" => physical = size,
            "Override size" => override_size = size,
            _ => {}
        }
    }
    override_size.or(physical)
}

/// A virtual device backed by an RGB framebuffer
///
/// Screenshots are the framebuffer encoded as PNG. Every shell command is
/// recorded and answered with an empty successful output.
#[derive(Debug)]
pub struct MockDevice {
    /// Width in pixels
    width: u32,
    /// Height in pixels
    height: u32,
    /// RGB pixel buffer (row-major, 3 bytes per pixel)
    buffer: Mutex<Vec<u8>>,
    hierarchy: Mutex<String>,
    commands: Mutex<Vec<String>>,
    failing: Mutex<bool>,
}

impl MockDevice {
    /// Create a device with the given display size, initialized to black
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffer: Mutex::new(vec![0u8; (width * height * 3) as usize]),
            hierarchy: Mutex::new(String::from("<hierarchy rotation=\"0\"/>")),
            commands: Mutex::new(Vec::new()),
            failing: Mutex::new(false),
        }
    }

    /// Create a device whose screen is filled with a color
    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        let device = Self::new(width, height);
        device.fill(color);
        device
    }

    /// Fill the whole screen with a color
    pub fn fill(&self, color: [u8; 3]) {
        for chunk in self.buffer.lock().chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }
    }

    /// Draw a filled rectangle
    pub fn draw_rect(&self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        let mut buffer = self.buffer.lock();
        for py in y..(y + h).min(self.height) {
            for px in x..(x + w).min(self.width) {
                let idx = ((py * self.width + px) * 3) as usize;
                buffer[idx..idx + 3].copy_from_slice(&color);
            }
        }
    }

    /// Get the color of a pixel
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let buffer = self.buffer.lock();
        let idx = ((y * self.width + x) * 3) as usize;
        [buffer[idx], buffer[idx + 1], buffer[idx + 2]]
    }

    /// Replace the hierarchy returned by `dump_hierarchy`
    pub fn set_hierarchy(&self, xml: impl Into<String>) {
        *self.hierarchy.lock() = xml.into();
    }

    /// Make every capture call fail, simulating a broken driver
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Shell commands received so far
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    fn check_available(&self) -> Result<(), DeviceError> {
        if *self.failing.lock() {
            return Err(DeviceError::Unavailable("mock device set to fail".to_string()));
        }
        Ok(())
    }

    /// Encode the framebuffer as PNG bytes
    pub fn to_png(&self) -> Result<Vec<u8>, DeviceError> {
        let img: RgbImage = ImageBuffer::from_raw(self.width, self.height, self.buffer.lock().clone())
            .ok_or_else(|| DeviceError::Image("framebuffer size mismatch".to_string()))?;
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
        Ok(bytes)
    }
}

impl DeviceDriver for MockDevice {
    fn run_shell_command(&self, command: &str) -> Result<CommandOutput, DeviceError> {
        self.check_available()?;
        self.commands.lock().push(command.to_string());
        Ok(CommandOutput {
            exit_code: Some(0),
            ..CommandOutput::default()
        })
    }

    fn take_screenshot(&self) -> Result<Option<Vec<u8>>, DeviceError> {
        self.check_available()?;
        self.to_png().map(Some)
    }

    fn dump_hierarchy(&self) -> Result<String, DeviceError> {
        self.check_available()?;
        Ok(self.hierarchy.lock().clone())
    }

    fn display_size(&self) -> Result<(u32, u32), DeviceError> {
        self.check_available()?;
        Ok((self.width, self.height))
    }
}
