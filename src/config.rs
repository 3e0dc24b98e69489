//! Configuration management with environment variable support.
//!
//! Centralized configuration for stage reporting, supporting:
//! - Environment variables for all configurable values
//! - Defaults tuned for on-device screen recording
//! - Builder-style overrides on the settings structs
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `STAGE_REPORT_OUTPUT_DIR` | Report root directory | `./stage-report` |
//! | `STAGE_REPORT_STEP_SCREENSHOTS` | Screenshot each step as it opens | `false` |
//! | `STAGE_REPORT_SCRATCH_DIR` | Base directory for recording temp files | `/tmp/stage-report` |
//! | `STAGE_REPORT_VIDEO_BITRATE` | Recording bitrate (bits/s) | `4000000` |
//! | `STAGE_REPORT_VIDEO_SCALE` | Scale applied to the native resolution | `1.0` |
//! | `STAGE_REPORT_VIDEO_ORIENTATION` | `auto`, `portrait` or `landscape` | `auto` |
//! | `STAGE_REPORT_KEEP_VIDEO` | Keep recordings of passing tests | `false` |
//! | `STAGE_REPORT_STOP_DELAY_MS` | Minimum recording tail before stopping | `1000` |
//! | `STAGE_REPORT_CONTINUE_DELAY_MS` | Pause after a finalized stop | `500` |
//! | `STAGE_REPORT_LOG` | Log filter for the binary | `info` |
//!
//! # Example
//!
//! ```bash
//! export STAGE_REPORT_OUTPUT_DIR="/sdcard/Documents/stage-report"
//! export STAGE_REPORT_VIDEO_SCALE="0.5"
//! export STAGE_REPORT_KEEP_VIDEO="true"
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Default Values
// ============================================================================

/// Default report root
pub const DEFAULT_OUTPUT_DIR: &str = "./stage-report";

/// Default base directory for recording temp files
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp/stage-report";

/// Default recording bitrate (bits per second)
pub const DEFAULT_VIDEO_BITRATE: u32 = 4_000_000;

/// Default scale applied to the native display resolution
pub const DEFAULT_VIDEO_SCALE: f32 = 1.0;

/// Default orientation handling
pub const DEFAULT_VIDEO_ORIENTATION: &str = "auto";

/// Default minimum recording tail before a finalizing stop (milliseconds)
pub const DEFAULT_STOP_DELAY_MS: u64 = 1000;

/// Default pause after a finalizing stop (milliseconds)
pub const DEFAULT_CONTINUE_DELAY_MS: u64 = 500;

/// How long `start` waits for the first bytes of a recording
pub const FIRST_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a finalizing `stop` waits for the recording to be closed
pub const LAST_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval at which the recording file and process are polled
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Buffer used when copying a finished recording into storage
pub const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Hardware encoders want frame dimensions in multiples of this
pub const ENCODER_ALIGNMENT: u32 = 8;

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_OUTPUT_DIR: &str = "STAGE_REPORT_OUTPUT_DIR";
pub const ENV_STEP_SCREENSHOTS: &str = "STAGE_REPORT_STEP_SCREENSHOTS";
pub const ENV_SCRATCH_DIR: &str = "STAGE_REPORT_SCRATCH_DIR";
pub const ENV_VIDEO_BITRATE: &str = "STAGE_REPORT_VIDEO_BITRATE";
pub const ENV_VIDEO_SCALE: &str = "STAGE_REPORT_VIDEO_SCALE";
pub const ENV_VIDEO_ORIENTATION: &str = "STAGE_REPORT_VIDEO_ORIENTATION";
pub const ENV_KEEP_VIDEO: &str = "STAGE_REPORT_KEEP_VIDEO";
pub const ENV_STOP_DELAY_MS: &str = "STAGE_REPORT_STOP_DELAY_MS";
pub const ENV_CONTINUE_DELAY_MS: &str = "STAGE_REPORT_CONTINUE_DELAY_MS";

/// Log filter read by the binary's subscriber
pub const ENV_LOG: &str = "STAGE_REPORT_LOG";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub report: ReportSettings,
    pub capture: CaptureSettings,
}

/// Report output settings
#[derive(Debug, Clone)]
pub struct ReportSettings {
    /// Root directory reports and attachments are written under
    pub output_dir: PathBuf,
    /// Take a screenshot as each step opens (pruned if the step passes)
    pub step_screenshots: bool,
}

/// Screen recording settings
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub scratch_dir: PathBuf,
    pub bitrate: u32,
    pub scale: f32,
    pub orientation: String,
    pub keep_on_success: bool,
    pub stop_delay_ms: u64,
    pub continue_delay_ms: u64,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            report: ReportSettings::from_env(),
            capture: CaptureSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            report: ReportSettings::defaults(),
            capture: CaptureSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ReportSettings {
    pub fn from_env() -> Self {
        Self {
            output_dir: env::var(ENV_OUTPUT_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            step_screenshots: env_flag(ENV_STEP_SCREENSHOTS).unwrap_or(false),
        }
    }

    pub fn defaults() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            step_screenshots: false,
        }
    }
}

impl CaptureSettings {
    pub fn from_env() -> Self {
        Self {
            scratch_dir: env::var(ENV_SCRATCH_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SCRATCH_DIR)),
            bitrate: env_parse(ENV_VIDEO_BITRATE).unwrap_or(DEFAULT_VIDEO_BITRATE),
            scale: env_parse(ENV_VIDEO_SCALE)
                .filter(|scale: &f32| *scale > 0.0)
                .unwrap_or(DEFAULT_VIDEO_SCALE),
            orientation: env::var(ENV_VIDEO_ORIENTATION)
                .unwrap_or_else(|_| DEFAULT_VIDEO_ORIENTATION.to_string()),
            keep_on_success: env_flag(ENV_KEEP_VIDEO).unwrap_or(false),
            stop_delay_ms: env_parse(ENV_STOP_DELAY_MS).unwrap_or(DEFAULT_STOP_DELAY_MS),
            continue_delay_ms: env_parse(ENV_CONTINUE_DELAY_MS)
                .unwrap_or(DEFAULT_CONTINUE_DELAY_MS),
        }
    }

    pub fn defaults() -> Self {
        Self {
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            bitrate: DEFAULT_VIDEO_BITRATE,
            scale: DEFAULT_VIDEO_SCALE,
            orientation: DEFAULT_VIDEO_ORIENTATION.to_string(),
            keep_on_success: false,
            stop_delay_ms: DEFAULT_STOP_DELAY_MS,
            continue_delay_ms: DEFAULT_CONTINUE_DELAY_MS,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| parse_flag(&s))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a display size string into (width, height).
/// Supports "WxH" plus the presets "hd" (720x1280), "fhd" (1080x1920) and "qhd" (1440x2560).
pub fn parse_dimensions(size: &str) -> Option<(u32, u32)> {
    match size.trim().to_lowercase().as_str() {
        "hd" => Some((720, 1280)),
        "fhd" => Some((1080, 1920)),
        "qhd" => Some((1440, 2560)),
        custom => {
            let parts: Vec<&str> = custom.split('x').collect();
            if parts.len() == 2 {
                let w = parts[0].trim().parse().ok()?;
                let h = parts[1].trim().parse().ok()?;
                Some((w, h))
            } else {
                None
            }
        }
    }
}
