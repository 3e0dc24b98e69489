use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use stage_report::config::{self, parse_dimensions};
use stage_report::{
    AdbDevice, DeviceDriver, DirectoryStorage, MockDevice, PropertyKey, RecorderCommand,
    ReportDocument, RunContext, RunSettings, RunSummary, ScratchDir, ScreenRecorder, StageKind,
    TestRun,
};

/// Stage Report - hierarchical test reports with device captures
#[derive(Parser, Debug)]
#[command(
    name = "stage-report",
    about = "Inspect stage reports and drive screen recordings",
    after_help = "ENVIRONMENT VARIABLES:\n\
        STAGE_REPORT_OUTPUT_DIR        Report root directory\n\
        STAGE_REPORT_SCRATCH_DIR       Directory for recording temp files\n\
        STAGE_REPORT_VIDEO_BITRATE     Recording bitrate (bits/s)\n\
        STAGE_REPORT_VIDEO_SCALE       Recording scale factor\n\
        STAGE_REPORT_VIDEO_ORIENTATION auto, portrait or landscape\n\
        STAGE_REPORT_KEEP_VIDEO        Keep recordings of passing tests\n\
        STAGE_REPORT_STEP_SCREENSHOTS  Screenshot every step\n\
        STAGE_REPORT_LOG               Log filter (e.g. debug, stage_report=trace)"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the stage tree of a JSON report
    Summary {
        /// Path to a *-result.json report
        report: PathBuf,
    },

    /// Record the screen once and store the video under the output directory
    Record {
        /// Report root directory
        #[arg(short, long, env = "STAGE_REPORT_OUTPUT_DIR", default_value = config::DEFAULT_OUTPUT_DIR)]
        output: PathBuf,

        /// Native display size: hd (720x1280), fhd (1080x1920), qhd (1440x2560), or WxH
        /// (default: asked from the device through adb)
        #[arg(long, short = 'd')]
        display: Option<String>,

        /// adb serial of the device to record
        #[arg(long, short = 's')]
        serial: Option<String>,

        /// How long to record in milliseconds
        #[arg(long, default_value = "3000")]
        duration_ms: u64,

        /// Stop by discarding instead of finalizing
        #[arg(long)]
        discard: bool,

        /// Recorder program and arguments (default: adb exec-out screenrecord)
        #[arg(last = true)]
        recorder: Vec<String>,
    },

    /// Run a scripted test against a mock device and write its report
    Demo {
        /// Report root directory
        #[arg(short, long, env = "STAGE_REPORT_OUTPUT_DIR", default_value = config::DEFAULT_OUTPUT_DIR)]
        output: PathBuf,

        /// Make the last step fail
        #[arg(long)]
        fail: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(config::ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    let args = Args::parse();

    match args.command {
        Some(Commands::Summary { report }) => {
            let bytes = std::fs::read(&report)?;
            let document: ReportDocument = serde_json::from_slice(&bytes)?;

            println!(
                "{} on {} at {}",
                report.display(),
                document.host,
                document.generated_at.to_rfc3339()
            );
            for (depth, record) in document.test.walk() {
                let indent = "  ".repeat(depth);
                println!(
                    "{}[{}] {} {} ({} ms)",
                    indent, record.status, record.kind, record.display_title, record.duration_ms
                );
                if let Some(failure) = &record.failure {
                    println!("{}    failure: {}", indent, failure.message);
                }
                for attachment in &record.attachments {
                    println!(
                        "{}    {}: {}",
                        indent,
                        attachment.description,
                        attachment.relative_path.display()
                    );
                }
            }
        }

        Some(Commands::Record {
            output,
            display,
            serial,
            duration_ms,
            discard,
            recorder,
        }) => {
            let native = match display {
                Some(display) => parse_dimensions(&display).ok_or_else(|| {
                    format!("Invalid display size '{}'. Use: hd, fhd, qhd, or WxH", display)
                })?,
                None => {
                    let mut device = AdbDevice::new();
                    if let Some(serial) = &serial {
                        device = device.serial(serial);
                    }
                    device.display_size()?
                }
            };
            let command = match recorder.split_first() {
                Some((program, rest)) => RecorderCommand::new(program.as_str()).args(rest.iter().cloned()),
                None => RecorderCommand::adb_screenrecord(serial.as_deref()),
            };
            let video_path = format!("video/recording.{}", command.extension);
            let storage = DirectoryStorage::new(&output);
            let scratch = ScratchDir::in_dir(&config::get().capture.scratch_dir).keep(true);
            let mut screen = ScreenRecorder::new(command).with_scratch(scratch);

            let handle = screen.start(native, video_path)?;
            println!(
                "Recording {}x{} for {} ms...",
                handle.width, handle.height, duration_ms
            );
            std::thread::sleep(Duration::from_millis(duration_ms));

            match screen.stop(discard, &storage) {
                Some(video) => println!(
                    "Saved recording: {}",
                    storage.resolve(&video.relative_path).display()
                ),
                None if discard => println!("Recording discarded"),
                None => println!("No recording was produced"),
            }
            screen.clear_scratch();
        }

        Some(Commands::Demo { output, fail }) => {
            let device = Arc::new(MockDevice::with_color(1080, 1920, [32, 32, 48]));
            device.draw_rect(0, 0, 1080, 160, [0, 120, 215]);
            device.set_hierarchy(
                "<hierarchy rotation=\"0\"><node text=\"Settings\" class=\"android.widget.TextView\"/></hierarchy>",
            );
            let summary = Arc::new(RunSummary::new());
            let context = RunContext::new(Arc::new(DirectoryStorage::new(&output)))
                .with_device(device.clone())
                .with_listener(summary.clone())
                .with_settings(RunSettings {
                    step_screenshots: true,
                    failure_artifacts: true,
                });
            let mut run = TestRun::new("Settings demo", Some("demo-settings".to_string()), context);

            let result = run.run(|run| -> Result<(), Box<dyn Error>> {
                run.set_property(PropertyKey::Severity, "normal")?;
                run.before("launch app", |_| Ok::<_, String>(()))?;
                run.step("Open settings", |run| {
                    run.screenshot("Settings screen");
                    Ok::<_, String>(())
                })?;
                run.step("Close settings", |_| {
                    if fail {
                        Err("boom".to_string())
                    } else {
                        Ok(())
                    }
                })?;
                run.skip_stage(StageKind::After, "upload logs")?;
                Ok(())
            });

            if let Err(failure) = &result {
                println!("Test failed: {}", failure.cause);
            }
            if let Some(report) = run.report_path() {
                println!("Report: {}", output.join(report).display());
            }
            let counts = summary.snapshot();
            println!(
                "passed: {}, failed: {}, skipped: {}, ignored: {}",
                counts.passed, counts.failed, counts.skipped, counts.ignored
            );
        }

        None => {
            println!("Stage Report - hierarchical test reports with device captures");
            println!();
            println!("Usage: stage-report <COMMAND>");
            println!();
            println!("Commands:");
            println!("  summary  Print the stage tree of a JSON report");
            println!("  record   Record the screen once into the report directory");
            println!("  demo     Run a scripted test against a mock device");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}
