use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::path::PathBuf;
use std::thread::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crosscount_core::{
    EngineConfig,
    correlation::TemplateTrackerFactory,
    counting::{CrossingEvent, Verdict},
    detection::{ClassNames, YoloDetector},
    evaluation::{PromptVerdicts, VerdictSource},
    pipeline::{Engine, RunHooks, RunReport, StopSignal},
    rendering::{AnnotatedVideoSink, FrameSink},
    runtime::configure_ort_dylib,
    session::JsonlSessionLogger,
    video::VideoReader,
};

/// Written when verbose output is requested without an explicit path.
const DEFAULT_ANNOTATED_OUTPUT: &str = "annotated.mp4";

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "crosscount",
    version,
    about = "Count objects crossing the frame midline in a video stream",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the counter over a video file or stream.
    Count(CountArgs),

    /// Print or write the effective configuration.
    Config {
        /// TOML settings file to start from
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the settings here instead of printing them
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct CountArgs {
    /// Input video path or stream URL
    #[arg(short, long)]
    input: Option<String>,

    /// TOML settings file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rows above this line are ignored by the detector
    #[arg(long)]
    roi: Option<u32>,

    /// Run detection every N processed frames
    #[arg(long)]
    skip: Option<u32>,

    /// Downscale frames wider than this
    #[arg(long)]
    maxw: Option<u32>,

    /// Frames a track may go unmatched before it is dropped
    #[arg(long)]
    max_disappeared: Option<u32>,

    /// YOLOv8 ONNX model path
    #[arg(long, default_value = "yolov8n.onnx")]
    model: PathBuf,

    /// Newline-separated class names (defaults to the COCO table)
    #[arg(long)]
    classes: Option<PathBuf>,

    /// JSON-lines session log
    #[arg(long, default_value = "events.jsonl")]
    events: PathBuf,

    /// Device identifier recorded with the session
    #[arg(long)]
    device_id: Option<String>,

    /// Write an annotated copy of the processed video (implies --verbose)
    #[arg(long)]
    annotate: Option<PathBuf>,

    /// Render the overlay for every processed frame
    #[arg(short, long)]
    verbose: bool,

    /// Ask for a verdict on every counted crossing (implies --verbose)
    #[arg(long)]
    evaluate: bool,

    /// Save the effective settings to this TOML file before running
    #[arg(long)]
    save_settings: Option<PathBuf>,
}

impl CountArgs {
    fn resolve_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(input) = &self.input {
            config.video_source = input.clone();
        }
        if let Some(roi) = self.roi {
            config.roi_y_cutoff = roi;
        }
        if let Some(skip) = self.skip {
            config.skip_interval = skip;
        }
        if let Some(maxw) = self.maxw {
            config.max_frame_width = maxw;
        }
        if let Some(max_disappeared) = self.max_disappeared {
            config.max_disappeared_frames = max_disappeared;
        }
        if let Some(device_id) = &self.device_id {
            config.device_id = device_id.clone();
        }
        config.verbose |= self.verbose || self.annotate.is_some();
        config.evaluation_mode |= self.evaluate;

        let config = config.normalized();
        config.validate()?;
        anyhow::ensure!(
            !config.video_source.is_empty(),
            "no input given; pass --input or set video_source in the settings file"
        );
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Count(args) => cmd_count(args),
        Commands::Config { config, output } => cmd_config(config, output),
    }
}

// ── count ─────────────────────────────────────────────────────────────────────

fn cmd_count(args: CountArgs) -> Result<()> {
    let config = args.resolve_config()?;
    info!("crossing counter");
    info!("  input    : {}", config.video_source);
    info!("  model    : {}", args.model.display());
    info!("  events   : {}", args.events.display());

    if let Some(path) = &args.save_settings {
        config.save(path)?;
        info!("  settings : {}", path.display());
    }

    configure_ort_dylib();
    let class_names = match &args.classes {
        Some(path) => ClassNames::load(path)?,
        None => ClassNames::coco(),
    };
    let detector = YoloDetector::load(&args.model)
        .with_context(|| format!("failed to load model: {}", args.model.display()))?;
    let mut reader = VideoReader::open(&config.video_source, config.max_frame_width)
        .with_context(|| format!("failed to open video: {}", config.video_source))?;
    let logger = JsonlSessionLogger::create(&args.events)?;

    let mut sink = if config.verbose {
        let path = args
            .annotate
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ANNOTATED_OUTPUT));
        let (width, height) = reader.dimensions();
        info!("  annotated: {}", path.display());
        Some(
            AnnotatedVideoSink::create(
                &path,
                width,
                height,
                reader.time_base(),
                reader.frame_rate(),
            )
            .with_context(|| format!("failed to create annotated output: {}", path.display()))?,
        )
    } else {
        None
    };

    let mut engine = Engine::new(
        config,
        detector,
        TemplateTrackerFactory::default(),
        logger,
    )?
    .with_class_names(class_names);
    stop_on(engine.stop_signal(), shutdown_requested())?;

    let pb = spinner("Counting…")?;
    let mut verdicts = engine.config().evaluation_mode.then(|| SuspendingVerdicts {
        pb: pb.clone(),
        inner: PromptVerdicts::stdin(),
    });
    let pb2 = pb.clone();
    let mut progress = move |frames: u64| {
        pb2.set_message(format!("Counting… {frames} frames"));
    };

    let hooks = RunHooks {
        sink: sink.as_mut().map(|s| s as &mut dyn FrameSink),
        verdicts: verdicts.as_mut().map(|v| v as &mut dyn VerdictSource),
        progress: Some(&mut progress as &mut dyn FnMut(u64)),
    };
    let report = engine.run(&mut reader, hooks);
    pb.finish_with_message("Done.");
    drop(reader);

    print_report(engine.config(), &report?);
    Ok(())
}

/// Hides the spinner while the operator answers.
struct SuspendingVerdicts<V> {
    pb: ProgressBar,
    inner: V,
}

impl<V: VerdictSource> VerdictSource for SuspendingVerdicts<V> {
    fn verdict(&mut self, event: &CrossingEvent) -> Result<Verdict> {
        let inner = &mut self.inner;
        self.pb.suspend(|| inner.verdict(event))
    }
}

fn print_report(config: &EngineConfig, report: &RunReport) {
    for track in report.tracks.values() {
        info!("{track}");
    }
    println!("Settings: {config}");
    println!("Session: {} ({:?})", report.session_id, report.termination);
    println!(
        "Elapsed Time: {:.2}, FPS: {:.2}, Frames: {}",
        report.elapsed_seconds, report.average_fps, report.frames_processed
    );
    println!("Up: {}, Down: {}", report.summary.up, report.summary.down);
    if let Some(evaluation) = &report.evaluation {
        println!("{evaluation}");
    }
}

// ── Interrupts ────────────────────────────────────────────────────────────────

/// Raise `stop` once `shutdown` completes, from a background thread, so the
/// run ends after the current frame and the session is closed.
fn stop_on<S>(stop: StopSignal, shutdown: S) -> Result<JoinHandle<()>>
where
    S: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    std::thread::Builder::new()
        .name("shutdown".into())
        .spawn(move || {
            runtime.block_on(shutdown);
            info!("stop requested; finishing the current frame");
            stop.raise();
        })
        .context("failed to spawn shutdown watcher")
}

/// Completes on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_requested() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// ── config ────────────────────────────────────────────────────────────────────

fn cmd_config(config: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let config = match config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    }
    .normalized();

    match output {
        Some(path) => {
            config.save(&path)?;
            info!("settings written to {}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .context("invalid spinner template")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    Ok(pb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_raises_the_stop_signal() {
        let stop = StopSignal::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let watcher = stop_on(stop.clone(), async move {
            let _ = rx.await;
        })
        .unwrap();
        assert!(!stop.is_raised());

        tx.send(()).unwrap();
        watcher.join().unwrap();
        assert!(stop.is_raised());
    }
}
