use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilescale_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use tilescale_core::engine::{load_registry, UpscaleEngine, MODEL_CATALOG_FILE_NAME};
use tilescale_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use tilescale_core::types::{
    OutputFormat, TargetSize, UpscaleMode, UpscaleOptions, UpscalePreset, UpscaleRequest,
};
use tilescale_core::worker::{UpscaleWorker, CANCELLED_STATUS};
use tilescale_core::{ProgressStage, UpscaleEvent};

#[derive(Parser)]
#[command(name = "tilescale", about = "Tiled super-resolution image upscaler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale one image file.
    Upscale(UpscaleArgs),
    /// Print the model table as JSON.
    Models,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Photo,
    Anime,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PresetArg {
    Fast,
    Balanced,
    High,
}

impl From<ModeArg> for UpscaleMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Photo => Self::Photo,
            ModeArg::Anime => Self::Anime,
            ModeArg::Text => Self::Text,
        }
    }
}

impl From<PresetArg> for UpscalePreset {
    fn from(value: PresetArg) -> Self {
        match value {
            PresetArg::Fast => Self::Fast,
            PresetArg::Balanced => Self::Balanced,
            PresetArg::High => Self::High,
        }
    }
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Input image (PNG, JPEG or WebP)")]
    input: PathBuf,
    #[arg(
        short = 'o',
        long,
        help = "Output path; the extension picks the format (default: <input>_x<scale>.png)"
    )]
    output: Option<PathBuf>,
    #[arg(long, help = "JSON file with base upscale options; flags override it")]
    options: Option<PathBuf>,
    #[arg(short = 's', long, value_parser = ["2", "4"])]
    scale: Option<String>,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    #[arg(long, value_enum)]
    preset: Option<PresetArg>,
    #[arg(long, help = "Detail fidelity in 0..1; higher sharpens more")]
    fidelity: Option<f32>,
    #[arg(long, help = "JPEG quality in 0..1")]
    quality: Option<f32>,
    #[arg(long = "no-accel", help = "Run models on the CPU provider only")]
    no_accel: bool,
    #[arg(long, help = "Fixed tile side in source pixels (disables auto sizing)")]
    tile_size: Option<u32>,
    #[arg(long)]
    tile_overlap: Option<u32>,
    #[arg(
        long,
        value_name = "WxH",
        help = "Fit inside this size instead of using --scale"
    )]
    target: Option<String>,
    #[arg(long, help = "Build the 2x model session before the request")]
    warm_up: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_libs = tilescale_core::runtime::setup_runtime_libs();
    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        eprintln!("Warning: failed to initialize data directory: {e:#}");
    }
    let config = load_config(&resolved_data_dir);
    let logs_dir = config.resolved_paths(&resolved_data_dir).logs_dir;
    init_logging(Some(logs_dir.as_path()), cli.verbose, cli.log_filter.as_deref());
    tilescale_core::runtime::log_runtime_lib_status(&runtime_libs);
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, config, resolved_data_dir).await,
        Commands::Models => print_models(&resolved_data_dir),
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Warning: failed to load config file, using defaults: {err:#}");
            AppConfig::default()
        }
    }
}

fn init_logging(log_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        log_dir: log_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filters.effective_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::RedactingMakeWriter::new(appender))
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Disabled {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn print_models(data_dir: &Path) -> Result<()> {
    let registry = load_registry(&data_dir.join(MODEL_CATALOG_FILE_NAME))?;
    println!("{}", registry.to_json()?);
    Ok(())
}

/// `--options` file first, then individual flags on top.
fn build_options(args: &UpscaleArgs) -> Result<UpscaleOptions> {
    let mut options = match &args.options {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read options file: {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse options JSON: {}", path.display()))?
        }
        None => UpscaleOptions::default(),
    };

    if let Some(scale) = &args.scale {
        options.scale = scale.parse().context("invalid --scale")?;
    }
    if let Some(mode) = args.mode {
        options.mode = mode.into();
    }
    if let Some(preset) = args.preset {
        options.preset = preset.into();
    }
    if let Some(fidelity) = args.fidelity {
        options.fidelity = fidelity;
    }
    if let Some(quality) = args.quality {
        options.output.quality = quality;
    }
    if args.no_accel {
        options.use_acceleration = false;
    }
    if let Some(size) = args.tile_size {
        options.tile.auto = false;
        options.tile.size = size;
    }
    if let Some(overlap) = args.tile_overlap {
        options.tile.overlap = overlap;
    }
    if let Some(target) = &args.target {
        options.target_size = Some(parse_target(target)?);
    }
    if let Some(output) = &args.output {
        options.output.format = format_for_path(output)?;
    }

    options.validate()?;
    Ok(options)
}

fn parse_target(raw: &str) -> Result<TargetSize> {
    let (width, height) = raw
        .split_once(['x', 'X'])
        .with_context(|| format!("invalid --target '{raw}' (expected WxH)"))?;
    Ok(TargetSize {
        width: width.trim().parse().context("invalid target width")?,
        height: height.trim().parse().context("invalid target height")?,
    })
}

fn format_for_path(path: &Path) -> Result<OutputFormat> {
    let mime = mime_guess::from_path(path)
        .first()
        .with_context(|| format!("cannot infer output format from {}", path.display()))?;
    match OutputFormat::from_mime_type(mime.essence_str()) {
        Some(format) => Ok(format),
        None => bail!("unsupported output format {mime} for {}", path.display()),
    }
}

fn default_output_path(input: &Path, options: &UpscaleOptions) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upscaled".to_string());
    let suffix = match options.target_size {
        Some(target) => format!("{}x{}", target.width, target.height),
        None => format!("x{}", options.scale),
    };
    input.with_file_name(format!(
        "{stem}_{suffix}.{}",
        options.output.format.extension()
    ))
}

async fn run_upscale(args: UpscaleArgs, config: AppConfig, data_dir: PathBuf) -> Result<()> {
    if !args.input.is_file() {
        bail!("Input image does not exist: {}", args.input.display());
    }
    let options = build_options(&args)?;
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input, &options));
    let image = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read input image: {}", args.input.display()))?;

    let engine = UpscaleEngine::from_config(&config, &data_dir)?;
    let (events_tx, mut events) = unbounded_channel();
    let worker = UpscaleWorker::spawn(engine, events_tx)?;
    if args.warm_up {
        worker.warm_up(options.mode, options.preset, options.use_acceleration)?;
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    info!(%request_id, input = %args.input.display(), "Submitting upscale request");
    worker.submit(UpscaleRequest {
        request_id: request_id.clone(),
        image,
        options,
    })?;

    let mut cancel_requested = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                eprintln!();
                warn!(%request_id, "Interrupted; cancelling after the current tile");
                worker.cancel(&request_id);
                continue;
            }
        };
        let Some(event) = event else {
            bail!("upscale worker stopped before finishing the request");
        };

        match event {
            UpscaleEvent::Progress {
                done_tiles,
                total_tiles,
                eta_seconds,
                stage,
                ..
            } => print_progress(stage, done_tiles, total_tiles, eta_seconds),
            UpscaleEvent::Status { message, .. } if message == CANCELLED_STATUS => {
                eprintln!();
                bail!("Upscale cancelled");
            }
            UpscaleEvent::Status { message, .. } => info!("{message}"),
            UpscaleEvent::Diagnostic { diagnostics, .. } => {
                info!(
                    path = diagnostics.path.as_deref().unwrap_or("-"),
                    provider = diagnostics.provider.as_deref().unwrap_or("-"),
                    model = diagnostics.model_id.as_deref().unwrap_or("-"),
                    fallback = diagnostics.fallback.as_deref().unwrap_or("-"),
                    "Engine diagnostics"
                );
            }
            UpscaleEvent::Result {
                image,
                width,
                height,
                format,
                ..
            } => {
                eprintln!();
                std::fs::write(&output_path, &image).with_context(|| {
                    format!("Failed to write output image: {}", output_path.display())
                })?;
                info!(
                    output = %output_path.display(),
                    width,
                    height,
                    format = format.mime_type(),
                    "Upscale written"
                );
                break;
            }
            UpscaleEvent::Error { message, .. } => {
                eprintln!();
                bail!("Upscale failed: {message}");
            }
        }
    }

    worker.shutdown()
}

fn format_duration(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn progress_line(
    stage: ProgressStage,
    done: usize,
    total: usize,
    eta_seconds: Option<u64>,
) -> String {
    match stage {
        ProgressStage::Decode => "Decoding...".to_string(),
        ProgressStage::Encode => "Encoding...".to_string(),
        ProgressStage::Upscale | ProgressStage::Blend => {
            let fraction = if total > 0 {
                (done as f64 / total as f64).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
            let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
            let bar: String = "█".repeat(filled) + &"░".repeat(empty);
            let eta = eta_seconds
                .map(|secs| format!(" | ETA: {}", format_duration(secs)))
                .unwrap_or_default();
            format!(
                "[{}] {:5.1}% | Tile {}/{}{}",
                bar,
                fraction * 100.0,
                done,
                total,
                eta
            )
        }
    }
}

fn print_progress(stage: ProgressStage, done: usize, total: usize, eta_seconds: Option<u64>) {
    eprint!("\r{}    ", progress_line(stage, done, total, eta_seconds));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> UpscaleArgs {
        let cli = Cli::try_parse_from(args).expect("parse cli");
        match cli.command {
            Commands::Upscale(args) => args,
            Commands::Models => panic!("expected upscale"),
        }
    }

    #[test]
    fn flags_override_defaults() {
        let args = parse(&[
            "tilescale",
            "upscale",
            "in.png",
            "-o",
            "out.webp",
            "--scale",
            "4",
            "--mode",
            "anime",
            "--preset",
            "high",
            "--no-accel",
            "--tile-size",
            "256",
        ]);
        let options = build_options(&args).expect("options");
        assert_eq!(options.scale, 4);
        assert_eq!(options.mode, UpscaleMode::Anime);
        assert_eq!(options.preset, UpscalePreset::High);
        assert!(!options.use_acceleration);
        assert!(!options.tile.auto);
        assert_eq!(options.tile.size, 256);
        assert_eq!(options.output.format, OutputFormat::Webp);
    }

    #[test]
    fn scale_outside_two_and_four_is_rejected_by_clap() {
        assert!(Cli::try_parse_from(["tilescale", "upscale", "in.png", "--scale", "3"]).is_err());
    }

    #[test]
    fn options_file_is_the_base_layer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("options.json");
        std::fs::write(&path, r#"{"mode":"text","fidelity":0.9,"scale":4}"#).expect("write");
        let path_arg = path.display().to_string();
        let args = parse(&[
            "tilescale",
            "upscale",
            "in.png",
            "--options",
            &path_arg,
            "--scale",
            "2",
        ]);
        let options = build_options(&args).expect("options");
        assert_eq!(options.mode, UpscaleMode::Text);
        assert_eq!(options.scale, 2);
        assert!((options.fidelity - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn output_format_follows_extension() {
        assert_eq!(format_for_path(Path::new("a.jpg")).expect("jpg"), OutputFormat::Jpeg);
        assert_eq!(format_for_path(Path::new("a.JPEG")).expect("jpeg"), OutputFormat::Jpeg);
        assert_eq!(format_for_path(Path::new("a.png")).expect("png"), OutputFormat::Png);
        assert!(format_for_path(Path::new("a.gif")).is_err());
        assert!(format_for_path(Path::new("noext")).is_err());
    }

    #[test]
    fn target_parses_width_by_height() {
        assert_eq!(
            parse_target("1920x1080").expect("target"),
            TargetSize {
                width: 1920,
                height: 1080
            }
        );
        assert!(parse_target("1920").is_err());
        assert!(parse_target("ax1").is_err());
    }

    #[test]
    fn default_output_sits_next_to_input() {
        let options = UpscaleOptions::default();
        assert_eq!(
            default_output_path(Path::new("/pics/cat.jpg"), &options),
            PathBuf::from("/pics/cat_x2.png")
        );
    }

    #[test]
    fn progress_line_shows_tiles_and_eta() {
        let line = progress_line(ProgressStage::Upscale, 3, 6, Some(75));
        assert!(line.contains(" 50.0%"));
        assert!(line.contains("Tile 3/6"));
        assert!(line.ends_with("ETA: 00:01:15"));
        assert_eq!(progress_line(ProgressStage::Encode, 6, 6, None), "Encoding...");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(6595), "01:49:55");
        assert_eq!(format_duration(45), "00:00:45");
        assert_eq!(format_duration(0), "00:00:00");
    }
}
