use anyhow::{bail, Context, Result};
use camola::capture::{CaptureSource, SyntheticCapture};
use camola::output::{CallTransport, RecordingTransport};
use camola::policy::parse_policy;
use camola::registry::{BackendChoice, Capabilities, Registry, SystemProbe, VariantRequest};
use camola::segmentation::DefaultBackendFactory;
use camola::{
    BackgroundSpec, EffectEvent, EffectsConfig, EffectsController, FrameTicker, ImageHandle,
    IntervalTicker, TickOutcome,
};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path (needs the `loopback` feature)
    #[arg(short, long)]
    output_device: Option<String>,

    /// Use a generated test pattern instead of the webcam
    #[arg(long)]
    synthetic: bool,

    /// Synthetic capture width
    #[arg(long, default_value_t = 640)]
    capture_width: u32,

    /// Synthetic capture height
    #[arg(long, default_value_t = 480)]
    capture_height: u32,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to the RVM model (ONNX file), for `--backend rvm`
    #[arg(long)]
    model: Option<PathBuf>,

    /// Segmentation backend id, or `auto`
    #[arg(long, default_value = "auto")]
    backend: String,

    /// Backend variant, e.g. `320x240`, `512x512:cuda`
    #[arg(long)]
    variant: Option<String>,

    /// Background: `none`, `blur:<radius>`, `image:<path>` or `upload:<path>`
    #[arg(long, default_value = "blur:15")]
    background: String,

    /// When to run inference: `every`, `skip:<n>` or `interval:<ms>`
    #[arg(long, default_value = "every")]
    policy: String,

    /// Mirror the outgoing video
    #[arg(long)]
    mirror: bool,

    /// Show matte visualization (grayscale silhouette) instead of the composite
    #[arg(long)]
    show_matte: bool,

    /// Stop after this many published frames
    #[arg(long)]
    frames: Option<u64>,

    /// Write capabilities, metrics and the backend comparison here on exit
    #[arg(long)]
    metrics_json: Option<PathBuf>,
}

#[derive(Serialize)]
struct Report {
    capabilities: Capabilities,
    metrics: camola::metrics::MetricsSnapshot,
    comparison: camola::metrics::ComparisonTable,
    process_errors: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("Camola starting");
    tracing::info!("Input device: {}", args.input_device);
    tracing::info!("Output: {}x{}", args.output_width, args.output_height);
    tracing::info!("Target FPS: {}", args.fps);

    let background = parse_background(&args.background)?;
    let choice = parse_choice(&args.backend, args.variant.as_deref())?;
    let policy = parse_policy(&args.policy)
        .map_err(anyhow::Error::msg)
        .context("Invalid --policy")?;

    // Camera problems end the program before any effect is attempted
    let capture = open_capture(&args).context("Camera unavailable")?;
    let transport = open_transport(&args).context("Failed to initialize video output")?;

    let registry = tokio::task::spawn_blocking(|| Registry::detect(&SystemProbe))
        .await
        .context("Capability detection failed")?;

    let config = EffectsConfig {
        mirror: args.mirror,
        show_matte: args.show_matte,
        ..EffectsConfig::default()
    };
    let factory = Arc::new(DefaultBackendFactory::new(args.model.clone()));
    let effects = EffectsController::start_call(capture, transport, registry, factory, config, &[])
        .context("Failed to start call")?;

    tracing::debug!(
        "Backends: {}",
        serde_json::to_string(&effects.backends()).unwrap_or_default()
    );

    effects.set_background_spec(background).await;
    effects.set_inference_policy(policy).await;
    let selection = effects
        .select_backend(choice)
        .await
        .context("Invalid backend selection")?;
    tracing::info!("Selected {} ({})", selection, selection.backend_name);

    if let Err(err) = effects.enable_background_effect().await {
        tracing::warn!("Background effect unavailable, sending the camera as is: {}", err);
    }

    let mut events = effects.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EffectEvent::SustainedProcessErrors { backend, failure_rate, .. } => {
                    tracing::warn!("{} is failing on {:.0}% of frames", backend, failure_rate * 100.0)
                }
                other => tracing::debug!("Effect event: {:?}", other),
            }
        }
    });

    let result = run_pipeline(&effects, args.fps, args.frames).await;

    effects
        .disable_background_effect()
        .await
        .context("Failed to stop background effect")?;
    if let Some(path) = &args.metrics_json {
        write_report(&effects, path).await?;
    }
    effects.end_call().await.context("Failed to end call")?;

    result
}

async fn run_pipeline(effects: &EffectsController, fps: u32, limit: Option<u64>) -> Result<()> {
    let mut ticker = IntervalTicker::from_fps(f64::from(fps));
    let mut published = 0u64;

    tracing::info!("Starting main pipeline loop");
    tracing::info!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping");
                return Ok(());
            }
            _ = ticker.next_tick() => {}
        }

        match effects.tick().await {
            Ok(TickOutcome::Published { .. } | TickOutcome::Passthrough { .. }) => published += 1,
            Ok(_) => continue,
            Err(err) => {
                tracing::error!("Camera or output failed: {}", err);
                return Err(err).context("Video pipeline stopped");
            }
        }

        // Log stats every 30 frames
        if published % 30 == 0 {
            let metrics = effects.current_metrics().await;
            tracing::info!(
                "Frame {}: backend={}, segment={:.1}ms, process={:.1}ms, fps={:.1}, errors={}",
                published,
                metrics.backend.as_deref().unwrap_or("off"),
                metrics.segmentation_ms,
                metrics.processing_ms,
                metrics.fps,
                effects.process_errors().await
            );
        }

        if limit.is_some_and(|limit| published >= limit) {
            tracing::info!("Published {} frames, stopping", published);
            return Ok(());
        }
    }
}

async fn write_report(effects: &EffectsController, path: &Path) -> Result<()> {
    let report = Report {
        capabilities: effects.device_capabilities(),
        metrics: effects.current_metrics().await,
        comparison: effects.comparison_table().await,
        process_errors: effects.process_errors().await,
    };
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize metrics")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    tracing::info!("Metrics written to {}", path.display());
    Ok(())
}

fn parse_background(spec: &str) -> Result<BackgroundSpec> {
    let (kind, value) = spec.split_once(':').unwrap_or((spec, ""));
    let spec = match kind {
        "none" => BackgroundSpec::None,
        "blur" => {
            let radius = if value.is_empty() {
                15
            } else {
                value
                    .parse()
                    .with_context(|| format!("Invalid blur radius {value:?}"))?
            };
            BackgroundSpec::Blur(radius)
        }
        "image" | "upload" if !value.is_empty() => {
            // Decoded in the background; frames pass through until it is ready
            let (handle, _task) = ImageHandle::spawn_load(value);
            if kind == "image" {
                BackgroundSpec::StaticImage(handle)
            } else {
                BackgroundSpec::UploadedImage(handle)
            }
        }
        _ => bail!("Unknown background {spec:?}; expected none, blur:<r>, image:<path> or upload:<path>"),
    };
    Ok(spec)
}

fn parse_choice(backend: &str, variant: Option<&str>) -> Result<BackendChoice> {
    if backend == "auto" {
        if variant.is_some() {
            bail!("--variant needs an explicit --backend");
        }
        return Ok(BackendChoice::Auto);
    }
    let variant = variant
        .map(|v| v.parse::<VariantRequest>())
        .transpose()
        .map_err(anyhow::Error::msg)
        .context("Invalid --variant")?;
    Ok(BackendChoice::explicit(backend, variant))
}

fn open_capture(args: &Args) -> Result<Box<dyn CaptureSource>> {
    #[cfg(feature = "webcam")]
    if !args.synthetic {
        let capture = camola::capture::WebcamCapture::new(args.input_device)?;
        return Ok(Box::new(capture));
    }

    if !args.synthetic {
        tracing::info!("Built without webcam support, using a test pattern");
    }
    Ok(Box::new(SyntheticCapture::new(
        args.capture_width,
        args.capture_height,
        f64::from(args.fps),
    )))
}

fn open_transport(args: &Args) -> Result<Box<dyn CallTransport>> {
    match &args.output_device {
        #[cfg(feature = "loopback")]
        Some(path) => Ok(Box::new(camola::output::V4L2Output::new(
            path,
            args.output_width,
            args.output_height,
        )?)),
        #[cfg(not(feature = "loopback"))]
        Some(path) => bail!("Cannot open {path}: built without the `loopback` feature"),
        None => {
            tracing::info!("No output device, frames are only counted");
            Ok(Box::new(RecordingTransport::new().with_retention(300)))
        }
    }
}
