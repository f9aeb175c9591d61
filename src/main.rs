//! Session runner: feeds a recorded match through the pipeline at capture pace
//! and writes the finished session record as JSON.
//!
//! Input is either a replay script of recorded model outputs, or raw RGB24
//! video run through the ONNX models (`onnx` feature).

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tennis_tracker::companion::{CompanionService, LogNotifier, TcpLink};
use tennis_tracker::config::Config;
use tennis_tracker::frame::{Frame, RawVideoReader};
use tennis_tracker::logging;
use tennis_tracker::pipeline::Pipeline;
use tennis_tracker::pose::SwingResult;
use tennis_tracker::recognition::replay::ReplayScript;
use tennis_tracker::recognition::Models;
use tennis_tracker::session::SessionEvent;

/// Time given to in-flight recognition after the last frame
const SETTLE: Duration = Duration::from_millis(300);

type FrameSource = Box<dyn Iterator<Item = Result<Frame>> + Send>;

#[derive(Debug, Parser)]
#[command(version = env!("GIT_VERSION"), about = "Tennis shot tracker")]
struct Args {
    /// Recorded session (JSON)
    #[arg(value_name = "SCRIPT", required_unless_present = "raw", conflicts_with = "raw")]
    script: Option<PathBuf>,
    /// Headerless RGB24 video, run through the models configured under [models]
    #[arg(long = "raw", value_name = "PATH")]
    raw: Option<PathBuf>,
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    width: u32,
    #[arg(long = "height", value_name = "PX", default_value_t = 480)]
    height: u32,
    #[arg(long = "fps", value_name = "FPS", default_value_t = 30.0)]
    fps: f64,
    #[arg(long = "config", value_name = "PATH", default_value = "config.toml")]
    config: PathBuf,
    /// Submit frames back to back instead of at capture pace
    #[arg(long = "fast", action = clap::ArgAction::SetTrue)]
    fast: bool,
    /// Write the session record here instead of stdout
    #[arg(long = "output", value_name = "PATH")]
    output: Option<PathBuf>,
    /// Video file the session was recorded to
    #[arg(long = "video", value_name = "PATH")]
    video: Option<String>,
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    info!("Tennis Tracker ({})", env!("GIT_VERSION"));
    let config = Config::load_or_default(&args.config);
    let (models, frames) = match (&args.script, &args.raw) {
        (Some(script), _) => {
            let script = ReplayScript::load(script)?;
            info!(frames = script.frames.len(), "replay script loaded");
            let frames: FrameSource = Box::new(script.frames().into_iter().map(Ok));
            (script.models(), frames)
        }
        (None, Some(raw)) => {
            let models = onnx_models(&config)?;
            info!(width = args.width, height = args.height, fps = args.fps, "raw video input");
            (models, raw_frames(raw, args.width, args.height, args.fps)?)
        }
        (None, None) => bail!("either a replay script or --raw is required"),
    };

    let link = Arc::new(TcpLink::from_config(&config.companion));
    let companion = CompanionService::spawn(link, Arc::new(LogNotifier), config.companion.clone());
    info!(companion = %config.companion.addr, "companion link started");
    let mut status = companion.handle().watch_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(status = current.as_str(), "companion status");
        }
    });

    let (pipeline, events) = Pipeline::start(&config, models, companion.handle())?;
    if let Some(video) = &args.video {
        pipeline.set_video_reference(video.clone());
    }

    let printer = tokio::spawn(log_events(events));

    // Capture thread
    let dispatcher = pipeline.dispatcher();
    let fast = args.fast;
    let capture = std::thread::spawn(move || {
        let start = Instant::now();
        let mut dispatched = 0usize;
        for frame in frames {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("capture stopped: {:#}", e);
                    break;
                }
            };
            if !fast {
                let elapsed = start.elapsed();
                if frame.timestamp > elapsed {
                    std::thread::sleep(frame.timestamp - elapsed);
                }
            }
            if dispatcher.submit(frame) {
                dispatched += 1;
            }
        }
        dispatched
    });
    let dispatched = tokio::task::spawn_blocking(move || capture.join())
        .await?
        .map_err(|_| anyhow::anyhow!("capture thread panicked"))?;
    debug!(dispatched, "capture finished");

    tokio::time::sleep(SETTLE).await;
    let record = pipeline.stop().await?;
    companion.shutdown().await;
    if let Err(e) = printer.await {
        warn!("event logger failed: {}", e);
    }

    info!(
        attempts = record.total_attempts,
        successful = record.successful_shots,
        failed = record.failed_shots,
        "session finished"
    );
    let json = serde_json::to_string_pretty(&record)?;
    match &args.output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}

fn raw_frames(path: &Path, width: u32, height: u32, fps: f64) -> Result<FrameSource> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Box::new(RawVideoReader::new(BufReader::new(file), width, height, fps)?))
}

#[cfg(feature = "onnx")]
fn onnx_models(config: &Config) -> Result<Models> {
    let models = tennis_tracker::recognition::onnx::load_models(&config.models)?;
    info!("ONNX models loaded");
    Ok(models)
}

#[cfg(not(feature = "onnx"))]
fn onnx_models(_config: &Config) -> Result<Models> {
    bail!("--raw needs a build with the `onnx` feature")
}

async fn log_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Detections {
                frame_index,
                detections,
                ball_state,
            } => {
                debug!(
                    frame_index,
                    ball = detections.ball.is_some(),
                    net = detections.net.is_some(),
                    racquet = detections.racquet.is_some(),
                    state = ?ball_state,
                    "detections"
                );
            }
            SessionEvent::Crossing(shot) => {
                info!(
                    frame_index = shot.verdict.frame_index,
                    result = shot.verdict.result.as_str(),
                    counted = shot.counted,
                    attempts = shot.counters.total_attempts,
                    successful = shot.counters.successful_shots,
                    "shot"
                );
            }
            SessionEvent::Angle(angle) => {
                info!(
                    frame_index = angle.frame_index,
                    face = angle.face.as_str(),
                    confidence = angle.confidence,
                    "racquet angle"
                );
            }
            SessionEvent::AngleCleared { frame_index } => {
                debug!(frame_index, "racquet angle cleared");
            }
            SessionEvent::Swing {
                result: SwingResult::Phase {
                    frame_index,
                    label,
                    impact_started: true,
                    ..
                },
                ..
            } => {
                info!(frame_index, phase = %label, "impact");
            }
            SessionEvent::Swing {
                result: SwingResult::Failed { frame_index, reason },
                ..
            } => {
                debug!(frame_index, "swing classification failed: {}", reason);
            }
            SessionEvent::Swing { .. } => {}
            SessionEvent::Presence { frame_index, present } => {
                info!(frame_index, present, "player presence changed");
            }
        }
    }
}
