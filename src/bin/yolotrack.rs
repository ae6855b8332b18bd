use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use yolotrack::{
    build_tracker, run, Config, Pipeline, Recorder, TrackLog, TrackerKind, VideoSource,
    WindowSink, YoloDetector,
};

/// Milliseconds to wait for a key press after each frame.
const POLL_TIMEOUT_MS: i32 = 1;

#[derive(Parser)]
#[command(
    name = "yolotrack",
    about = "YOLO detection with ByteTrack or DeepSORT tracking on a video file",
    version
)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the input video
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Path to TorchScript model weights
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Tracker backend
    #[arg(short, long, value_enum)]
    tracker: Option<TrackerKind>,

    /// Detection confidence threshold
    #[arg(long)]
    conf: Option<f32>,

    /// NMS IoU threshold
    #[arg(long)]
    iou: Option<f32>,

    /// Frames a DeepSORT track survives without a match
    #[arg(long)]
    max_age: Option<u32>,

    /// Record the annotated video to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write confirmed tracks per frame as JSON to this path
    #[arg(long)]
    track_log: Option<PathBuf>,

    /// Do not open a window
    #[arg(long)]
    headless: bool,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(input) = &self.input {
            config.video_path = input.to_string_lossy().into_owned();
        }
        if let Some(weights) = &self.weights {
            config.model_path = weights.to_string_lossy().into_owned();
        }
        if let Some(tracker) = self.tracker {
            config.tracker = tracker;
        }
        if let Some(conf) = self.conf {
            config.confidence_threshold = conf;
        }
        if let Some(iou) = self.iou {
            config.iou_threshold = iou;
        }
        if let Some(max_age) = self.max_age {
            config.max_track_age = max_age;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.load_config()?;

    let mut source = VideoSource::open(&config.video_path)?;
    let fps = source.fps()?;

    let detector = YoloDetector::from_config(&config)?;
    info!(
        "Loaded detector {:?} (conf={}, iou={})",
        config.model_path, config.confidence_threshold, config.iou_threshold
    );
    let tracker = build_tracker(&config, fps);
    let mut pipeline = Pipeline::new(detector, tracker);

    let window = if args.headless {
        None
    } else {
        Some(WindowSink::new(&config.window_name, &config.quit_keys)?)
    };
    let recorder = args.output.as_ref().map(|path| Recorder::new(path, fps));
    let track_log = args.track_log.as_ref().map(TrackLog::create).transpose()?;
    let mut sink = (window, (recorder, track_log));

    let summary = run(&mut source, &mut pipeline, &mut sink, POLL_TIMEOUT_MS)?;
    source.close()?;

    info!(
        "Done: {} frames from {:?} ({:?})",
        summary.frames_processed,
        source.path(),
        summary.stop_reason
    );
    Ok(())
}
