pub mod config;
pub mod detection;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod sink;
pub mod tracker;
pub mod utils;
pub mod visualization;

// Re-export main types
pub use crate::config::{Config, TrackerKind};
pub use crate::detection::{Detection, Detector, YoloDetector};
pub use crate::error::{Collaborator, Error, Result};
pub use crate::frame::{Frame, FrameQueue, FrameSource, VideoSource};
pub use crate::pipeline::{run, AnnotatedFrame, Pipeline, RunSummary, StopReason};
pub use crate::sink::{Presenter, Recorder, TrackLog, WindowSink};
pub use crate::tracker::{build_tracker, Track, Tracker, TrackerInput};
