//! Tracker capability and the bundled ByteTrack / DeepSORT backends.
mod byte_tracker;
mod deep_sort;
mod embedding;
mod kalman_filter;
mod matching;

pub use byte_tracker::{ByteTrackConfig, ByteTracker, STrack, TrackState};
pub use deep_sort::{DeepSortConfig, DeepSortTracker};
pub use embedding::{Embedder, HistogramEmbedder};
pub use kalman_filter::KalmanFilter;
pub use matching::{linear_assignment, Assignment};

use anyhow::Result;
use log::info;

use crate::config::{Config, TrackerKind};
use crate::detection::Detection;
use crate::frame::Frame;
use crate::utils::{self, BoxVec};

/// A detection in the shape trackers consume: integer `[x, y, w, h]` pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerInput {
    pub tlwh: [i32; 4],
    pub confidence: f32,
    pub class_id: i32,
}

impl TrackerInput {
    pub fn tlwh_f32(&self) -> BoxVec {
        let [x, y, w, h] = self.tlwh;
        BoxVec::new(x as f32, y as f32, w as f32, h as f32)
    }

    pub fn tlbr_f32(&self) -> BoxVec {
        utils::tlwh_to_tlbr(&self.tlwh_f32())
    }
}

impl From<&Detection> for TrackerInput {
    /// Corners are truncated to integer pixels first, so the width and height
    /// are exact differences of the reported corners.
    fn from(det: &Detection) -> Self {
        let corners = utils::pixel_corners(&det.tlbr());
        Self {
            tlwh: utils::corners_to_xywh(corners),
            confidence: det.confidence,
            class_id: det.class_id,
        }
    }
}

/// A tracker's view of one object in the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub track_id: u64,
    pub tlbr: BoxVec,
    /// Reliable enough to display. Unconfirmed tracks stay in the tracker's
    /// history but are not drawn.
    pub confirmed: bool,
    pub class_id: i32,
    pub score: f32,
}

impl Track {
    pub fn pixel_corners(&self) -> [i32; 4] {
        utils::pixel_corners(&self.tlbr)
    }
}

/// Multi-object tracking backend. The tracker owns its track history; callers
/// only read what `update` returns.
pub trait Tracker {
    /// Whether `update` uses frame pixels (appearance features).
    fn needs_frame(&self) -> bool {
        false
    }

    /// Advance one frame. An empty `detections` slice still ages tracks.
    fn update(&mut self, detections: &[TrackerInput], frame: Option<&Frame>) -> Result<Vec<Track>>;
}

impl<T: Tracker + ?Sized> Tracker for Box<T> {
    fn needs_frame(&self) -> bool {
        (**self).needs_frame()
    }

    fn update(&mut self, detections: &[TrackerInput], frame: Option<&Frame>) -> Result<Vec<Track>> {
        (**self).update(detections, frame)
    }
}

/// Build the configured backend. `fps` scales ByteTrack's lost-track buffer;
/// pass 0 when unknown.
pub fn build_tracker(cfg: &Config, fps: f64) -> Box<dyn Tracker> {
    match cfg.tracker {
        TrackerKind::ByteTrack => {
            let frame_rate = if fps > 0.0 { fps as f32 } else { 30.0 };
            let config = ByteTrackConfig {
                match_thresh: cfg.match_threshold,
                track_buffer: cfg.track_buffer,
                frame_rate,
                ..ByteTrackConfig::default()
            };
            info!(
                "Using ByteTrack tracker (match_thresh={}, track_buffer={}, frame_rate={:.1})",
                config.match_thresh, config.track_buffer, config.frame_rate
            );
            Box::new(ByteTracker::new(config))
        }
        TrackerKind::DeepSort => {
            let config = DeepSortConfig {
                max_age: cfg.max_track_age,
                n_init: cfg.n_init,
                ..DeepSortConfig::default()
            };
            info!(
                "Using DeepSORT tracker (max_age={}, n_init={})",
                config.max_age, config.n_init
            );
            Box::new(DeepSortTracker::new(config, HistogramEmbedder::default()))
        }
    }
}
