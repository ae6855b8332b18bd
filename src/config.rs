use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which bundled tracker backend drives the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    /// IoU-only two-stage association.
    #[value(name = "bytetrack")]
    ByteTrack,
    /// Appearance + motion association with a confirmation delay.
    #[value(name = "deepsort")]
    DeepSort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video_path: String,
    pub model_path: String,
    pub device: String,
    pub input_size: [i32; 2],
    pub confidence_threshold: f32,
    /// NMS overlap limit for the ByteTrack variant.
    pub iou_threshold: f32,
    /// Frames a DeepSORT track survives without a match.
    pub max_track_age: u32,
    /// DeepSORT hits before a track is confirmed.
    pub n_init: u32,
    /// ByteTrack lost-track buffer, in frames at 30 fps.
    pub track_buffer: u32,
    /// ByteTrack IoU-distance gate for the first association.
    pub match_threshold: f32,
    pub classes: Option<Vec<i32>>,
    /// Class count of the detector head; fixes how its output is laid out.
    pub num_classes: Option<usize>,
    pub tracker: TrackerKind,
    pub window_name: String,
    pub quit_keys: Vec<i32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video_path: "video.mp4".to_string(),
            model_path: "yolo11n.torchscript".to_string(),
            device: "cpu".to_string(),
            input_size: [640, 640],
            confidence_threshold: 0.3,
            iou_threshold: 0.5,
            max_track_age: 30,
            n_init: 3,
            track_buffer: 30,
            match_threshold: 0.8,
            classes: None,
            num_classes: None,
            tracker: TrackerKind::ByteTrack,
            window_name: "yolotrack".to_string(),
            // 'q' and Esc
            quit_keys: vec![113, 27],
        }
    }
}

impl Config {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let cfg: Config = serde_json::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.confidence_threshold) {
            return Err(Error::InvalidConfig(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !unit.contains(&self.iou_threshold) {
            return Err(Error::InvalidConfig(format!(
                "iou_threshold must be in [0, 1], got {}",
                self.iou_threshold
            )));
        }
        if !unit.contains(&self.match_threshold) {
            return Err(Error::InvalidConfig(format!(
                "match_threshold must be in [0, 1], got {}",
                self.match_threshold
            )));
        }
        if self.n_init == 0 {
            return Err(Error::InvalidConfig("n_init must be at least 1".into()));
        }
        if self.num_classes == Some(0) {
            return Err(Error::InvalidConfig("num_classes must be at least 1".into()));
        }
        if self.input_size.iter().any(|&s| s <= 0) {
            return Err(Error::InvalidConfig(format!(
                "input_size must be positive, got {:?}",
                self.input_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.tracker, TrackerKind::ByteTrack);
        assert_eq!(cfg.quit_keys, vec![113, 27]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = Config::from_json(
            r#"{ "video_path": "clip.avi", "tracker": "deepsort", "max_track_age": 45 }"#,
        )
        .unwrap();

        assert_eq!(cfg.video_path, "clip.avi");
        assert_eq!(cfg.tracker, TrackerKind::DeepSort);
        assert_eq!(cfg.max_track_age, 45);
        assert_eq!(cfg.confidence_threshold, 0.3);
        assert_eq!(cfg.input_size, [640, 640]);
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let err = Config::from_json(r#"{ "confidence_threshold": 1.5 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = Config::from_json(r#"{ "iou_threshold": -0.1 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_n_init_rejected() {
        let err = Config::from_json(r#"{ "n_init": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_num_classes() {
        let cfg = Config::from_json(r#"{ "num_classes": 365 }"#).unwrap();
        assert_eq!(cfg.num_classes, Some(365));
        assert_eq!(Config::default().num_classes, None);

        let err = Config::from_json(r#"{ "num_classes": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = Config::from_json("{ not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
