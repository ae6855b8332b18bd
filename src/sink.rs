//! Where annotated frames go: a window, a video file, a JSON log.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use opencv::{
    core::Size,
    highgui,
    prelude::*,
    videoio::VideoWriter,
};
use serde::{Deserialize, Serialize};

use crate::pipeline::AnnotatedFrame;

/// Presentation sink driven by the run loop.
pub trait Presenter {
    fn show(&mut self, frame: &AnnotatedFrame) -> Result<()>;

    /// True when the user asked to stop within `timeout_ms`.
    fn poll_quit(&mut self, timeout_ms: i32) -> Result<bool>;

    /// Called once after the loop stops cleanly.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<P: Presenter + ?Sized> Presenter for Box<P> {
    fn show(&mut self, frame: &AnnotatedFrame) -> Result<()> {
        (**self).show(frame)
    }

    fn poll_quit(&mut self, timeout_ms: i32) -> Result<bool> {
        (**self).poll_quit(timeout_ms)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// An absent sink accepts everything and never asks to quit.
impl<P: Presenter> Presenter for Option<P> {
    fn show(&mut self, frame: &AnnotatedFrame) -> Result<()> {
        match self {
            Some(p) => p.show(frame),
            None => Ok(()),
        }
    }

    fn poll_quit(&mut self, timeout_ms: i32) -> Result<bool> {
        match self {
            Some(p) => p.poll_quit(timeout_ms),
            None => Ok(false),
        }
    }

    fn finish(&mut self) -> Result<()> {
        match self {
            Some(p) => p.finish(),
            None => Ok(()),
        }
    }
}

impl<A: Presenter, B: Presenter> Presenter for (A, B) {
    fn show(&mut self, frame: &AnnotatedFrame) -> Result<()> {
        self.0.show(frame)?;
        self.1.show(frame)
    }

    fn poll_quit(&mut self, timeout_ms: i32) -> Result<bool> {
        Ok(self.0.poll_quit(timeout_ms)? || self.1.poll_quit(timeout_ms)?)
    }

    fn finish(&mut self) -> Result<()> {
        self.0.finish()?;
        self.1.finish()
    }
}

/// A named HighGUI window. Destroyed on drop.
pub struct WindowSink {
    name: String,
    quit_keys: Vec<i32>,
}

impl WindowSink {
    pub fn new(name: &str, quit_keys: &[i32]) -> Result<Self> {
        highgui::named_window(name, highgui::WINDOW_AUTOSIZE)
            .with_context(|| format!("failed to create window {name:?}"))?;
        Ok(Self {
            name: name.to_string(),
            quit_keys: quit_keys.to_vec(),
        })
    }
}

impl Presenter for WindowSink {
    fn show(&mut self, frame: &AnnotatedFrame) -> Result<()> {
        highgui::imshow(&self.name, &frame.image)?;
        Ok(())
    }

    fn poll_quit(&mut self, timeout_ms: i32) -> Result<bool> {
        let key = highgui::wait_key(timeout_ms.max(1))?;
        Ok(key >= 0 && self.quit_keys.contains(&(key & 0xFF)))
    }
}

impl Drop for WindowSink {
    fn drop(&mut self) {
        if let Err(e) = highgui::destroy_window(&self.name) {
            debug!("Failed to destroy window {:?}: {}", self.name, e);
        }
    }
}

/// Writes annotated frames to a video file.
///
/// The writer opens on the first frame, sized from it. If it cannot be
/// opened the recorder logs a warning and drops every frame after that.
pub struct Recorder {
    path: PathBuf,
    fps: f64,
    writer: Option<VideoWriter>,
    failed: bool,
    frames_written: u64,
}

impl Recorder {
    pub fn new(path: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            path: path.into(),
            fps: if fps > 0.0 { fps } else { 30.0 },
            writer: None,
            failed: false,
            frames_written: 0,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn open(&self, size: Size) -> opencv::Result<Option<VideoWriter>> {
        let fourcc = fourcc_for(&self.path)?;
        let writer = VideoWriter::new(&self.path.to_string_lossy(), fourcc, self.fps, size, true)?;
        Ok(writer.is_opened()?.then_some(writer))
    }
}

/// MJPG for `.avi` containers, MPEG-4 Part 2 for everything else.
fn fourcc_for(path: &Path) -> opencv::Result<i32> {
    let is_avi = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("avi"));
    if is_avi {
        VideoWriter::fourcc('M', 'J', 'P', 'G')
    } else {
        VideoWriter::fourcc('m', 'p', '4', 'v')
    }
}

impl Presenter for Recorder {
    fn show(&mut self, frame: &AnnotatedFrame) -> Result<()> {
        if self.failed {
            return Ok(());
        }
        if self.writer.is_none() {
            let size = frame.image.size()?;
            match self.open(size) {
                Ok(Some(writer)) => {
                    info!(
                        "Recording to {:?} ({}x{} @ {:.1} fps)",
                        self.path, size.width, size.height, self.fps
                    );
                    self.writer = Some(writer);
                }
                Ok(None) => {
                    warn!("Could not open video writer for {:?}, not recording", self.path);
                    self.failed = true;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Could not open video writer for {:?}: {}", self.path, e);
                    self.failed = true;
                    return Ok(());
                }
            }
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.write(&frame.image)?;
            self.frames_written += 1;
        }
        Ok(())
    }

    fn poll_quit(&mut self, _timeout_ms: i32) -> Result<bool> {
        Ok(false)
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.release()?;
            info!("Wrote {} frames to {:?}", self.frames_written, self.path);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: u64,
    /// `[x1, y1, x2, y2]`
    pub bbox: [f32; 4],
    pub class_id: i32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame: u64,
    pub tracks: Vec<TrackRecord>,
}

/// Streams confirmed tracks per frame to a JSON array, one record per line.
///
/// The array is closed by `finish`; a run that fails part way leaves the
/// records written so far without the closing bracket.
pub struct TrackLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    frames_logged: u64,
}

impl TrackLog {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)
            .with_context(|| format!("failed to create track log {:?}", path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(b"[")?;
        Ok(Self {
            path,
            writer: Some(writer),
            frames_logged: 0,
        })
    }

    pub fn frames_logged(&self) -> u64 {
        self.frames_logged
    }
}

impl Presenter for TrackLog {
    fn show(&mut self, frame: &AnnotatedFrame) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            bail!("track log {:?} already finished", self.path);
        };
        let record = FrameRecord {
            frame: frame.index,
            tracks: frame
                .tracks
                .iter()
                .map(|t| TrackRecord {
                    id: t.track_id,
                    bbox: [t.tlbr[0], t.tlbr[1], t.tlbr[2], t.tlbr[3]],
                    class_id: t.class_id,
                    score: t.score,
                })
                .collect(),
        };
        let separator: &[u8] = if self.frames_logged == 0 { b"\n" } else { b",\n" };
        writer.write_all(separator)?;
        serde_json::to_writer(&mut *writer, &record)?;
        self.frames_logged += 1;
        Ok(())
    }

    fn poll_quit(&mut self, _timeout_ms: i32) -> Result<bool> {
        Ok(false)
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.write_all(b"\n]\n")?;
            writer
                .flush()
                .with_context(|| format!("failed to write track log {:?}", self.path))?;
            info!("Wrote track log for {} frames to {:?}", self.frames_logged, self.path);
        }
        Ok(())
    }
}
