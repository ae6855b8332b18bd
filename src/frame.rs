//! Frames and the sources that produce them.
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use log::{debug, info};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture},
};

use crate::error::{Error, Result};

/// One decoded BGR image and its position in the stream.
#[derive(Debug)]
pub struct Frame {
    index: u64,
    image: Mat,
}

impl Frame {
    pub fn new(index: u64, image: Mat) -> Self {
        Self { index, image }
    }

    /// Zero-based position in the stream.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn image(&self) -> &Mat {
        &self.image
    }

    pub fn width(&self) -> i32 {
        self.image.cols()
    }

    pub fn height(&self) -> i32 {
        self.image.rows()
    }
}

/// A lazy, finite, non-restartable sequence of frames.
///
/// `Ok(None)` signals end-of-stream; every later call keeps returning it.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Frames decoded from a stored video file.
///
/// The decoder is released by [`VideoSource::close`] or on drop, whichever
/// comes first.
pub struct VideoSource {
    path: PathBuf,
    capture: VideoCapture,
    next_index: u64,
    exhausted: bool,
    released: bool,
}

impl VideoSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |reason: String| Error::SourceUnavailable {
            path: path.clone(),
            reason,
        };

        if !path.is_file() {
            return Err(unavailable("file not found".to_string()));
        }

        let capture = VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)
            .map_err(|e| unavailable(e.to_string()))?;
        if !capture.is_opened()? {
            return Err(unavailable("decoder could not open the file".to_string()));
        }

        let source = Self {
            path,
            capture,
            next_index: 0,
            exhausted: false,
            released: false,
        };
        info!(
            "Opened {:?}: {}x{} @ {:.2} fps, {} frames",
            source.path,
            source.capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32,
            source.capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32,
            source.fps()?,
            source
                .frame_count()?
                .map_or_else(|| "unknown".to_string(), |n| n.to_string()),
        );
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Container frame rate, or 0 when the container does not report one.
    pub fn fps(&self) -> Result<f64> {
        Ok(self.capture.get(videoio::CAP_PROP_FPS)?)
    }

    /// Frame count reported by the container, when it reports one.
    pub fn frame_count(&self) -> Result<Option<u64>> {
        let count = self.capture.get(videoio::CAP_PROP_FRAME_COUNT)?;
        Ok((count > 0.0).then_some(count as u64))
    }

    /// Release the decoder. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            self.exhausted = true;
            self.capture.release()?;
            debug!("Released decoder for {:?}", self.path);
        }
        Ok(())
    }
}

impl FrameSource for VideoSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut image = Mat::default();
        if !self.capture.read(&mut image)? || image.empty() {
            self.exhausted = true;
            return Ok(None);
        }

        let frame = Frame::new(self.next_index, image);
        self.next_index += 1;
        Ok(Some(frame))
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Failed to release decoder for {:?}: {}", self.path, e);
        }
    }
}

/// Already-decoded frames served in order.
#[derive(Debug, Default)]
pub struct FrameQueue {
    images: VecDeque<Mat>,
    next_index: u64,
}

impl FrameQueue {
    pub fn new(images: impl IntoIterator<Item = Mat>) -> Self {
        Self {
            images: images.into_iter().collect(),
            next_index: 0,
        }
    }

    /// Frames not yet handed out.
    pub fn remaining(&self) -> usize {
        self.images.len()
    }
}

impl FrameSource for FrameQueue {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.images.pop_front().map(|image| {
            let frame = Frame::new(self.next_index, image);
            self.next_index += 1;
            frame
        }))
    }
}
