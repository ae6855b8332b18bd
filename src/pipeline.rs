//! Detect, track, annotate: one frame at a time.
use log::{debug, info};
use opencv::core::Mat;

use crate::detection::Detector;
use crate::error::{Collaborator, Error, Result};
use crate::frame::{Frame, FrameSource};
use crate::sink::Presenter;
use crate::tracker::{Track, Tracker, TrackerInput};
use crate::visualization;

/// A frame with the confirmed tracks composited on top.
#[derive(Debug)]
pub struct AnnotatedFrame {
    pub index: u64,
    pub image: Mat,
    /// Confirmed tracks, in the order the tracker reported them.
    pub tracks: Vec<Track>,
}

pub struct Pipeline<D, T> {
    detector: D,
    tracker: T,
}

impl<D: Detector, T: Tracker> Pipeline<D, T> {
    pub fn new(detector: D, tracker: T) -> Self {
        Self { detector, tracker }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn process(&mut self, frame: &Frame) -> Result<AnnotatedFrame> {
        let detections = self
            .detector
            .detect(frame)
            .map_err(|e| Error::collaborator(Collaborator::Detector, e))?;

        let inputs: Vec<TrackerInput> = detections.iter().map(TrackerInput::from).collect();
        let pixels = self.tracker.needs_frame().then_some(frame);
        let tracks: Vec<Track> = self
            .tracker
            .update(&inputs, pixels)
            .map_err(|e| Error::collaborator(Collaborator::Tracker, e))?
            .into_iter()
            .filter(|t| t.confirmed)
            .collect();

        debug!(
            "Frame {}: {} detections, {} confirmed tracks",
            frame.index(),
            detections.len(),
            tracks.len()
        );

        let instructions = visualization::draw_instructions(&tracks);
        let image = visualization::render(frame.image(), &instructions)?;
        Ok(AnnotatedFrame {
            index: frame.index(),
            image,
            tracks,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    QuitRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_processed: u64,
    pub stop_reason: StopReason,
}

enum LoopState {
    Running,
    Done(StopReason),
}

/// Drive `pipeline` over `source` until end-of-stream or a quit request.
///
/// Any failure stops the loop and is returned as is; the sink's `finish`
/// hook only runs after a clean stop.
pub fn run<S, D, T, P>(
    source: &mut S,
    pipeline: &mut Pipeline<D, T>,
    sink: &mut P,
    poll_timeout_ms: i32,
) -> Result<RunSummary>
where
    S: FrameSource + ?Sized,
    D: Detector,
    T: Tracker,
    P: Presenter + ?Sized,
{
    let mut frames_processed = 0u64;
    let mut state = LoopState::Running;

    let stop_reason = loop {
        state = match state {
            LoopState::Done(reason) => break reason,
            LoopState::Running => match source.next_frame()? {
                None => LoopState::Done(StopReason::EndOfStream),
                Some(frame) => {
                    let annotated = pipeline.process(&frame)?;
                    frames_processed += 1;
                    sink.show(&annotated)
                        .map_err(|e| Error::collaborator(Collaborator::Sink, e))?;
                    let quit = sink
                        .poll_quit(poll_timeout_ms)
                        .map_err(|e| Error::collaborator(Collaborator::Sink, e))?;
                    if quit {
                        LoopState::Done(StopReason::QuitRequested)
                    } else {
                        LoopState::Running
                    }
                }
            },
        };
    };

    sink.finish()
        .map_err(|e| Error::collaborator(Collaborator::Sink, e))?;

    let summary = RunSummary {
        frames_processed,
        stop_reason,
    };
    info!(
        "Processed {} frames, stopped: {:?}",
        summary.frames_processed, summary.stop_reason
    );
    Ok(summary)
}
