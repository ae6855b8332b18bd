use anyhow::anyhow;
use opencv::{
    core::{Mat, Rect, Scalar, CV_8UC3},
    imgproc,
    prelude::*,
};
use yolotrack::tracker::{ByteTrackConfig, ByteTracker, DeepSortConfig, DeepSortTracker, HistogramEmbedder};
use yolotrack::{
    run, AnnotatedFrame, Collaborator, Detection, Detector, Error, Frame, FrameQueue, Pipeline,
    Presenter, StopReason, Track, Tracker, TrackerInput,
};

const SQUARE: [f32; 4] = [100.0, 80.0, 160.0, 140.0];

/// Grey frame with a white square at `SQUARE`.
fn square_frame() -> Mat {
    let mut image =
        Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(64.0)).unwrap();
    imgproc::rectangle(
        &mut image,
        Rect::new(100, 80, 60, 60),
        Scalar::all(255.0),
        -1,
        imgproc::LINE_8,
        0,
    )
    .unwrap();
    image
}

fn clip(len: usize) -> FrameQueue {
    FrameQueue::new((0..len).map(|_| square_frame()))
}

/// Reports the square on every frame, optionally shifted per frame.
#[derive(Default)]
struct SquareDetector {
    calls: usize,
    shift_per_frame: f32,
    fail_on: Option<u64>,
}

impl Detector for SquareDetector {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        self.calls += 1;
        if self.fail_on == Some(frame.index()) {
            return Err(anyhow!("model crashed on frame {}", frame.index()));
        }
        let d = self.shift_per_frame * frame.index() as f32;
        let [x1, y1, x2, y2] = SQUARE;
        Ok(vec![Detection::from_tlbr(x1 + d, y1 + d, x2 + d, y2 + d, 0.9, 0)])
    }
}

struct NoDetections;

impl Detector for NoDetections {
    fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

/// Counts calls around another tracker.
struct Counting<T> {
    inner: T,
    calls: usize,
}

impl<T: Tracker> Tracker for Counting<T> {
    fn needs_frame(&self) -> bool {
        self.inner.needs_frame()
    }

    fn update(
        &mut self,
        detections: &[TrackerInput],
        frame: Option<&Frame>,
    ) -> anyhow::Result<Vec<Track>> {
        self.calls += 1;
        self.inner.update(detections, frame)
    }
}

fn byte_tracker() -> Counting<ByteTracker> {
    Counting {
        inner: ByteTracker::new(ByteTrackConfig::default()),
        calls: 0,
    }
}

/// Keeps every annotated frame; optionally quits after `quit_after` frames.
#[derive(Default)]
struct Collect {
    frames: Vec<AnnotatedFrame>,
    quit_after: Option<usize>,
}

impl Presenter for Collect {
    fn show(&mut self, frame: &AnnotatedFrame) -> anyhow::Result<()> {
        self.frames.push(AnnotatedFrame {
            index: frame.index,
            image: frame.image.try_clone()?,
            tracks: frame.tracks.clone(),
        });
        Ok(())
    }

    fn poll_quit(&mut self, _timeout_ms: i32) -> anyhow::Result<bool> {
        Ok(self.quit_after == Some(self.frames.len()))
    }
}

#[test]
fn static_square_keeps_one_confirmed_track() {
    let mut source = clip(10);
    let mut pipeline = Pipeline::new(SquareDetector::default(), byte_tracker());
    let mut sink = Collect::default();

    let summary = run(&mut source, &mut pipeline, &mut sink, 1).unwrap();
    assert_eq!(summary.frames_processed, 10);
    assert_eq!(summary.stop_reason, StopReason::EndOfStream);

    let first_id = sink.frames[0].tracks[0].track_id;
    for frame in &sink.frames {
        assert_eq!(frame.tracks.len(), 1, "frame {}", frame.index);
        let track = &frame.tracks[0];
        assert!(track.confirmed);
        assert_eq!(track.track_id, first_id);
        let corners = track.pixel_corners();
        for (got, want) in corners.iter().zip(SQUARE) {
            assert!((*got - want as i32).abs() <= 1, "frame {}: {corners:?}", frame.index);
        }
    }
}

#[test]
fn small_shift_keeps_track_id() {
    let mut source = clip(2);
    let detector = SquareDetector {
        shift_per_frame: 3.0,
        ..SquareDetector::default()
    };
    let mut pipeline = Pipeline::new(detector, byte_tracker());
    let mut sink = Collect::default();

    run(&mut source, &mut pipeline, &mut sink, 1).unwrap();
    assert_eq!(sink.frames.len(), 2);
    assert_eq!(
        sink.frames[0].tracks[0].track_id,
        sink.frames[1].tracks[0].track_id
    );
}

#[test]
fn deep_sort_confirms_after_n_init_frames() {
    let mut source = clip(6);
    let tracker = DeepSortTracker::new(
        DeepSortConfig {
            n_init: 3,
            ..DeepSortConfig::default()
        },
        HistogramEmbedder::default(),
    );
    let mut pipeline = Pipeline::new(SquareDetector::default(), tracker);
    let mut sink = Collect::default();

    run(&mut source, &mut pipeline, &mut sink, 1).unwrap();

    let counts: Vec<usize> = sink.frames.iter().map(|f| f.tracks.len()).collect();
    assert_eq!(counts, vec![0, 0, 1, 1, 1, 1]);
    let ids: Vec<u64> = sink.frames[2..].iter().map(|f| f.tracks[0].track_id).collect();
    assert!(ids.iter().all(|&id| id == ids[0]));
}

#[test]
fn empty_clip_never_calls_collaborators() {
    let mut source = clip(0);
    let mut pipeline = Pipeline::new(SquareDetector::default(), byte_tracker());
    let mut sink = Collect::default();

    let summary = run(&mut source, &mut pipeline, &mut sink, 1).unwrap();
    assert_eq!(summary.frames_processed, 0);
    assert_eq!(summary.stop_reason, StopReason::EndOfStream);
    assert_eq!(pipeline.detector().calls, 0);
    assert_eq!(pipeline.tracker().calls, 0);
    assert!(sink.frames.is_empty());
}

#[test]
fn quit_on_third_frame_leaves_rest_unread() {
    let mut source = clip(10);
    let mut pipeline = Pipeline::new(SquareDetector::default(), byte_tracker());
    let mut sink = Collect {
        quit_after: Some(3),
        ..Collect::default()
    };

    let summary = run(&mut source, &mut pipeline, &mut sink, 1).unwrap();
    assert_eq!(summary.frames_processed, 3);
    assert_eq!(summary.stop_reason, StopReason::QuitRequested);
    assert_eq!(source.remaining(), 7);
}

#[test]
fn zero_detections_leave_frames_untouched() {
    let mut source = clip(3);
    let mut pipeline = Pipeline::new(NoDetections, byte_tracker());
    let mut sink = Collect::default();

    run(&mut source, &mut pipeline, &mut sink, 1).unwrap();
    assert_eq!(pipeline.tracker().calls, 3);

    let original = square_frame();
    for frame in &sink.frames {
        assert!(frame.tracks.is_empty());
        assert_eq!(
            frame.image.data_bytes().unwrap(),
            original.data_bytes().unwrap()
        );
    }
}

#[test]
fn detector_failure_stops_the_run() {
    let mut source = clip(10);
    let detector = SquareDetector {
        fail_on: Some(1),
        ..SquareDetector::default()
    };
    let mut pipeline = Pipeline::new(detector, byte_tracker());
    let mut sink = Collect::default();

    let err = run(&mut source, &mut pipeline, &mut sink, 1).unwrap_err();
    assert!(matches!(
        err,
        Error::CollaboratorFailure {
            collaborator: Collaborator::Detector,
            ..
        }
    ));
    assert!(err.to_string().contains("model crashed on frame 1"));
    assert_eq!(sink.frames.len(), 1);
    assert_eq!(source.remaining(), 8);
}
