use anyhow::Result;
use log::debug;

use super::kalman_filter::{KalmanFilter, StateCov, StateVec};
use super::matching;
use super::{Track, Tracker, TrackerInput};
use crate::frame::Frame;
use crate::utils::{self, BoxVec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    New,
    Tracked,
    Lost,
    Removed,
}

/// Single object track.
#[derive(Debug, Clone)]
pub struct STrack {
    /// Kalman state over (cx, cy, a, h, velocities); absent until activated.
    kalman: Option<(StateVec, StateCov)>,
    /// Detection box in tlwh, used before the Kalman state exists.
    det_tlwh: BoxVec,
    pub score: f32,
    pub track_id: u64,
    pub state: TrackState,
    is_activated: bool,
    frame_id: u64,
    start_frame: u64,
    tracklet_len: u32,
    pub class_id: i32,
}

impl STrack {
    /// Wrap a detection; not a track until [`STrack::activate`].
    pub fn new(tlwh: BoxVec, score: f32, class_id: i32) -> Self {
        Self {
            kalman: None,
            det_tlwh: tlwh,
            score,
            track_id: 0,
            state: TrackState::New,
            is_activated: false,
            frame_id: 0,
            start_frame: 0,
            tracklet_len: 0,
            class_id,
        }
    }

    /// Current box in tlwh, from the Kalman state when there is one.
    pub fn tlwh(&self) -> BoxVec {
        match &self.kalman {
            Some((mean, _)) => utils::xyah_to_tlwh(&mean.fixed_rows::<4>(0).into_owned()),
            None => self.det_tlwh,
        }
    }

    pub fn tlbr(&self) -> BoxVec {
        utils::tlwh_to_tlbr(&self.tlwh())
    }

    pub fn is_activated(&self) -> bool {
        self.is_activated
    }

    /// Last frame this track was matched.
    pub fn end_frame(&self) -> u64 {
        self.frame_id
    }

    fn predict(&mut self, kf: &KalmanFilter) {
        let state = self.state;
        if let Some((mean, covariance)) = &mut self.kalman {
            // Freeze height velocity while the object is not being observed.
            if state != TrackState::Tracked {
                mean[7] = 0.0;
            }
            let (m, c) = kf.predict(mean, covariance);
            *mean = m;
            *covariance = c;
        }
    }

    fn activate(&mut self, kf: &KalmanFilter, frame_id: u64, track_id: u64) {
        self.track_id = track_id;
        self.kalman = Some(kf.initiate(&utils::tlwh_to_xyah(&self.det_tlwh)));
        self.tracklet_len = 0;
        self.state = TrackState::Tracked;
        // Only tracks born on the very first frame skip the confirmation step.
        self.is_activated = frame_id == 1;
        self.frame_id = frame_id;
        self.start_frame = frame_id;
    }

    fn correct(&mut self, kf: &KalmanFilter, det: &STrack) {
        let measurement = utils::tlwh_to_xyah(&det.tlwh());
        self.kalman = Some(match &self.kalman {
            Some((mean, covariance)) => kf.update(mean, covariance, &measurement),
            None => kf.initiate(&measurement),
        });
    }

    fn re_activate(&mut self, kf: &KalmanFilter, det: &STrack, frame_id: u64) {
        self.correct(kf, det);
        self.tracklet_len = 0;
        self.state = TrackState::Tracked;
        self.is_activated = true;
        self.frame_id = frame_id;
        self.score = det.score;
        self.class_id = det.class_id;
    }

    fn update(&mut self, kf: &KalmanFilter, det: &STrack, frame_id: u64) {
        self.frame_id = frame_id;
        self.tracklet_len += 1;
        self.correct(kf, det);
        self.state = TrackState::Tracked;
        self.is_activated = true;
        self.score = det.score;
        self.class_id = det.class_id;
    }

    fn mark_lost(&mut self) {
        self.state = TrackState::Lost;
    }

    fn mark_removed(&mut self) {
        self.state = TrackState::Removed;
    }

    fn to_track(&self) -> Track {
        Track {
            track_id: self.track_id,
            tlbr: self.tlbr(),
            confirmed: self.is_activated,
            class_id: self.class_id,
            score: self.score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ByteTrackConfig {
    /// Detections at or above this score take part in the first association.
    pub high_thresh: f32,
    /// Detections above this (and below `high_thresh`) take part in the second.
    pub low_thresh: f32,
    /// Minimum score for an unmatched detection to start a track.
    pub new_track_thresh: f32,
    /// IoU-distance gate for the first association.
    pub match_thresh: f32,
    /// Frames a lost track is kept at 30 fps.
    pub track_buffer: u32,
    pub frame_rate: f32,
}

impl Default for ByteTrackConfig {
    fn default() -> Self {
        Self {
            high_thresh: 0.25,
            low_thresh: 0.1,
            new_track_thresh: 0.25,
            match_thresh: 0.8,
            track_buffer: 30,
            frame_rate: 30.0,
        }
    }
}

/// ByteTrack: associate high-confidence detections first, then try to rescue
/// the remaining tracks with low-confidence ones.
pub struct ByteTracker {
    kalman: KalmanFilter,
    tracked_stracks: Vec<STrack>,
    lost_stracks: Vec<STrack>,
    frame_id: u64,
    track_id_count: u64,
    max_time_lost: u64,
    config: ByteTrackConfig,
}

fn boxes(tracks: &[&STrack]) -> Vec<BoxVec> {
    tracks.iter().map(|t| t.tlbr()).collect()
}

impl ByteTracker {
    pub fn new(config: ByteTrackConfig) -> Self {
        let max_time_lost = (config.frame_rate / 30.0 * config.track_buffer as f32) as u64;
        Self {
            kalman: KalmanFilter::new(),
            tracked_stracks: Vec::new(),
            lost_stracks: Vec::new(),
            frame_id: 0,
            track_id_count: 0,
            max_time_lost,
            config,
        }
    }

    /// Tracks currently in the `Tracked` state, confirmed or not.
    pub fn tracked_stracks(&self) -> &[STrack] {
        &self.tracked_stracks
    }

    pub fn lost_stracks(&self) -> &[STrack] {
        &self.lost_stracks
    }

    fn next_id(&mut self) -> u64 {
        self.track_id_count += 1;
        self.track_id_count
    }

    /// Advance one frame and return the tracks matched in it.
    pub fn step(&mut self, inputs: &[TrackerInput]) -> Vec<Track> {
        self.frame_id += 1;
        let frame_id = self.frame_id;
        let kf = self.kalman.clone();
        let cfg = self.config.clone();

        let mut high = Vec::new();
        let mut low = Vec::new();
        for input in inputs {
            let det = STrack::new(input.tlwh_f32(), input.confidence, input.class_id);
            if input.confidence >= cfg.high_thresh {
                high.push(det);
            } else if input.confidence > cfg.low_thresh {
                low.push(det);
            }
        }

        let (confirmed, mut unconfirmed): (Vec<STrack>, Vec<STrack>) =
            std::mem::take(&mut self.tracked_stracks)
                .into_iter()
                .partition(|t| t.is_activated);
        let mut pool = confirmed;
        pool.append(&mut self.lost_stracks);
        for track in &mut pool {
            track.predict(&kf);
        }

        // First association: confirmed and lost tracks against high detections.
        let mut cost = matching::iou_distance(
            &boxes(&pool.iter().collect::<Vec<_>>()),
            &boxes(&high.iter().collect::<Vec<_>>()),
        );
        matching::fuse_score(&mut cost, &high.iter().map(|d| d.score).collect::<Vec<_>>());
        let first = matching::linear_assignment(&cost, cfg.match_thresh);
        for &(ti, di) in &first.matches {
            let track = &mut pool[ti];
            if track.state == TrackState::Tracked {
                track.update(&kf, &high[di], frame_id);
            } else {
                track.re_activate(&kf, &high[di], frame_id);
            }
        }

        // Second association: still-tracked leftovers against low detections.
        let remaining: Vec<usize> = first
            .unmatched_tracks
            .iter()
            .copied()
            .filter(|&ti| pool[ti].state == TrackState::Tracked)
            .collect();
        let cost = matching::iou_distance(
            &boxes(&remaining.iter().map(|&ti| &pool[ti]).collect::<Vec<_>>()),
            &boxes(&low.iter().collect::<Vec<_>>()),
        );
        let second = matching::linear_assignment(&cost, 0.5);
        for &(ri, di) in &second.matches {
            pool[remaining[ri]].update(&kf, &low[di], frame_id);
        }
        for &ri in &second.unmatched_tracks {
            let track = &mut pool[remaining[ri]];
            if track.state != TrackState::Lost {
                track.mark_lost();
            }
        }

        // Unconfirmed tracks get one chance with the leftover high detections.
        let leftover: Vec<usize> = first.unmatched_detections;
        let mut cost = matching::iou_distance(
            &boxes(&unconfirmed.iter().collect::<Vec<_>>()),
            &boxes(&leftover.iter().map(|&di| &high[di]).collect::<Vec<_>>()),
        );
        matching::fuse_score(
            &mut cost,
            &leftover.iter().map(|&di| high[di].score).collect::<Vec<_>>(),
        );
        let third = matching::linear_assignment(&cost, 0.7);
        for &(ui, li) in &third.matches {
            unconfirmed[ui].update(&kf, &high[leftover[li]], frame_id);
        }
        for &ui in &third.unmatched_tracks {
            unconfirmed[ui].mark_removed();
        }

        let mut started = Vec::new();
        for &li in &third.unmatched_detections {
            let det = &high[leftover[li]];
            if det.score < cfg.new_track_thresh {
                continue;
            }
            let mut track = det.clone();
            let track_id = self.next_id();
            track.activate(&kf, frame_id, track_id);
            started.push(track);
        }

        for track in &mut pool {
            if track.state == TrackState::Lost && frame_id - track.end_frame() > self.max_time_lost {
                track.mark_removed();
            }
        }

        let mut tracked = Vec::new();
        let mut lost = Vec::new();
        for track in pool.into_iter().chain(unconfirmed).chain(started) {
            match track.state {
                TrackState::Tracked => tracked.push(track),
                TrackState::Lost => lost.push(track),
                TrackState::New | TrackState::Removed => {}
            }
        }
        let (tracked, lost) = remove_duplicate_stracks(tracked, lost);
        self.tracked_stracks = tracked;
        self.lost_stracks = lost;

        debug!(
            "frame {}: {} high / {} low detections, {} tracked, {} lost",
            frame_id,
            high.len(),
            low.len(),
            self.tracked_stracks.len(),
            self.lost_stracks.len()
        );

        self.tracked_stracks.iter().map(STrack::to_track).collect()
    }
}

impl Tracker for ByteTracker {
    fn update(&mut self, detections: &[TrackerInput], _frame: Option<&Frame>) -> Result<Vec<Track>> {
        Ok(self.step(detections))
    }
}

/// Drop near-identical tracked/lost pairs, keeping whichever has lived longer.
fn remove_duplicate_stracks(a: Vec<STrack>, b: Vec<STrack>) -> (Vec<STrack>, Vec<STrack>) {
    let dist = matching::iou_distance(
        &boxes(&a.iter().collect::<Vec<_>>()),
        &boxes(&b.iter().collect::<Vec<_>>()),
    );
    let mut drop_a = vec![false; a.len()];
    let mut drop_b = vec![false; b.len()];
    for (i, ta) in a.iter().enumerate() {
        for (j, tb) in b.iter().enumerate() {
            if dist[(i, j)] >= 0.15 {
                continue;
            }
            let age_a = ta.frame_id - ta.start_frame;
            let age_b = tb.frame_id - tb.start_frame;
            if age_a > age_b {
                drop_b[j] = true;
            } else {
                drop_a[i] = true;
            }
        }
    }
    let keep = |tracks: Vec<STrack>, dropped: &[bool]| -> Vec<STrack> {
        tracks
            .into_iter()
            .zip(dropped)
            .filter_map(|(t, &d)| (!d).then_some(t))
            .collect()
    };
    (keep(a, &drop_a), keep(b, &drop_b))
}
