use std::collections::VecDeque;

use anyhow::{ensure, Result};
use log::debug;
use nalgebra::DMatrix;

use super::embedding::Embedder;
use super::kalman_filter::{KalmanFilter, MeasVec, StateCov, StateVec, CHI2INV95_4DOF};
use super::matching::{self, Assignment, INFTY_COST};
use super::{Track, Tracker, TrackerInput};
use crate::frame::Frame;
use crate::utils::{self, BoxVec};

#[derive(Debug, Clone)]
pub struct DeepSortConfig {
    /// Misses after which a confirmed track is deleted.
    pub max_age: u32,
    /// Consecutive hits before a tentative track is confirmed.
    pub n_init: u32,
    pub max_iou_distance: f32,
    pub max_cosine_distance: f32,
    /// Appearance samples kept per track.
    pub nn_budget: usize,
}

impl Default for DeepSortConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            n_init: 3,
            max_iou_distance: 0.7,
            max_cosine_distance: 0.2,
            nn_budget: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DsState {
    Tentative,
    Confirmed,
    Deleted,
}

#[derive(Debug, Clone)]
struct DsTrack {
    mean: StateVec,
    covariance: StateCov,
    track_id: u64,
    hits: u32,
    time_since_update: u32,
    state: DsState,
    class_id: i32,
    score: f32,
    /// Features observed since the last gallery refresh.
    pending: Vec<Vec<f32>>,
    gallery: VecDeque<Vec<f32>>,
}

impl DsTrack {
    fn tlbr(&self) -> BoxVec {
        let xyah = self.mean.fixed_rows::<4>(0).into_owned();
        utils::tlwh_to_tlbr(&utils::xyah_to_tlwh(&xyah))
    }

    fn is_confirmed(&self) -> bool {
        self.state == DsState::Confirmed
    }

    fn predict(&mut self, kf: &KalmanFilter) {
        let (mean, covariance) = kf.predict(&self.mean, &self.covariance);
        self.mean = mean;
        self.covariance = covariance;
        self.time_since_update += 1;
    }

    fn update(&mut self, kf: &KalmanFilter, det: &Candidate, n_init: u32) {
        let (mean, covariance) = kf.update(&self.mean, &self.covariance, &det.xyah);
        self.mean = mean;
        self.covariance = covariance;
        self.hits += 1;
        self.time_since_update = 0;
        self.class_id = det.input.class_id;
        self.score = det.input.confidence;
        if let Some(feature) = &det.feature {
            self.pending.push(feature.clone());
        }
        if self.state == DsState::Tentative && self.hits >= n_init {
            self.state = DsState::Confirmed;
        }
    }

    fn mark_missed(&mut self, max_age: u32) {
        if self.state == DsState::Tentative || self.time_since_update > max_age {
            self.state = DsState::Deleted;
        }
    }

    /// Smallest cosine distance between the gallery and `feature`.
    fn appearance_distance(&self, feature: &[f32]) -> f32 {
        self.gallery
            .iter()
            .map(|g| 1.0 - g.iter().zip(feature).map(|(a, b)| a * b).sum::<f32>())
            .fold(f32::INFINITY, f32::min)
    }
}

/// A detection prepared for association.
struct Candidate {
    input: TrackerInput,
    tlbr: BoxVec,
    xyah: MeasVec,
    feature: Option<Vec<f32>>,
}

/// DeepSORT: Kalman motion gating plus appearance matching, with tentative
/// tracks promoted after `n_init` hits.
pub struct DeepSortTracker<E> {
    kalman: KalmanFilter,
    embedder: E,
    tracks: Vec<DsTrack>,
    next_id: u64,
    config: DeepSortConfig,
}

impl<E: Embedder> DeepSortTracker<E> {
    pub fn new(config: DeepSortConfig, embedder: E) -> Self {
        Self {
            kalman: KalmanFilter::new(),
            embedder,
            tracks: Vec::new(),
            next_id: 1,
            config,
        }
    }

    /// Live tracks, tentative ones included.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Advance one frame. Without a frame, association is motion/IoU only and
    /// every live track may be matched by IoU regardless of how long it was
    /// missed.
    pub fn step(&mut self, inputs: &[TrackerInput], frame: Option<&Frame>) -> Result<Vec<Track>> {
        let features = match frame {
            Some(frame) => {
                let boxes: Vec<BoxVec> = inputs.iter().map(TrackerInput::tlwh_f32).collect();
                let features = self.embedder.embed(frame, &boxes)?;
                ensure!(
                    features.len() == inputs.len(),
                    "embedder returned {} features for {} boxes",
                    features.len(),
                    inputs.len()
                );
                features.into_iter().map(Some).collect()
            }
            None => vec![None; inputs.len()],
        };
        let candidates: Vec<Candidate> = inputs
            .iter()
            .zip(features)
            .map(|(input, feature)| Candidate {
                input: *input,
                tlbr: input.tlbr_f32(),
                xyah: utils::tlwh_to_xyah(&input.tlwh_f32()),
                feature,
            })
            .collect();

        let kf = self.kalman.clone();
        for track in &mut self.tracks {
            track.predict(&kf);
        }

        let assignment = self.associate(&candidates, frame.is_some());

        for &(ti, di) in &assignment.matches {
            self.tracks[ti].update(&kf, &candidates[di], self.config.n_init);
        }
        for &ti in &assignment.unmatched_tracks {
            self.tracks[ti].mark_missed(self.config.max_age);
        }
        for &di in &assignment.unmatched_detections {
            self.initiate(&candidates[di]);
        }
        self.tracks.retain(|t| t.state != DsState::Deleted);

        let budget = self.config.nn_budget;
        for track in self.tracks.iter_mut().filter(|t| t.is_confirmed()) {
            track.gallery.extend(track.pending.drain(..));
            while track.gallery.len() > budget {
                track.gallery.pop_front();
            }
        }

        debug!(
            "{} detections, {} matched, {} live tracks",
            candidates.len(),
            assignment.matches.len(),
            self.tracks.len()
        );

        Ok(self
            .tracks
            .iter()
            .filter(|t| t.time_since_update == 0)
            .map(|t| Track {
                track_id: t.track_id,
                tlbr: t.tlbr(),
                confirmed: t.is_confirmed(),
                class_id: t.class_id,
                score: t.score,
            })
            .collect())
    }

    fn initiate(&mut self, det: &Candidate) {
        let (mean, covariance) = self.kalman.initiate(&det.xyah);
        self.tracks.push(DsTrack {
            mean,
            covariance,
            track_id: self.next_id,
            hits: 1,
            time_since_update: 0,
            state: if self.config.n_init <= 1 {
                DsState::Confirmed
            } else {
                DsState::Tentative
            },
            class_id: det.input.class_id,
            score: det.input.confidence,
            pending: det.feature.iter().cloned().collect(),
            gallery: VecDeque::new(),
        });
        self.next_id += 1;
    }

    fn associate(&self, dets: &[Candidate], use_appearance: bool) -> Assignment {
        let all_dets: Vec<usize> = (0..dets.len()).collect();

        let (mut matches, mut unmatched_tracks, unmatched_dets, iou_candidates) = if use_appearance {
            let (confirmed, unconfirmed): (Vec<usize>, Vec<usize>) =
                (0..self.tracks.len()).partition(|&i| self.tracks[i].is_confirmed());

            let cascade = self.matching_cascade(dets, &confirmed, all_dets);

            // Tracks missed for exactly one frame also get an IoU attempt.
            let (recent, stale): (Vec<usize>, Vec<usize>) = cascade
                .unmatched_tracks
                .into_iter()
                .partition(|&i| self.tracks[i].time_since_update == 1);
            let mut iou_candidates = unconfirmed;
            iou_candidates.extend(recent);
            (cascade.matches, stale, cascade.unmatched_detections, iou_candidates)
        } else {
            (Vec::new(), Vec::new(), all_dets, (0..self.tracks.len()).collect())
        };

        // With appearance, stale tracks are left to the cascade; without it,
        // IoU is the only way back for a track of any age.
        let cost = self.iou_cost(dets, &iou_candidates, &unmatched_dets, use_appearance);
        let by_iou = matching::linear_assignment(&cost, self.config.max_iou_distance);

        matches.extend(
            by_iou
                .matches
                .iter()
                .map(|&(r, c)| (iou_candidates[r], unmatched_dets[c])),
        );
        unmatched_tracks.extend(by_iou.unmatched_tracks.iter().map(|&r| iou_candidates[r]));
        Assignment {
            matches,
            unmatched_tracks,
            unmatched_detections: by_iou
                .unmatched_detections
                .iter()
                .map(|&c| unmatched_dets[c])
                .collect(),
        }
    }

    /// Match confirmed tracks by appearance, most recently seen first.
    fn matching_cascade(
        &self,
        dets: &[Candidate],
        confirmed: &[usize],
        mut unmatched_dets: Vec<usize>,
    ) -> Assignment {
        let mut matches = Vec::new();
        for level in 0..self.config.max_age {
            if unmatched_dets.is_empty() {
                break;
            }
            let level_tracks: Vec<usize> = confirmed
                .iter()
                .copied()
                .filter(|&i| self.tracks[i].time_since_update == level + 1)
                .collect();
            if level_tracks.is_empty() {
                continue;
            }

            let cost = self.gated_appearance_cost(dets, &level_tracks, &unmatched_dets);
            let level_assignment =
                matching::linear_assignment(&cost, self.config.max_cosine_distance);
            matches.extend(
                level_assignment
                    .matches
                    .iter()
                    .map(|&(r, c)| (level_tracks[r], unmatched_dets[c])),
            );
            unmatched_dets = level_assignment
                .unmatched_detections
                .iter()
                .map(|&c| unmatched_dets[c])
                .collect();
        }

        let unmatched_tracks = confirmed
            .iter()
            .copied()
            .filter(|i| !matches.iter().any(|(t, _)| t == i))
            .collect();
        Assignment {
            matches,
            unmatched_tracks,
            unmatched_detections: unmatched_dets,
        }
    }

    fn gated_appearance_cost(
        &self,
        dets: &[Candidate],
        track_ids: &[usize],
        det_ids: &[usize],
    ) -> DMatrix<f32> {
        let measurements: Vec<MeasVec> = det_ids.iter().map(|&d| dets[d].xyah).collect();
        let mut cost = DMatrix::from_element(track_ids.len(), det_ids.len(), INFTY_COST);
        for (r, &ti) in track_ids.iter().enumerate() {
            let track = &self.tracks[ti];
            let gating = self
                .kalman
                .gating_distance(&track.mean, &track.covariance, &measurements);
            for (c, &di) in det_ids.iter().enumerate() {
                if gating[c] > CHI2INV95_4DOF {
                    continue;
                }
                if let Some(feature) = &dets[di].feature {
                    cost[(r, c)] = track.appearance_distance(feature);
                }
            }
        }
        cost
    }

    fn iou_cost(
        &self,
        dets: &[Candidate],
        track_ids: &[usize],
        det_ids: &[usize],
        recent_only: bool,
    ) -> DMatrix<f32> {
        let track_boxes: Vec<BoxVec> = track_ids.iter().map(|&t| self.tracks[t].tlbr()).collect();
        let det_boxes: Vec<BoxVec> = det_ids.iter().map(|&d| dets[d].tlbr).collect();
        let mut cost = matching::iou_distance(&track_boxes, &det_boxes);
        if recent_only {
            for (r, &ti) in track_ids.iter().enumerate() {
                if self.tracks[ti].time_since_update > 1 {
                    cost.row_mut(r).fill(INFTY_COST);
                }
            }
        }
        cost
    }
}

impl<E: Embedder> Tracker for DeepSortTracker<E> {
    fn needs_frame(&self) -> bool {
        true
    }

    fn update(&mut self, detections: &[TrackerInput], frame: Option<&Frame>) -> Result<Vec<Track>> {
        self.step(detections, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::embedding::l2_normalize;

    /// Embeds every box as the same fixed descriptor.
    struct ConstantEmbedder(Vec<f32>);

    impl Embedder for ConstantEmbedder {
        fn embed(&mut self, _frame: &Frame, boxes: &[BoxVec]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![self.0.clone(); boxes.len()])
        }
    }

    fn input(x: i32, y: i32, w: i32, h: i32) -> TrackerInput {
        TrackerInput {
            tlwh: [x, y, w, h],
            confidence: 0.9,
            class_id: 0,
        }
    }

    fn frame() -> Frame {
        use opencv::core::{Mat, Scalar, CV_8UC3};
        Frame::new(
            0,
            Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(0.0)).unwrap(),
        )
    }

    fn tracker(n_init: u32, max_age: u32) -> DeepSortTracker<ConstantEmbedder> {
        let mut feature = vec![1.0, 2.0, 3.0];
        l2_normalize(&mut feature);
        DeepSortTracker::new(
            DeepSortConfig {
                n_init,
                max_age,
                ..DeepSortConfig::default()
            },
            ConstantEmbedder(feature),
        )
    }

    #[test]
    fn test_confirmation_after_n_init_hits() {
        let mut tracker = tracker(3, 30);
        let frame = frame();

        let confirmed: Vec<bool> = (0..4)
            .map(|i| {
                let tracks = tracker.step(&[input(100 + i, 100, 40, 40)], Some(&frame)).unwrap();
                assert_eq!(tracks.len(), 1);
                assert_eq!(tracks[0].track_id, 1);
                tracks[0].confirmed
            })
            .collect();
        assert_eq!(confirmed, vec![false, false, true, true]);
    }

    #[test]
    fn test_tentative_track_deleted_on_miss() {
        let mut tracker = tracker(3, 30);
        tracker.step(&[input(10, 10, 20, 20)], None).unwrap();
        assert_eq!(tracker.track_count(), 1);

        let tracks = tracker.step(&[], None).unwrap();
        assert!(tracks.is_empty());
        assert_eq!(tracker.track_count(), 0);
    }

    #[test]
    fn test_confirmed_track_survives_gap_then_recovers_by_appearance() {
        let mut tracker = tracker(1, 5);
        let frame = frame();
        let id = tracker.step(&[input(100, 100, 40, 40)], Some(&frame)).unwrap()[0].track_id;

        for _ in 0..3 {
            let tracks = tracker.step(&[], Some(&frame)).unwrap();
            assert!(tracks.is_empty());
        }
        assert_eq!(tracker.track_count(), 1);

        let tracks = tracker.step(&[input(102, 101, 40, 40)], Some(&frame)).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track_id, id);
        assert!(tracks[0].confirmed);
    }

    #[test]
    fn test_confirmed_track_deleted_after_max_age() {
        let mut tracker = tracker(1, 2);
        tracker.step(&[input(100, 100, 40, 40)], None).unwrap();
        for _ in 0..3 {
            tracker.step(&[], None).unwrap();
        }
        assert_eq!(tracker.track_count(), 0);
    }

    #[test]
    fn test_iou_only_recovers_track_after_gap() {
        let mut tracker = tracker(1, 30);
        let id = tracker.step(&[input(100, 100, 40, 40)], None).unwrap()[0].track_id;
        for _ in 0..2 {
            assert!(tracker.step(&[], None).unwrap().is_empty());
        }

        let tracks = tracker.step(&[input(100, 100, 40, 40)], None).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track_id, id);
        assert_eq!(tracker.track_count(), 1);
    }

    #[test]
    fn test_two_objects_keep_ids() {
        let mut tracker = tracker(1, 30);
        let frame = frame();
        let first = tracker
            .step(&[input(10, 10, 30, 30), input(200, 150, 30, 30)], Some(&frame))
            .unwrap();
        let second = tracker
            .step(&[input(203, 151, 30, 30), input(12, 11, 30, 30)], Some(&frame))
            .unwrap();

        let id_near = |tracks: &[Track], x: f32| {
            tracks
                .iter()
                .find(|t| (t.tlbr[0] - x).abs() < 10.0)
                .map(|t| t.track_id)
        };
        assert_eq!(id_near(&first, 10.0), id_near(&second, 12.0));
        assert_eq!(id_near(&first, 200.0), id_near(&second, 203.0));
        assert_ne!(id_near(&second, 12.0), id_near(&second, 203.0));
    }
}
