//! Cost matrices and linear assignment shared by the bundled trackers.
use nalgebra::DMatrix;
use pathfinding::kuhn_munkres::kuhn_munkres_min;
use pathfinding::matrix::Matrix;

use crate::utils::{self, BoxVec};

/// Cost for pairs that must never be matched.
pub const INFTY_COST: f32 = 1e5;

const F32_I64_MULT: f32 = 1_000_000.0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// `1 - IoU` between every track box and every detection box (both tlbr).
pub fn iou_distance(tracks: &[BoxVec], detections: &[BoxVec]) -> DMatrix<f32> {
    DMatrix::from_fn(tracks.len(), detections.len(), |i, j| {
        1.0 - utils::iou_tlbr(&tracks[i], &detections[j])
    })
}

/// Blend detection confidence into an IoU distance matrix so that confident
/// detections are preferred.
pub fn fuse_score(cost: &mut DMatrix<f32>, detection_scores: &[f32]) {
    let (rows, cols) = cost.shape();
    for j in 0..cols {
        for i in 0..rows {
            let iou_sim = 1.0 - cost[(i, j)];
            cost[(i, j)] = 1.0 - iou_sim * detection_scores[j];
        }
    }
}

/// Minimum-cost matching, rejecting pairs whose cost exceeds `thresh`.
pub fn linear_assignment(cost: &DMatrix<f32>, thresh: f32) -> Assignment {
    let (rows, cols) = cost.shape();
    if rows == 0 || cols == 0 {
        return Assignment {
            matches: Vec::new(),
            unmatched_tracks: (0..rows).collect(),
            unmatched_detections: (0..cols).collect(),
        };
    }

    // Square, integer-weighted problem: over-threshold pairs and padding
    // share one ceiling value so they never beat a valid pair.
    let ceiling = (thresh * F32_I64_MULT) as i64 + 1;
    let n = rows.max(cols);
    let mut weights = Matrix::new(n, n, ceiling);
    for r in 0..rows {
        for c in 0..cols {
            let v = cost[(r, c)];
            if v <= thresh {
                weights[(r, c)] = ((v * F32_I64_MULT) as i64).min(ceiling - 1);
            }
        }
    }

    let (_, solution) = kuhn_munkres_min(&weights);

    let mut assignment = Assignment::default();
    let mut detection_taken = vec![false; cols];
    for (r, &c) in solution.iter().enumerate().take(rows) {
        if c < cols && cost[(r, c)] <= thresh {
            assignment.matches.push((r, c));
            detection_taken[c] = true;
        } else {
            assignment.unmatched_tracks.push(r);
        }
    }
    assignment.unmatched_detections = (0..cols).filter(|&c| !detection_taken[c]).collect();
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_empty_inputs() {
        let a = linear_assignment(&DMatrix::zeros(0, 3), 0.5);
        assert!(a.matches.is_empty());
        assert_eq!(a.unmatched_detections, vec![0, 1, 2]);

        let a = linear_assignment(&DMatrix::zeros(2, 0), 0.5);
        assert_eq!(a.unmatched_tracks, vec![0, 1]);
        assert!(a.unmatched_detections.is_empty());
    }

    #[test]
    fn test_optimal_not_greedy() {
        // Greedy on row 0 would take column 0 and force row 1 onto 0.9.
        let cost = DMatrix::from_row_slice(2, 2, &[0.1, 0.2, 0.15, 0.9]);
        let a = linear_assignment(&cost, 0.95);
        let mut matches = a.matches.clone();
        matches.sort();
        assert_eq!(matches, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn test_threshold_rejects_pairs() {
        let cost = DMatrix::from_row_slice(2, 3, &[0.1, 0.9, 0.9, 0.9, 0.9, 0.9]);
        let a = linear_assignment(&cost, 0.5);
        assert_eq!(a.matches, vec![(0, 0)]);
        assert_eq!(a.unmatched_tracks, vec![1]);
        assert_eq!(a.unmatched_detections, vec![1, 2]);
    }

    #[test]
    fn test_more_tracks_than_detections() {
        let cost = DMatrix::from_row_slice(3, 1, &[0.8, 0.1, 0.4]);
        let a = linear_assignment(&cost, 0.5);
        assert_eq!(a.matches, vec![(1, 0)]);
        assert_eq!(a.unmatched_tracks, vec![0, 2]);
        assert!(a.unmatched_detections.is_empty());
    }

    #[test]
    fn test_iou_distance_and_fuse() {
        let tracks = [BoxVec::new(0.0, 0.0, 10.0, 10.0)];
        let dets = [
            BoxVec::new(0.0, 0.0, 10.0, 10.0),
            BoxVec::new(20.0, 20.0, 30.0, 30.0),
        ];
        let mut cost = iou_distance(&tracks, &dets);
        assert_relative_eq!(cost[(0, 0)], 0.0);
        assert_relative_eq!(cost[(0, 1)], 1.0);

        fuse_score(&mut cost, &[0.9, 0.9]);
        assert_relative_eq!(cost[(0, 0)], 0.1, epsilon = 1e-6);
        assert_relative_eq!(cost[(0, 1)], 1.0);
    }
}
