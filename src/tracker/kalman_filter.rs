use nalgebra::{SMatrix, SVector};

pub type StateVec = SVector<f32, 8>;
pub type StateCov = SMatrix<f32, 8, 8>;
pub type MeasVec = SVector<f32, 4>;
pub type MeasCov = SMatrix<f32, 4, 4>;

/// Chi-square 0.95 quantile for 4 degrees of freedom, the Mahalanobis gate
/// for a full (x, y, a, h) measurement.
pub const CHI2INV95_4DOF: f32 = 9.4877;

/// Constant-velocity Kalman filter over `(cx, cy, aspect, h)` and their
/// velocities.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    motion_mat: StateCov,
    update_mat: SMatrix<f32, 4, 8>,
    std_weight_position: f32,
    std_weight_velocity: f32,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl KalmanFilter {
    pub fn new() -> Self {
        let ndim = 4;
        let dt = 1.0;
        let mut motion_mat = StateCov::identity();
        for i in 0..ndim {
            motion_mat[(i, ndim + i)] = dt;
        }
        Self {
            motion_mat,
            update_mat: SMatrix::<f32, 4, 8>::identity(),
            std_weight_position: 1.0 / 20.0,
            std_weight_velocity: 1.0 / 160.0,
        }
    }

    /// Create a track state from an unassociated xyah measurement.
    pub fn initiate(&self, measurement: &MeasVec) -> (StateVec, StateCov) {
        let mut mean = StateVec::zeros();
        mean.fixed_rows_mut::<4>(0).copy_from(measurement);

        let h = measurement[3];
        let std = StateVec::from([
            2.0 * self.std_weight_position * h,
            2.0 * self.std_weight_position * h,
            1e-2,
            2.0 * self.std_weight_position * h,
            10.0 * self.std_weight_velocity * h,
            10.0 * self.std_weight_velocity * h,
            1e-5,
            10.0 * self.std_weight_velocity * h,
        ]);
        (mean, StateCov::from_diagonal(&std.component_mul(&std)))
    }

    /// x' = F x, P' = F P F^T + Q
    pub fn predict(&self, mean: &StateVec, covariance: &StateCov) -> (StateVec, StateCov) {
        let h = mean[3];
        let std = StateVec::from([
            self.std_weight_position * h,
            self.std_weight_position * h,
            1e-2,
            self.std_weight_position * h,
            self.std_weight_velocity * h,
            self.std_weight_velocity * h,
            1e-5,
            self.std_weight_velocity * h,
        ]);
        let motion_cov = StateCov::from_diagonal(&std.component_mul(&std));

        let mean = self.motion_mat * mean;
        let covariance = self.motion_mat * covariance * self.motion_mat.transpose() + motion_cov;
        (mean, covariance)
    }

    /// z = H x, S = H P H^T + R
    pub fn project(&self, mean: &StateVec, covariance: &StateCov) -> (MeasVec, MeasCov) {
        let h = mean[3];
        let std = MeasVec::new(
            self.std_weight_position * h,
            self.std_weight_position * h,
            1e-1,
            self.std_weight_position * h,
        );
        let innovation_cov = MeasCov::from_diagonal(&std.component_mul(&std));

        let projected_mean = self.update_mat * mean;
        let projected_cov =
            self.update_mat * covariance * self.update_mat.transpose() + innovation_cov;
        (projected_mean, projected_cov)
    }

    /// Correction step.
    pub fn update(
        &self,
        mean: &StateVec,
        covariance: &StateCov,
        measurement: &MeasVec,
    ) -> (StateVec, StateCov) {
        let (projected_mean, projected_cov) = self.project(mean, covariance);

        // Solve S K^T = (P H^T)^T rather than inverting S.
        let pht = covariance * self.update_mat.transpose();
        let kalman_gain_t = match projected_cov.cholesky() {
            Some(chol) => chol.solve(&pht.transpose()),
            None => match (projected_cov + MeasCov::identity() * 1e-6)
                .lu()
                .solve(&pht.transpose())
            {
                Some(k_t) => k_t,
                None => return (*mean, *covariance),
            },
        };
        let kalman_gain = kalman_gain_t.transpose();

        let innovation = measurement - projected_mean;
        let new_mean = mean + kalman_gain * innovation;
        let new_cov = covariance - kalman_gain * projected_cov * kalman_gain.transpose();
        (new_mean, new_cov)
    }

    /// Squared Mahalanobis distance between the state distribution and each
    /// measurement. Compare against [`CHI2INV95_4DOF`].
    pub fn gating_distance(
        &self,
        mean: &StateVec,
        covariance: &StateCov,
        measurements: &[MeasVec],
    ) -> Vec<f32> {
        let (projected_mean, projected_cov) = self.project(mean, covariance);
        let chol = projected_cov.cholesky();

        measurements
            .iter()
            .map(|z| {
                let d = z - projected_mean;
                match &chol {
                    Some(chol) => d.dot(&chol.solve(&d)),
                    None => f32::INFINITY,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_initiate() {
        let kf = KalmanFilter::new();
        let (mean, covariance) = kf.initiate(&MeasVec::new(100.0, 100.0, 0.5, 50.0));

        assert_eq!(mean.fixed_rows::<4>(0), MeasVec::new(100.0, 100.0, 0.5, 50.0));
        assert_eq!(mean.fixed_rows::<4>(4), MeasVec::zeros());
        for i in 0..8 {
            for j in 0..8 {
                if i == j {
                    assert!(covariance[(i, j)] > 0.0);
                } else {
                    assert_eq!(covariance[(i, j)], 0.0);
                }
            }
        }
    }

    #[test]
    fn test_kalman_filter_predict() {
        let kf = KalmanFilter::new();
        let (mut mean, covariance) = kf.initiate(&MeasVec::new(100.0, 100.0, 1.0, 50.0));
        mean[4] = 10.0;
        mean[5] = 5.0;

        let (pred_mean, pred_cov) = kf.predict(&mean, &covariance);

        assert_relative_eq!(pred_mean[0], 110.0);
        assert_relative_eq!(pred_mean[1], 105.0);
        assert_relative_eq!(pred_mean[3], 50.0);
        assert_relative_eq!(pred_mean[4], 10.0);
        // Uncertainty grows without a measurement
        assert!(pred_cov[(0, 0)] > covariance[(0, 0)]);
    }

    #[test]
    fn test_kalman_filter_update() {
        let kf = KalmanFilter::new();
        let (mean, covariance) = kf.initiate(&MeasVec::new(100.0, 100.0, 1.0, 50.0));

        let measurement = MeasVec::new(110.0, 105.0, 1.0, 50.0);
        let (new_mean, new_cov) = kf.update(&mean, &covariance, &measurement);

        assert!(new_mean[0] > 100.0 && new_mean[0] < 110.0);
        assert!(new_mean[1] > 100.0 && new_mean[1] < 105.0);
        assert!(new_cov[(0, 0)] < covariance[(0, 0)]);
    }

    #[test]
    fn test_update_with_same_measurement_keeps_position() {
        let kf = KalmanFilter::new();
        let z = MeasVec::new(64.0, 48.0, 1.0, 32.0);
        let (mean, covariance) = kf.initiate(&z);
        let (mean, covariance) = kf.predict(&mean, &covariance);
        let (mean, _) = kf.update(&mean, &covariance, &z);

        for i in 0..4 {
            assert_relative_eq!(mean[i], z[i], epsilon = 1e-3);
        }
    }

    #[test]
    fn test_gating_distance() {
        let kf = KalmanFilter::new();
        let (mean, covariance) = kf.initiate(&MeasVec::new(100.0, 100.0, 1.0, 50.0));

        let near = MeasVec::new(101.0, 100.0, 1.0, 50.0);
        let far = MeasVec::new(400.0, 400.0, 1.0, 50.0);
        let distances = kf.gating_distance(&mean, &covariance, &[near, far]);

        assert!(distances[0] < CHI2INV95_4DOF);
        assert!(distances[1] > CHI2INV95_4DOF);
    }
}
