//! The loosely-coupled INS/GPS filter and its variants
//!
//! [`InsGps`] owns the strapdown state and an error-covariance engine
//! (standard or UD-factorized, chosen at construction) and exposes the two
//! primitives the scheduler drives: `update` (mechanization plus covariance
//! time update) and `correct` (GPS measurement update, with optional
//! lever-arm compensation and a scalar yaw correction for the magnetic
//! heading). Bias augmentation is a construction-time switch, not a
//! separate type: with `est_bias` the error state grows to fifteen and the
//! accelerometer/gyro bias estimates are subtracted from the raw IMU data
//! before mechanization and driven as first-order Gauss-Markov states.
//!
//! Two wrappers change the correction timing without touching the core:
//!
//! - [`BackPropagateFilter`] keeps a bounded ring of post-time-update
//!   snapshots and, on each measurement update, re-plays the correction
//!   backwards through the stored transition chain, yielding
//!   fixed-interval-smoothed estimates for the recent window.
//! - [`RealTimeFilter`] accepts GPS fixes that arrive late (time of week
//!   behind the newest inertial packet) by deferring the correction to the
//!   next time update large enough to absorb the delay, splitting that
//!   update around the fix.

use std::collections::VecDeque;

use nalgebra::Vector3;
use thiserror::Error;

use crate::ins::{self, GravityModel, InsState};
use crate::kalman::{ErrorCovariance, KalmanFilter, UdKalmanFilter};
use crate::linearize;
use crate::matrix::{Matrix, MatrixError};
use crate::messages::GpsSolution;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error("non-finite covariance diagonal at state index {0}")]
    NonFinite(usize),
    #[error(
        "latitude {0:.4} rad is outside the north-aligned frame's operating range (|lat| < {max:.4} rad)",
        max = ins::MAX_OPERATING_LATITUDE
    )]
    PolarRegion(f64),
}

/// Construction-time filter configuration.
#[derive(Clone, Debug)]
pub struct FilterSetup {
    /// Augment the error state with accelerometer and gyro biases.
    pub est_bias: bool,
    /// Use the UD-factorized covariance engine instead of the standard one.
    pub use_udkf: bool,
    /// Gravity model for the mechanization.
    pub gravity: GravityModel,
    /// Accelerometer output noise (1 sigma per axis), from calibration.
    pub sigma_accel: Vector3<f64>,
    /// Gyro output noise (1 sigma per axis), from calibration.
    pub sigma_gyro: Vector3<f64>,
    /// Gauss-Markov rate of the accelerometer bias states, 1/s.
    pub beta_accel: f64,
    /// Gauss-Markov rate of the gyro bias states, 1/s.
    pub beta_gyro: f64,
}

/// Intrinsic sensor correlation rate; the estimated bias states are driven
/// ten times slower.
const BETA_SENSOR: f64 = 1.0;

impl Default for FilterSetup {
    fn default() -> Self {
        FilterSetup {
            est_bias: true,
            use_udkf: false,
            gravity: GravityModel::default(),
            sigma_accel: Vector3::repeat(0.05),
            sigma_gyro: Vector3::repeat(5e-3),
            beta_accel: 0.1 * BETA_SENSOR,
            beta_gyro: 0.1 * BETA_SENSOR,
        }
    }
}

impl FilterSetup {
    /// Initial covariance diagonal: position (rad^2, rad^2, m^2), velocity,
    /// attitude (roll/pitch tighter than yaw), then the bias drifts.
    fn p_diagonal(&self) -> Vec<f64> {
        let mut diag = vec![1e-8, 1e-8, 1e2, 1e1, 1e1, 1e1, 1e-4, 1e-4, 5e-3];
        if self.est_bias {
            diag.extend_from_slice(&[1e-4, 1e-4, 1e-4]);
            diag.extend_from_slice(&[1e-7, 1e-7, 1e-7]);
        }
        diag
    }

    /// Input-noise diagonal: sensor noise from calibration, the gravity
    /// model noise, then the bias drift noise.
    fn q_diagonal(&self) -> Vec<f64> {
        let mut diag = vec![
            self.sigma_accel[0].powi(2),
            self.sigma_accel[1].powi(2),
            self.sigma_accel[2].powi(2),
            self.sigma_gyro[0].powi(2),
            self.sigma_gyro[1].powi(2),
            self.sigma_gyro[2].powi(2),
            1e-6,
        ];
        if self.est_bias {
            diag.extend_from_slice(&[1e-6, 1e-6, 1e-6]);
            diag.extend_from_slice(&[1e-8, 1e-8, 1e-8]);
        }
        diag
    }
}

/// One-sigma standard deviations pulled from the covariance diagonal.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardDeviations {
    pub latitude_rad: f64,
    pub longitude_rad: f64,
    pub height_m: f64,
    pub v_north_ms: f64,
    pub v_east_ms: f64,
    pub v_down_ms: f64,
    pub roll_rad: f64,
    pub pitch_rad: f64,
    pub heading_rad: f64,
    pub bias_accel: Option<Vector3<f64>>,
    pub bias_gyro: Option<Vector3<f64>>,
}

/// The loosely-coupled INS/GPS extended Kalman filter.
pub struct InsGps {
    pub ins: InsState,
    cov: Box<dyn ErrorCovariance>,
    q: Matrix<f64>,
    est_bias: bool,
    gravity: GravityModel,
    bias_accel: Vector3<f64>,
    bias_gyro: Vector3<f64>,
    beta_accel: f64,
    beta_gyro: f64,
}

impl Clone for InsGps {
    fn clone(&self) -> Self {
        InsGps {
            ins: self.ins,
            cov: self.cov.boxed_clone(),
            q: self.q.copy(),
            est_bias: self.est_bias,
            gravity: self.gravity,
            bias_accel: self.bias_accel,
            bias_gyro: self.bias_gyro,
            beta_accel: self.beta_accel,
            beta_gyro: self.beta_gyro,
        }
    }
}

impl InsGps {
    pub fn new(setup: &FilterSetup) -> Self {
        let p_diag = setup.p_diagonal();
        let cov: Box<dyn ErrorCovariance> = if setup.use_udkf {
            Box::new(UdKalmanFilter::new(&p_diag))
        } else {
            Box::new(KalmanFilter::new(&p_diag))
        };
        let q_diag = setup.q_diagonal();
        let q = Matrix::new(q_diag.len(), q_diag.len());
        for (i, value) in q_diag.iter().enumerate() {
            q.set(i, i, *value);
        }
        InsGps {
            ins: InsState::default(),
            cov,
            q,
            est_bias: setup.est_bias,
            gravity: setup.gravity,
            bias_accel: Vector3::zeros(),
            bias_gyro: Vector3::zeros(),
            beta_accel: setup.beta_accel,
            beta_gyro: setup.beta_gyro,
        }
    }

    pub fn state_dim(&self) -> usize {
        self.cov.dimension()
    }

    pub fn est_bias(&self) -> bool {
        self.est_bias
    }

    pub fn bias_accel(&self) -> Vector3<f64> {
        self.bias_accel
    }

    pub fn bias_gyro(&self) -> Vector3<f64> {
        self.bias_gyro
    }

    pub fn covariance(&self) -> Matrix<f64> {
        self.cov.covariance()
    }

    pub fn set_covariance(&mut self, p: &Matrix<f64>) -> Result<(), FilterError> {
        self.cov.set_covariance(p)?;
        Ok(())
    }

    /// Refuse to continue from a state the mechanization cannot represent:
    /// a latitude past the polar operating limit, or a covariance diagonal
    /// that has gone non-finite.
    fn verify_state(&self) -> Result<(), FilterError> {
        if self.ins.latitude.abs() >= ins::MAX_OPERATING_LATITUDE {
            return Err(FilterError::PolarRegion(self.ins.latitude));
        }
        let p = self.cov.covariance();
        for i in 0..p.rows() {
            if !p.get(i, i).is_finite() {
                return Err(FilterError::NonFinite(i));
            }
        }
        Ok(())
    }

    /// Time update: mechanize with the bias-corrected IMU sample and
    /// propagate the covariance. Returns the transition matrix used, which
    /// the smoother stores.
    pub fn update(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        dt: f64,
    ) -> Result<Matrix<f64>, FilterError> {
        self.verify_state()?;
        let accel = accel - self.bias_accel;
        let gyro = gyro - self.bias_gyro;
        let phi = linearize::state_transition(
            &self.ins,
            &accel,
            dt,
            self.est_bias,
            self.beta_accel,
            self.beta_gyro,
        );
        let gamma = linearize::input_noise_mapping(&self.ins, dt, self.est_bias);
        ins::forward(&mut self.ins, &accel, &gyro, dt, self.gravity);
        self.cov.time_update(&phi, &gamma, &self.q)?;
        self.verify_state()?;
        Ok(phi)
    }

    /// GPS measurement update. Returns the applied state correction.
    pub fn correct(&mut self, solution: &GpsSolution) -> Result<Matrix<f64>, FilterError> {
        let (h, r, innovation) =
            linearize::gps_observation(&self.ins, solution, self.state_dim());
        let correction = self.cov.measurement_update(&h, &r, &innovation)?;
        self.apply_correction(&correction);
        self.verify_state()?;
        Ok(correction)
    }

    /// GPS measurement update with the antenna lever arm removed: the
    /// measured position is pulled back by `C_b^n l` and the velocity by
    /// `C_b^n (omega x l)`, with `omega` the mean body rate around the fix.
    pub fn correct_with_lever_arm(
        &mut self,
        solution: &GpsSolution,
        lever_arm: &Vector3<f64>,
        omega_mean: &Vector3<f64>,
    ) -> Result<Matrix<f64>, FilterError> {
        let c_bn = self.ins.attitude_matrix();
        let offset_ned = c_bn * lever_arm;
        let velocity_offset = c_bn * omega_mean.cross(lever_arm);
        let (r_n, r_e, _) = crate::earth::principal_radii(self.ins.latitude, self.ins.altitude);
        let cos_lat = self.ins.latitude.cos();
        let mut corrected = *solution;
        corrected.latitude -= offset_ned[0] / (r_n + self.ins.altitude);
        corrected.longitude -= offset_ned[1] / ((r_e + self.ins.altitude) * cos_lat);
        corrected.height += offset_ned[2]; // NED down offset lowers the antenna
        corrected.v_north -= velocity_offset[0];
        corrected.v_east -= velocity_offset[1];
        corrected.v_down -= velocity_offset[2];
        self.correct(&corrected)
    }

    /// Scalar yaw correction from the magnetic heading comparison.
    pub fn correct_yaw(
        &mut self,
        delta_yaw: f64,
        sigma_rad: f64,
    ) -> Result<Matrix<f64>, FilterError> {
        let (h, r) = linearize::yaw_observation(self.state_dim(), sigma_rad);
        let innovation = Matrix::new(1, 1);
        innovation.set(0, 0, delta_yaw);
        let correction = self.cov.measurement_update(&h, &r, &innovation)?;
        self.apply_correction(&correction);
        self.verify_state()?;
        Ok(correction)
    }

    /// Fold an error-state correction into the full state. The attitude
    /// part rotates the body frame about the NED axes by the small-angle
    /// vector.
    pub fn apply_correction(&mut self, dx: &Matrix<f64>) {
        self.ins.latitude += dx.get(0, 0);
        self.ins.longitude = crate::wrap_to_pi(self.ins.longitude + dx.get(1, 0));
        self.ins.altitude += dx.get(2, 0);
        self.ins.velocity_north += dx.get(3, 0);
        self.ins.velocity_east += dx.get(4, 0);
        self.ins.velocity_down += dx.get(5, 0);
        let psi = Vector3::new(dx.get(6, 0), dx.get(7, 0), dx.get(8, 0));
        self.ins.attitude =
            nalgebra::UnitQuaternion::from_scaled_axis(psi) * self.ins.attitude;
        if self.est_bias {
            self.bias_accel += Vector3::new(dx.get(9, 0), dx.get(10, 0), dx.get(11, 0));
            self.bias_gyro += Vector3::new(dx.get(12, 0), dx.get(13, 0), dx.get(14, 0));
        }
    }

    /// One-sigma standard deviations from the covariance diagonal. The
    /// nav-frame attitude errors map onto roll/pitch/heading for small
    /// tilts.
    pub fn sigma(&self) -> StandardDeviations {
        let p = self.cov.covariance();
        let sd = |i: usize| p.get(i, i).max(0.0).sqrt();
        StandardDeviations {
            latitude_rad: sd(0),
            longitude_rad: sd(1),
            height_m: sd(2),
            v_north_ms: sd(3),
            v_east_ms: sd(4),
            v_down_ms: sd(5),
            roll_rad: sd(6),
            pitch_rad: sd(7),
            heading_rad: sd(8),
            bias_accel: self
                .est_bias
                .then(|| Vector3::new(sd(9), sd(10), sd(11))),
            bias_gyro: self
                .est_bias
                .then(|| Vector3::new(sd(12), sd(13), sd(14))),
        }
    }
}

/// A post-time-update snapshot kept by the smoother: the full filter state
/// plus the transition that produced it and its age relative to the newest
/// entry.
pub struct Snapshot {
    pub nav: InsGps,
    /// Transition from the previous snapshot to this one.
    phi: Matrix<f64>,
    /// Seconds behind the newest snapshot; 0 for the ring head.
    pub age: f64,
    /// Whether this snapshot has absorbed a measurement correction.
    pub corrected: bool,
}

/// Fixed-interval smoother over a bounded snapshot ring.
pub struct BackPropagateFilter {
    pub inner: InsGps,
    depth: f64,
    snapshots: VecDeque<Snapshot>,
}

impl BackPropagateFilter {
    pub fn new(inner: InsGps, depth: f64) -> Self {
        BackPropagateFilter {
            inner,
            depth,
            snapshots: VecDeque::new(),
        }
    }

    pub fn snapshots(&self) -> &VecDeque<Snapshot> {
        &self.snapshots
    }

    /// Time update: advance the filter, age the ring, push the new state at
    /// the head, and drop entries beyond the smoothing depth.
    pub fn update(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        dt: f64,
    ) -> Result<(), FilterError> {
        let phi = self.inner.update(accel, gyro, dt)?;
        for snapshot in self.snapshots.iter_mut() {
            snapshot.age += dt;
        }
        self.snapshots.push_front(Snapshot {
            nav: self.inner.clone(),
            phi,
            age: 0.0,
            corrected: false,
        });
        while matches!(self.snapshots.back(), Some(s) if s.age > self.depth) {
            self.snapshots.pop_back();
        }
        Ok(())
    }

    /// Measurement update plus the backward pass: the correction is applied
    /// to the current state, then re-propagated through the stored
    /// transition chain with the one-step smoother gain
    /// `A_k = P_k Phi^T (P_{k+1}^-)^{-1}`, refreshing every snapshot in the
    /// window.
    pub fn correct(
        &mut self,
        solution: &GpsSolution,
        lever: Option<(&Vector3<f64>, &Vector3<f64>)>,
    ) -> Result<(), FilterError> {
        let p_prior = self.inner.covariance();
        let correction = match lever {
            Some((arm, omega)) => self.inner.correct_with_lever_arm(solution, arm, omega)?,
            None => self.inner.correct(solution)?,
        };
        let p_post = self.inner.covariance();

        // Head snapshot becomes the corrected state.
        if let Some(head) = self.snapshots.front_mut() {
            head.nav = self.inner.clone();
            head.corrected = true;
        } else {
            return Ok(());
        }

        // Walk backwards: next_* describe snapshot k+1 before and after its
        // own smoothing.
        let mut next_phi = self.snapshots.front().map(|s| s.phi.copy()).unwrap();
        let mut next_p_old = p_prior;
        let mut next_p_delta = &p_post - &next_p_old;
        let mut next_dx = correction;

        for snapshot in self.snapshots.iter_mut().skip(1) {
            let p_k = snapshot.nav.covariance();
            let gain = &(&p_k * &next_phi.transpose()) * &next_p_old.inverse()?;
            let dx = &gain * &next_dx;
            let p_delta = &(&gain * &next_p_delta) * &gain.transpose();
            let p_new = &p_k + &p_delta;

            snapshot.nav.apply_correction(&dx);
            snapshot.nav.set_covariance(&symmetrized(&p_new))?;

            next_phi = snapshot.phi.copy();
            next_p_old = p_k;
            next_p_delta = p_delta;
            next_dx = dx;
        }
        Ok(())
    }
}

/// Average a nearly-symmetric product back onto the symmetric cone before
/// refactorization.
fn symmetrized(p: &Matrix<f64>) -> Matrix<f64> {
    let result = p.copy();
    for i in 0..result.rows() {
        for j in (i + 1)..result.cols() {
            let mean = 0.5 * (result.get(i, j) + result.get(j, i));
            result.set(i, j, mean);
            result.set(j, i, mean);
        }
    }
    result
}

/// A GPS fix waiting for a time update large enough to absorb its delay.
struct PendingCorrection {
    solution: GpsSolution,
    lever: Option<(Vector3<f64>, Vector3<f64>)>,
    /// How far behind the newest inertial packet the fix is, s.
    delay: f64,
    /// Time spent waiting, s.
    age: f64,
}

/// Deferred-correction variant for unsorted (real-time) packet streams.
pub struct RealTimeFilter {
    pub inner: InsGps,
    horizon: f64,
    pending: Option<PendingCorrection>,
}

impl RealTimeFilter {
    pub fn new(inner: InsGps, horizon: f64) -> Self {
        RealTimeFilter {
            inner,
            horizon,
            pending: None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Submit a GPS fix. `advance` is the rollover-reduced interval from
    /// the newest inertial packet to the fix: non-negative fixes apply
    /// immediately, late ones are deferred.
    pub fn correct(
        &mut self,
        solution: &GpsSolution,
        lever: Option<(Vector3<f64>, Vector3<f64>)>,
        advance: f64,
    ) -> Result<bool, FilterError> {
        if advance >= 0.0 {
            match &lever {
                Some((arm, omega)) => {
                    self.inner.correct_with_lever_arm(solution, arm, omega)?;
                }
                None => {
                    self.inner.correct(solution)?;
                }
            }
            return Ok(true);
        }
        if self.pending.is_some() {
            log::debug!("replacing an unabsorbed pending GPS correction");
        }
        self.pending = Some(PendingCorrection {
            solution: *solution,
            lever,
            delay: -advance,
            age: 0.0,
        });
        Ok(false)
    }

    /// Time update. A pending fix whose delay fits inside `dt` splits the
    /// step: advance by `dt - delay`, correct, then advance by `delay`.
    /// Returns whether a deferred correction was applied.
    pub fn update(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        dt: f64,
    ) -> Result<bool, FilterError> {
        if let Some(mut pending) = self.pending.take() {
            if dt >= pending.delay {
                self.inner.update(accel, gyro, dt - pending.delay)?;
                match &pending.lever {
                    Some((arm, omega)) => {
                        self.inner
                            .correct_with_lever_arm(&pending.solution, arm, omega)?;
                    }
                    None => {
                        self.inner.correct(&pending.solution)?;
                    }
                }
                self.inner.update(accel, gyro, pending.delay)?;
                return Ok(true);
            }
            pending.age += dt;
            if pending.age > self.horizon {
                log::debug!(
                    "dropping pending GPS correction {}s late beyond the {}s horizon",
                    pending.delay,
                    self.horizon
                );
            } else {
                self.pending = Some(pending);
            }
        }
        self.inner.update(accel, gyro, dt)?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::earth;
    use assert_approx_eq::assert_approx_eq;

    fn stationary_accel() -> Vector3<f64> {
        Vector3::new(0.0, 0.0, -earth::gravity_wgs84(0.0, 0.0))
    }

    fn gps_at_origin() -> GpsSolution {
        GpsSolution {
            sigma_2d: 5.0,
            sigma_height: 5.0,
            sigma_vel: 0.5,
            ..Default::default()
        }
    }

    fn run_sequence(filter: &mut InsGps) {
        let accel = stationary_accel();
        let gyro = Vector3::zeros();
        for step in 0..250 {
            filter.update(&accel, &gyro, 0.02).unwrap();
            if step % 50 == 49 {
                filter.correct(&gps_at_origin()).unwrap();
            }
        }
    }

    #[test]
    fn stationary_corrections_keep_state_near_origin() {
        let mut filter = InsGps::new(&FilterSetup::default());
        run_sequence(&mut filter);
        assert_approx_eq!(filter.ins.latitude, 0.0, 1e-5);
        assert_approx_eq!(filter.ins.altitude, 0.0, 1.0);
        assert!(filter.ins.velocity().norm() < 0.5);
    }

    #[test]
    fn standard_and_ud_variants_agree() {
        let setup = FilterSetup::default();
        let mut standard = InsGps::new(&setup);
        let mut factored = InsGps::new(&FilterSetup {
            use_udkf: true,
            ..setup
        });
        run_sequence(&mut standard);
        run_sequence(&mut factored);
        let relative = |a: f64, b: f64| (a - b).abs() / a.abs().max(b.abs()).max(1e-30);
        assert!(relative(1.0 + standard.ins.latitude, 1.0 + factored.ins.latitude) < 1e-7);
        assert!(
            (standard.ins.velocity() - factored.ins.velocity()).norm()
                < 1e-7 * standard.ins.velocity().norm().max(1.0)
        );
        let p_a = standard.covariance();
        let p_b = factored.covariance();
        for i in 0..p_a.rows() {
            assert!(relative(p_a.get(i, i), p_b.get(i, i)) < 1e-6);
        }
    }

    #[test]
    fn polar_latitude_fails_loudly() {
        let mut filter = InsGps::new(&FilterSetup::default());
        filter.ins.latitude = 89.5_f64.to_radians();
        let accel = stationary_accel();
        let gyro = Vector3::zeros();
        let result = filter.update(&accel, &gyro, 0.02);
        assert!(matches!(result, Err(FilterError::PolarRegion(_))));
        // Below the limit the same step is accepted.
        filter.ins.latitude = 80.0_f64.to_radians();
        assert!(filter.update(&accel, &gyro, 0.02).is_ok());
    }

    #[test]
    fn covariance_contracts_under_measurements() {
        let mut filter = InsGps::new(&FilterSetup::default());
        let accel = stationary_accel();
        let gyro = Vector3::zeros();
        for _ in 0..10 {
            filter.update(&accel, &gyro, 0.02).unwrap();
        }
        let before = filter.covariance();
        filter.correct(&gps_at_origin()).unwrap();
        let after = filter.covariance();
        for i in 0..6 {
            assert!(after.get(i, i) < before.get(i, i));
        }
    }

    #[test]
    fn yaw_correction_rotates_heading() {
        let mut filter = InsGps::new(&FilterSetup::default());
        let accel = stationary_accel();
        let gyro = Vector3::zeros();
        for _ in 0..5 {
            filter.update(&accel, &gyro, 0.02).unwrap();
        }
        let before = filter.ins.heading();
        // A strong, repeated yaw observation pulls the heading over.
        for _ in 0..20 {
            let delta = 0.5 - filter.ins.heading();
            filter.correct_yaw(delta, 0.05).unwrap();
        }
        assert!((filter.ins.heading() - 0.5).abs() < (before - 0.5).abs());
        assert_approx_eq!(filter.ins.heading(), 0.5, 0.05);
    }

    #[test]
    fn lever_arm_shifts_the_measured_position() {
        let mut plain = InsGps::new(&FilterSetup::default());
        let mut compensated = plain.clone();
        let solution = gps_at_origin();
        plain.correct(&solution).unwrap();
        compensated
            .correct_with_lever_arm(&solution, &Vector3::new(1.0, 0.0, 0.0), &Vector3::zeros())
            .unwrap();
        // A 1 m north lever arm pulls the corrected latitude south of the
        // plain solution.
        assert!(compensated.ins.latitude < plain.ins.latitude);
    }

    #[test]
    fn smoother_ring_respects_depth() {
        let inner = InsGps::new(&FilterSetup::default());
        let mut smoother = BackPropagateFilter::new(inner, 2.0);
        let accel = stationary_accel();
        let gyro = Vector3::zeros();
        for _ in 0..200 {
            smoother.update(&accel, &gyro, 0.02).unwrap();
        }
        assert!(smoother.snapshots().iter().all(|s| s.age <= 2.0 + 1e-6));
        // 2 s window at 50 Hz: 100 in-window snapshots plus the head
        // (rounding of the accumulated ages may trim the boundary entry).
        let count = smoother.snapshots().len();
        assert!((100..=101).contains(&count), "ring held {} snapshots", count);
    }

    #[test]
    fn smoother_marks_head_as_corrected() {
        let inner = InsGps::new(&FilterSetup::default());
        let mut smoother = BackPropagateFilter::new(inner, 1.0);
        let accel = stationary_accel();
        let gyro = Vector3::zeros();
        for _ in 0..50 {
            smoother.update(&accel, &gyro, 0.02).unwrap();
        }
        smoother.correct(&gps_at_origin(), None).unwrap();
        assert!(smoother.snapshots().front().unwrap().corrected);
        assert!(smoother.snapshots().iter().skip(1).all(|s| !s.corrected));
    }

    #[test]
    fn smoother_backward_pass_updates_old_states() {
        let inner = InsGps::new(&FilterSetup::default());
        let mut smoother = BackPropagateFilter::new(inner, 1.0);
        let accel = stationary_accel();
        let gyro = Vector3::zeros();
        for _ in 0..50 {
            smoother.update(&accel, &gyro, 0.02).unwrap();
        }
        // Pull the solution 20 m north; the whole window should shift.
        let mut solution = gps_at_origin();
        let (r_n, _, _) = earth::principal_radii(0.0, 0.0);
        solution.latitude = 20.0 / r_n;
        let stale = smoother.snapshots().back().unwrap().nav.ins.latitude;
        smoother.correct(&solution, None).unwrap();
        let smoothed = smoother.snapshots().back().unwrap().nav.ins.latitude;
        assert!(smoothed > stale);
    }

    #[test]
    fn realtime_defers_late_fix_until_absorbing_step() {
        let inner = InsGps::new(&FilterSetup::default());
        let mut realtime = RealTimeFilter::new(inner, 1.0);
        let accel = stationary_accel();
        let gyro = Vector3::zeros();
        realtime.update(&accel, &gyro, 0.02).unwrap();
        // Fix 10 ms behind the newest inertial packet.
        let applied = realtime.correct(&gps_at_origin(), None, -0.01).unwrap();
        assert!(!applied);
        assert!(realtime.has_pending());
        // The next 20 ms step absorbs it.
        let corrected = realtime.update(&accel, &gyro, 0.02).unwrap();
        assert!(corrected);
        assert!(!realtime.has_pending());
    }

    #[test]
    fn realtime_drops_fix_beyond_horizon() {
        let inner = InsGps::new(&FilterSetup::default());
        let mut realtime = RealTimeFilter::new(inner, 0.05);
        let accel = stationary_accel();
        let gyro = Vector3::zeros();
        realtime.update(&accel, &gyro, 0.02).unwrap();
        realtime.correct(&gps_at_origin(), None, -0.5).unwrap();
        assert!(realtime.has_pending());
        for _ in 0..4 {
            let corrected = realtime.update(&accel, &gyro, 0.02).unwrap();
            assert!(!corrected);
        }
        assert!(!realtime.has_pending());
    }
}
