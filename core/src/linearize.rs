//! Analytic linearization of the strapdown error dynamics and measurements
//!
//! The filter runs on an error state ordered as
//!
//! ```text
//! dx = [dlat, dlon, dh, dv_n, dv_e, dv_d, psi_n, psi_e, psi_d]
//! ```
//!
//! (radians, radians, meters, m/s, and nav-frame small-angle attitude
//! errors in radians), optionally extended with accelerometer and gyro
//! biases:
//!
//! ```text
//! dx = [..., db_ax, db_ay, db_az, db_gx, db_gy, db_gz]
//! ```
//!
//! The error convention is "correction to add": `x_true = x_est + dx`, with
//! the attitude correction applied as a rotation about the NED axes. The
//! discrete transition is the first-order `Phi = I + F dt` with the blocks
//! of Groves 14.2.4: kinematic position/velocity coupling through the
//! curvature radii, specific-force skew coupling into velocity,
//! Coriolis/transport damping, gravity gradient with latitude, transport
//! feedback into the attitude error, and first-order Gauss-Markov bias
//! dynamics.
//!
//! Input noise enters through `Gamma`: accelerometer noise rotates into the
//! velocity rows, gyro noise into the attitude rows, a scalar gravity noise
//! drives the vertical channel, and (when augmented) the bias drift noise
//! feeds the bias rows directly. The ordering of the noise vector is
//! `[w_ax, w_ay, w_az, w_gx, w_gy, w_gz, w_g]` (+6 bias drift terms).

use nalgebra::Vector3;

use crate::earth;
use crate::ins::InsState;
use crate::matrix::Matrix;
use crate::messages::GpsSolution;
use crate::wrap_to_pi;

/// Error-state dimension without bias augmentation.
pub const STATE_DIM: usize = 9;
/// Error-state dimension with accelerometer and gyro biases.
pub const STATE_DIM_BIAS: usize = 15;
/// Input-noise dimension without bias augmentation.
pub const NOISE_DIM: usize = 7;
/// Input-noise dimension with bias drift terms.
pub const NOISE_DIM_BIAS: usize = 13;

/// Discrete error-state transition `Phi = I + F dt`.
///
/// `accel` and `gyro` are the bias-corrected body-frame measurements the
/// mechanization consumed for this step. `beta_accel`/`beta_gyro` are the
/// Gauss-Markov rates of the bias states and are only read when
/// `est_bias` is set.
pub fn state_transition(
    state: &InsState,
    accel: &Vector3<f64>,
    dt: f64,
    est_bias: bool,
    beta_accel: f64,
    beta_gyro: f64,
) -> Matrix<f64> {
    let n = if est_bias { STATE_DIM_BIAS } else { STATE_DIM };
    let phi = Matrix::identity(n);

    let lat = state.latitude;
    let h = state.altitude;
    let velocity = state.velocity();
    let c_bn = state.attitude_matrix();
    let (r_n, r_e, _) = earth::principal_radii(lat, h);
    // The 1/cos and tan terms are finite inside the mechanization's
    // operating latitude, which the filter enforces around every step.
    let cos_lat = lat.cos();
    let tan_lat = lat.tan();

    // Position rows: geodetic rates through the curvature radii.
    phi.set(0, 3, dt / (r_n + h));
    phi.set(0, 2, -velocity[0] / (r_n + h).powi(2) * dt);
    phi.set(1, 4, dt / ((r_e + h) * cos_lat));
    phi.set(1, 0, velocity[1] * tan_lat / ((r_e + h) * cos_lat) * dt);
    phi.set(1, 2, -velocity[1] / ((r_e + h).powi(2) * cos_lat) * dt);
    phi.set(2, 5, -dt); // height is up, v_d is down

    // Velocity rows: Coriolis/transport damping ...
    let omega_ie = earth::earth_rate(lat);
    let omega_en = earth::transport_rate(lat, h, &velocity);
    let coriolis = earth::skew_symmetric(&(2.0 * omega_ie + omega_en));
    for i in 0..3 {
        for j in 0..3 {
            let updated = phi.get(3 + i, 3 + j) - coriolis[(i, j)] * dt;
            phi.set(3 + i, 3 + j, updated);
        }
    }
    // ... specific-force coupling into the attitude errors ...
    let f_ned = c_bn * accel;
    let f_skew = earth::skew_symmetric(&f_ned);
    for i in 0..3 {
        for j in 0..3 {
            phi.set(3 + i, 6 + j, -f_skew[(i, j)] * dt);
        }
    }
    // ... and the gravity gradient with latitude in the vertical channel.
    phi.set(5, 0, earth::gravity_gradient_lat(lat) * dt);

    // Attitude rows: rotation of the error by the frame rate, plus the
    // transport-rate feedback from the velocity errors.
    let omega_in = earth::skew_symmetric(&(omega_ie + omega_en));
    for i in 0..3 {
        for j in 0..3 {
            let updated = phi.get(6 + i, 6 + j) - omega_in[(i, j)] * dt;
            phi.set(6 + i, 6 + j, updated);
        }
    }
    phi.set(6, 4, dt / (r_e + h));
    phi.set(7, 3, -dt / (r_n + h));
    phi.set(8, 4, -tan_lat * dt / (r_e + h));

    if est_bias {
        // Bias coupling: the applied measurements carry the bias errors.
        for i in 0..3 {
            for j in 0..3 {
                phi.set(3 + i, 9 + j, -c_bn[(i, j)] * dt);
                phi.set(6 + i, 12 + j, -c_bn[(i, j)] * dt);
            }
        }
        // First-order Gauss-Markov bias dynamics.
        for i in 0..3 {
            phi.set(9 + i, 9 + i, 1.0 - beta_accel * dt);
            phi.set(12 + i, 12 + i, 1.0 - beta_gyro * dt);
        }
    }

    phi
}

/// Input-noise mapping `Gamma` matching [`state_transition`].
pub fn input_noise_mapping(state: &InsState, dt: f64, est_bias: bool) -> Matrix<f64> {
    let (n, q) = if est_bias {
        (STATE_DIM_BIAS, NOISE_DIM_BIAS)
    } else {
        (STATE_DIM, NOISE_DIM)
    };
    let gamma = Matrix::new(n, q);
    let c_bn = state.attitude_matrix();
    for i in 0..3 {
        for j in 0..3 {
            gamma.set(3 + i, j, c_bn[(i, j)] * dt); // accel noise into velocity
            gamma.set(6 + i, 3 + j, c_bn[(i, j)] * dt); // gyro noise into attitude
        }
    }
    gamma.set(5, 6, dt); // gravity model noise into the vertical channel
    if est_bias {
        for i in 0..6 {
            gamma.set(9 + i, 7 + i, dt); // bias drift noise
        }
    }
    gamma
}

/// GPS position/velocity observation: Jacobian, noise, and innovation.
///
/// The measurement is the six navigation states the receiver solves
/// directly, so `H` is an identity selection. The advertised horizontal
/// accuracy splits evenly between latitude and longitude, converted to
/// radians through the curvature radii at the current position; the speed
/// accuracy applies per velocity axis.
pub fn gps_observation(
    state: &InsState,
    solution: &GpsSolution,
    state_dim: usize,
) -> (Matrix<f64>, Matrix<f64>, Matrix<f64>) {
    let h_mat = Matrix::new(6, state_dim);
    for i in 0..6 {
        h_mat.set(i, i, 1.0);
    }

    let (r_n, r_e, _) = earth::principal_radii(state.latitude, state.altitude);
    let cos_lat = state.latitude.cos();
    let sigma_h = solution.sigma_2d / std::f64::consts::SQRT_2;
    let sigma_lat = sigma_h / (r_n + state.altitude);
    let sigma_lon = sigma_h / ((r_e + state.altitude) * cos_lat);

    let r_mat = Matrix::new(6, 6);
    r_mat.set(0, 0, sigma_lat.powi(2));
    r_mat.set(1, 1, sigma_lon.powi(2));
    r_mat.set(2, 2, solution.sigma_height.powi(2));
    for i in 3..6 {
        r_mat.set(i, i, solution.sigma_vel.powi(2));
    }

    let innovation = Matrix::new(6, 1);
    innovation.set(0, 0, solution.latitude - state.latitude);
    innovation.set(1, 0, wrap_to_pi(solution.longitude - state.longitude));
    innovation.set(2, 0, solution.height - state.altitude);
    innovation.set(3, 0, solution.v_north - state.velocity_north);
    innovation.set(4, 0, solution.v_east - state.velocity_east);
    innovation.set(5, 0, solution.v_down - state.velocity_down);

    (h_mat, r_mat, innovation)
}

/// Scalar yaw-error observation: a single row selecting the down component
/// of the attitude error.
pub fn yaw_observation(state_dim: usize, sigma_rad: f64) -> (Matrix<f64>, Matrix<f64>) {
    let h_mat = Matrix::new(1, state_dim);
    h_mat.set(0, 8, 1.0);
    let r_mat = Matrix::new(1, 1);
    r_mat.set(0, 0, sigma_rad.powi(2));
    (h_mat, r_mat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn level_state() -> InsState {
        let mut state = InsState::default();
        state.init_position(0.5, -1.0, 100.0);
        state
    }

    #[test]
    fn transition_shapes_follow_bias_flag() {
        let state = level_state();
        let accel = Vector3::new(0.0, 0.0, -9.8);
        let phi = state_transition(&state, &accel, 0.01, false, 0.0, 0.0);
        assert_eq!((phi.rows(), phi.cols()), (STATE_DIM, STATE_DIM));
        let phi_b = state_transition(&state, &accel, 0.01, true, 0.1, 0.1);
        assert_eq!((phi_b.rows(), phi_b.cols()), (STATE_DIM_BIAS, STATE_DIM_BIAS));
        // Gauss-Markov decay on the bias diagonal.
        assert_approx_eq!(phi_b.get(9, 9), 1.0 - 0.1 * 0.01, 1e-12);
    }

    #[test]
    fn velocity_error_feeds_position_error() {
        let state = level_state();
        let accel = Vector3::new(0.0, 0.0, -9.8);
        let phi = state_transition(&state, &accel, 1.0, false, 0.0, 0.0);
        let (r_n, _, _) = earth::principal_radii(0.5, 100.0);
        assert_approx_eq!(phi.get(0, 3), 1.0 / (r_n + 100.0), 1e-12);
        // Height error integrates the negated down velocity error.
        assert_approx_eq!(phi.get(2, 5), -1.0, 1e-12);
    }

    #[test]
    fn specific_force_couples_attitude_into_velocity() {
        let state = level_state();
        let accel = Vector3::new(0.0, 0.0, -9.8);
        let phi = state_transition(&state, &accel, 1.0, false, 0.0, 0.0);
        // With f = (0, 0, -g), -[f x] couples a north attitude error into
        // east velocity with +g and an east error into north with -g.
        assert_approx_eq!(phi.get(4, 6), 9.8, 0.1);
        assert_approx_eq!(phi.get(3, 7), -9.8, 0.1);
    }

    #[test]
    fn gamma_rotates_sensor_noise() {
        let state = level_state();
        let gamma = input_noise_mapping(&state, 0.5, true);
        assert_eq!((gamma.rows(), gamma.cols()), (STATE_DIM_BIAS, NOISE_DIM_BIAS));
        // Level attitude: C is identity, so the blocks are dt on the
        // diagonal.
        assert_approx_eq!(gamma.get(3, 0), 0.5, 1e-12);
        assert_approx_eq!(gamma.get(6, 3), 0.5, 1e-12);
        assert_approx_eq!(gamma.get(5, 6), 0.5, 1e-12);
        assert_approx_eq!(gamma.get(14, 12), 0.5, 1e-12);
    }

    #[test]
    fn gps_innovation_is_measurement_minus_estimate() {
        let mut state = level_state();
        state.init_velocity(1.0, 0.0, 0.0);
        let solution = GpsSolution {
            latitude: 0.5 + 1e-6,
            longitude: -1.0,
            height: 110.0,
            v_north: 2.0,
            v_east: 0.5,
            v_down: -0.1,
            sigma_2d: 5.0,
            sigma_height: 7.0,
            sigma_vel: 0.5,
        };
        let (h_mat, r_mat, innovation) = gps_observation(&state, &solution, STATE_DIM);
        assert_eq!((h_mat.rows(), h_mat.cols()), (6, STATE_DIM));
        assert_approx_eq!(innovation.get(0, 0), 1e-6, 1e-12);
        assert_approx_eq!(innovation.get(2, 0), 10.0, 1e-12);
        assert_approx_eq!(innovation.get(3, 0), 1.0, 1e-12);
        assert_approx_eq!(r_mat.get(2, 2), 49.0, 1e-9);
        // Horizontal sigma splits between the two axes.
        let (r_n, _, _) = earth::principal_radii(0.5, 100.0);
        let expected = (5.0 / std::f64::consts::SQRT_2 / (r_n + 100.0)).powi(2);
        assert_approx_eq!(r_mat.get(0, 0), expected, expected * 1e-9);
    }

    #[test]
    fn yaw_row_selects_down_attitude_error() {
        let (h_mat, r_mat) = yaw_observation(STATE_DIM_BIAS, 0.05);
        assert_eq!((h_mat.rows(), h_mat.cols()), (1, STATE_DIM_BIAS));
        assert_eq!(h_mat.get(0, 8), 1.0);
        assert_eq!(h_mat.get(0, 7), 0.0);
        assert_approx_eq!(r_mat.get(0, 0), 0.0025, 1e-12);
    }
}
