//! Loosely-coupled INS/GPS post-processing for small strapdown data loggers
//!
//! This crate fuses the three asynchronous streams a portable logger
//! records — inertial samples (3-axis accelerometer and rate gyro), GPS
//! single-point solutions, and optional magnetic field samples — into a
//! time series of navigation states: geodetic position, NED velocity, and
//! attitude (true heading, pitch, roll), optionally with sensor-bias
//! estimates and per-state standard deviations. The integration is a
//! classic loosely-coupled extended Kalman filter: the GPS receiver's
//! solved position/velocity is the measurement, the strapdown
//! mechanization is the process model, and the filter carries the error
//! covariance between them.
//!
//! The primary reference for the mechanization and the error model is
//! Paul D. Groves, _Principles of GNSS, Inertial, and Multisensor
//! Integrated Navigation Systems_, 2nd edition (chapters 5.4 and 14.2).
//! Variables are generally named for the quantity they represent rather
//! than the symbol in the book.
//!
//! ## Crate layout
//!
//! - [`matrix`]: the dense matrix kernel with shared storage, composable
//!   transpose/partial views, and the factorizations (LUP, UD,
//!   Hessenberg, eigen, square root, inverse) everything else builds on.
//! - [`earth`]: WGS84 constants, gravity models, curvature radii, and
//!   frame rates.
//! - [`messages`]: the decoded `A`/`G`/`M`/`T` packets and their
//!   week-aware time ordering.
//! - [`calib`]: raw-count sensor calibration (bias, scale factor,
//!   misalignment, noise sigma).
//! - [`ins`]: the strapdown mechanization in the local NED frame.
//! - [`linearize`]: the analytic error-state Jacobians for the EKF.
//! - [`kalman`]: the standard and UD-factorized error-covariance engines.
//! - [`filter`]: the INS/GPS filter, bias augmentation, the
//!   back-propagation smoother, and the real-time deferred-correction
//!   variant.
//! - [`magnet`]: expected-field lookup and magnetic yaw angles.
//! - [`scheduler`]: the packet fusion pipeline — sort buffer, static
//!   initialization, gating, and filter sequencing.
//! - [`output`]: the tabular navigation output stream and calendar time
//!   stamping.
//!
//! The scheduler's [`scheduler::run`] is the whole-pipeline entry point a
//! driver binary calls with a decoded packet stream and a configuration.

pub mod calib;
pub mod earth;
pub mod filter;
pub mod ins;
pub mod kalman;
pub mod linearize;
pub mod magnet;
pub mod matrix;
pub mod messages;
pub mod output;
pub mod scheduler;

/// Wrap an angle in radians to `[-pi, pi]`.
pub fn wrap_to_pi(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped > std::f64::consts::PI {
        wrapped -= 2.0 * std::f64::consts::PI;
    }
    while wrapped < -std::f64::consts::PI {
        wrapped += 2.0 * std::f64::consts::PI;
    }
    wrapped
}

/// Wrap an angle in degrees to `[-180, 180]`.
pub fn wrap_to_180(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped > 180.0 {
        wrapped -= 360.0;
    }
    while wrapped < -180.0 {
        wrapped += 360.0;
    }
    wrapped
}
