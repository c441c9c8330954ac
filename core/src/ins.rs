//! Strapdown INS mechanization in the local NED frame
//!
//! Integrates body-frame specific force and angular rate into geodetic
//! position, NED velocity, and attitude on the rotating Earth. The equations
//! follow Groves, _Principles of GNSS, Inertial, and Multisensor Integrated
//! Navigation Systems_ (2nd ed.), chapter 5.4, specialized to the NED
//! local-level frame:
//!
//! 1. The attitude quaternion integrates
//!    `omega_nb = omega_ib - C_n^b (omega_ie + omega_en)`, removing Earth
//!    rotation and transport rate from the sensed body rate.
//! 2. Specific force is rotated into NED with the trapezoidal mean of the
//!    old and new attitude, gravity (positive down) is added, and the
//!    Coriolis/transport term `(omega_en + 2 omega_ie) x v` is subtracted.
//! 3. Position integrates trapezoidally through the meridian and transverse
//!    radii of curvature at the current latitude and height.
//!
//! Attitude is carried as a unit quaternion (body to NED) throughout, so
//! the attitude integration has no Euler-angle singularities; Euler angles
//! only appear at the output boundary. The navigation frame itself is
//! north-aligned, which keeps `1/cos(lat)` in the longitude rate and
//! `tan(lat)` in the transport rate: the mechanization is only valid below
//! [`MAX_OPERATING_LATITUDE`], and the filter refuses to run past it
//! rather than integrate through the polar singularity.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use crate::earth;
use crate::wrap_to_pi;

/// Highest geodetic latitude (either hemisphere, rad) the north-aligned
/// mechanization accepts; 89 degrees. Beyond it the longitude and
/// transport-rate terms blow up and the filter raises an error instead of
/// producing meaningless output.
pub const MAX_OPERATING_LATITUDE: f64 = 89.0 * std::f64::consts::PI / 180.0;

/// Gravity model used by the velocity update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GravityModel {
    /// WGS84 Somigliana normal gravity with the linear free-air correction.
    #[default]
    Wgs84,
    /// Altitude-corrected precise model (the `use_egm` switch).
    Precise,
}

impl GravityModel {
    /// Downward gravity magnitude at the given position, m/s^2.
    pub fn gravity(&self, latitude: f64, altitude: f64) -> f64 {
        match self {
            GravityModel::Wgs84 => earth::gravity_wgs84(latitude, altitude),
            GravityModel::Precise => earth::gravity_precise(latitude, altitude),
        }
    }
}

/// Full strapdown navigation state.
#[derive(Clone, Copy, Debug)]
pub struct InsState {
    /// Geodetic latitude, rad.
    pub latitude: f64,
    /// Geodetic longitude, rad.
    pub longitude: f64,
    /// Ellipsoidal height, m.
    pub altitude: f64,
    /// North velocity, m/s.
    pub velocity_north: f64,
    /// East velocity, m/s.
    pub velocity_east: f64,
    /// Down velocity, m/s.
    pub velocity_down: f64,
    /// Body-to-NED attitude.
    pub attitude: UnitQuaternion<f64>,
}

impl Default for InsState {
    fn default() -> Self {
        InsState {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            velocity_north: 0.0,
            velocity_east: 0.0,
            velocity_down: 0.0,
            attitude: UnitQuaternion::identity(),
        }
    }
}

impl InsState {
    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(self.velocity_north, self.velocity_east, self.velocity_down)
    }

    pub fn set_velocity(&mut self, v: &Vector3<f64>) {
        self.velocity_north = v[0];
        self.velocity_east = v[1];
        self.velocity_down = v[2];
    }

    /// Body-to-NED direction cosine matrix.
    pub fn attitude_matrix(&self) -> Matrix3<f64> {
        *self.attitude.to_rotation_matrix().matrix()
    }

    /// Euler roll angle, rad.
    pub fn roll(&self) -> f64 {
        self.attitude.euler_angles().0
    }

    /// Euler pitch angle, rad.
    pub fn pitch(&self) -> f64 {
        self.attitude.euler_angles().1
    }

    /// True heading (Euler yaw), rad in `[-pi, pi]`.
    pub fn heading(&self) -> f64 {
        self.attitude.euler_angles().2
    }

    pub fn init_position(&mut self, latitude: f64, longitude: f64, altitude: f64) {
        self.latitude = latitude;
        self.longitude = longitude;
        self.altitude = altitude;
    }

    pub fn init_velocity(&mut self, v_north: f64, v_east: f64, v_down: f64) {
        self.velocity_north = v_north;
        self.velocity_east = v_east;
        self.velocity_down = v_down;
    }

    /// Set the attitude from Euler angles (rad).
    pub fn init_attitude(&mut self, yaw: f64, pitch: f64, roll: f64) {
        self.attitude = UnitQuaternion::from_euler_angles(roll, pitch, yaw);
    }
}

/// Roll and pitch from the mean specific-force vector of a stationary
/// window.
///
/// A body at rest senses the upward reaction to gravity, so the negated,
/// normalized mean accelerometer vector points down in body coordinates:
/// roll is `atan2(a_y, a_z)` and pitch `-asin(a_x)` of that vector.
pub fn attitude_from_gravity(mean_accel: &Vector3<f64>) -> (f64, f64) {
    let down_body = -(mean_accel / mean_accel.norm());
    let roll = down_body[1].atan2(down_body[2]);
    let pitch = -down_body[0].asin();
    (roll, pitch)
}

/// One mechanization step: advance `state` by `dt` seconds using the
/// body-frame specific force (m/s^2) and angular rate (rad/s).
///
/// Only meaningful while `|latitude| < MAX_OPERATING_LATITUDE`; the filter
/// enforces the bound before and after every step.
pub fn forward(
    state: &mut InsState,
    accel: &Vector3<f64>,
    gyro: &Vector3<f64>,
    dt: f64,
    gravity_model: GravityModel,
) {
    let velocity = state.velocity();
    let c_bn_0 = state.attitude_matrix();

    // Attitude: remove Earth rotation and transport rate from the sensed
    // body rate, then integrate in the body frame.
    let omega_ie = earth::earth_rate(state.latitude);
    let omega_en = earth::transport_rate(state.latitude, state.altitude, &velocity);
    let omega_nb_b = gyro - c_bn_0.transpose() * (omega_ie + omega_en);
    let attitude_1 = state.attitude * UnitQuaternion::from_scaled_axis(omega_nb_b * dt);
    let c_bn_1 = *attitude_1.to_rotation_matrix().matrix();

    // Specific force through the trapezoidal attitude mean.
    let f_ned = 0.5 * (c_bn_0 + c_bn_1) * accel;

    // Velocity with gravity (positive down) and Coriolis/transport.
    let gravity_ned = Vector3::new(
        0.0,
        0.0,
        gravity_model.gravity(state.latitude, state.altitude),
    );
    let velocity_1 =
        velocity + (f_ned + gravity_ned - (omega_en + 2.0 * omega_ie).cross(&velocity)) * dt;

    // Position, trapezoidal through the curvature radii.
    let (r_n, r_e_0, _) = earth::principal_radii(state.latitude, state.altitude);
    let altitude_1 = state.altitude - 0.5 * (state.velocity_down + velocity_1[2]) * dt;
    let latitude_1 = state.latitude
        + 0.5
            * (state.velocity_north / (r_n + state.altitude)
                + velocity_1[0] / (r_n + altitude_1))
            * dt;
    let (_, r_e_1, _) = earth::principal_radii(latitude_1, altitude_1);
    let cos_lat_0 = state.latitude.cos();
    let cos_lat_1 = latitude_1.cos();
    let longitude_1 = state.longitude
        + 0.5
            * (state.velocity_east / ((r_e_0 + state.altitude) * cos_lat_0)
                + velocity_1[1] / ((r_e_1 + altitude_1) * cos_lat_1))
            * dt;

    state.attitude = attitude_1;
    state.set_velocity(&velocity_1);
    state.latitude = latitude_1;
    state.longitude = wrap_to_pi(longitude_1);
    state.altitude = altitude_1;
}
