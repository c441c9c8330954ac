//! WGS84 Earth model: constants, gravity, curvature radii, and rotation rates
//!
//! Everything the mechanization and the error-state linearization need from
//! the Earth lives here: the WGS84 ellipsoid constants, Somigliana normal
//! gravity (with an optional altitude-corrected variant used when the
//! precise-gravity switch is on), the meridian and transverse radii of
//! curvature, the Earth rotation rate and transport rate resolved in the
//! local NED frame, and the skew-symmetric helpers used to write cross
//! products as matrix products.
//!
//! All angles are radians and all signatures take plain values; the NED
//! (north-east-down) convention is fixed throughout the crate, so gravity is
//! positive down.

use nalgebra::{Matrix3, Vector3};

/// Earth rotation rate omega_ie, rad/s.
pub const RATE: f64 = 7.2921159e-5;
/// WGS84 semi-major axis, m.
pub const EQUATORIAL_RADIUS: f64 = 6378137.0;
/// WGS84 semi-minor axis, m.
pub const POLAR_RADIUS: f64 = 6356752.31425;
/// WGS84 first eccentricity.
pub const ECCENTRICITY: f64 = 0.0818191908425;
pub const ECCENTRICITY_SQUARED: f64 = ECCENTRICITY * ECCENTRICITY;
/// Normal gravity at the equator, m/s^2.
pub const GE: f64 = 9.7803253359;
/// Normal gravity at the poles, m/s^2.
pub const GP: f64 = 9.8321849378;
/// WGS84 flattening.
pub const F: f64 = 1.0 / 298.257223563;
/// Somigliana's constant.
pub const K: f64 = (POLAR_RADIUS * GP - EQUATORIAL_RADIUS * GE) / (EQUATORIAL_RADIUS * GE);

/// Build the skew-symmetric matrix `[v x]` of a 3-vector, so that
/// `skew(v) * w == v.cross(&w)`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v[2], v[1], //
        v[2], 0.0, -v[0], //
        -v[1], v[0], 0.0,
    )
}

/// Recover the vector from a skew-symmetric matrix; the inverse of
/// [`skew_symmetric`].
pub fn skew_symmetric_to_vector(skew: &Matrix3<f64>) -> Vector3<f64> {
    Vector3::new(skew[(2, 1)], skew[(0, 2)], skew[(1, 0)])
}

/// Meridian and transverse radii of curvature at a geodetic latitude
/// (radians), plus the radius of the parallel through the point.
///
/// Returns `(r_n, r_e, r_p)`: the meridian (north-south) radius, the
/// transverse (east-west, also "normal") radius, and the parallel radius.
pub fn principal_radii(latitude: f64, altitude: f64) -> (f64, f64, f64) {
    let sin_lat = latitude.sin();
    let denom = 1.0 - ECCENTRICITY_SQUARED * sin_lat * sin_lat;
    let r_n = EQUATORIAL_RADIUS * (1.0 - ECCENTRICITY_SQUARED) / denom.powf(1.5);
    let r_e = EQUATORIAL_RADIUS / denom.sqrt();
    let r_p = (r_e + altitude) * latitude.cos();
    (r_n, r_e, r_p)
}

/// Somigliana normal gravity with the first-order free-air correction,
/// positive down, m/s^2. Latitude in radians, altitude in meters.
pub fn gravity_wgs84(latitude: f64, altitude: f64) -> f64 {
    let sin2 = latitude.sin().powi(2);
    let g0 = GE * (1.0 + K * sin2) / (1.0 - ECCENTRICITY_SQUARED * sin2).sqrt();
    g0 - 3.08e-6 * altitude
}

/// Altitude-corrected gravity used when the precise Earth gravity model is
/// selected: Somigliana surface gravity carried upward with the full
/// second-order height series instead of the constant free-air gradient.
pub fn gravity_precise(latitude: f64, altitude: f64) -> f64 {
    let sin2 = latitude.sin().powi(2);
    let g0 = GE * (1.0 + K * sin2) / (1.0 - ECCENTRICITY_SQUARED * sin2).sqrt();
    let m = RATE * RATE * EQUATORIAL_RADIUS * POLAR_RADIUS / GE;
    let h_term = 1.0
        - 2.0 / EQUATORIAL_RADIUS * (1.0 + F + m - 2.0 * F * sin2) * altitude
        + 3.0 / (EQUATORIAL_RADIUS * EQUATORIAL_RADIUS) * altitude * altitude;
    g0 * h_term
}

/// Earth rotation rate resolved in the local NED frame at the given
/// latitude (radians): `[omega cos(lat), 0, -omega sin(lat)]`.
pub fn earth_rate(latitude: f64) -> Vector3<f64> {
    Vector3::new(RATE * latitude.cos(), 0.0, -RATE * latitude.sin())
}

/// Transport rate of the local NED frame with respect to the Earth frame,
/// driven by the vehicle's velocity over the curved surface:
/// `[v_e/(R_e+h), -v_n/(R_n+h), -v_e tan(lat)/(R_e+h)]`.
///
/// The `tan(lat)` term diverges at the poles; callers stay inside the
/// mechanization's operating latitude.
pub fn transport_rate(latitude: f64, altitude: f64, velocity_ned: &Vector3<f64>) -> Vector3<f64> {
    let (r_n, r_e, _) = principal_radii(latitude, altitude);
    Vector3::new(
        velocity_ned[1] / (r_e + altitude),
        -velocity_ned[0] / (r_n + altitude),
        -velocity_ned[1] * latitude.tan() / (r_e + altitude),
    )
}

/// Analytic derivative of Somigliana gravity with respect to latitude,
/// used by the error-state Jacobian.
pub fn gravity_gradient_lat(latitude: f64) -> f64 {
    let sin_lat = latitude.sin();
    let cos_lat = latitude.cos();
    let sin2 = sin_lat * sin_lat;
    let denom_sqrt = (1.0 - ECCENTRICITY_SQUARED * sin2).sqrt();
    let numerator = 1.0 + K * sin2;
    let dnum = 2.0 * K * sin_lat * cos_lat;
    let dden = -ECCENTRICITY_SQUARED * sin_lat * cos_lat / denom_sqrt;
    GE * (dnum * denom_sqrt - numerator * dden) / (denom_sqrt * denom_sqrt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn skew_round_trip() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let skew = skew_symmetric(&v);
        assert_eq!(skew_symmetric_to_vector(&skew), v);
        let w = Vector3::new(-0.5, 4.0, 2.0);
        let cross = v.cross(&w);
        let via_matrix = skew * w;
        for i in 0..3 {
            assert_approx_eq!(cross[i], via_matrix[i], 1e-12);
        }
    }

    #[test]
    fn gravity_limits() {
        assert_approx_eq!(gravity_wgs84(0.0, 0.0), GE, 1e-9);
        assert_approx_eq!(gravity_wgs84(std::f64::consts::FRAC_PI_2, 0.0), GP, 1e-9);
        // Free-air correction reduces gravity with height.
        assert!(gravity_wgs84(0.5, 1000.0) < gravity_wgs84(0.5, 0.0));
        assert!(gravity_precise(0.5, 1000.0) < gravity_precise(0.5, 0.0));
        // The two models agree at the surface.
        assert_approx_eq!(gravity_precise(0.7, 0.0), gravity_wgs84(0.7, 0.0), 1e-9);
    }

    #[test]
    fn radii_at_equator() {
        let (r_n, r_e, r_p) = principal_radii(0.0, 0.0);
        assert_approx_eq!(r_e, EQUATORIAL_RADIUS, 1e-6);
        assert!(r_n < r_e); // meridian radius is smaller at the equator
        assert_approx_eq!(r_p, EQUATORIAL_RADIUS, 1e-6);
    }

    #[test]
    fn earth_rate_components() {
        let lat: f64 = 45.0_f64.to_radians();
        let rate = earth_rate(lat);
        assert_approx_eq!(rate[0], RATE * lat.cos(), 1e-12);
        assert_approx_eq!(rate[1], 0.0, 1e-15);
        assert_approx_eq!(rate[2], -RATE * lat.sin(), 1e-12);
    }

    #[test]
    fn transport_rate_stationary_is_zero() {
        let rate = transport_rate(0.5, 100.0, &Vector3::zeros());
        assert_eq!(rate, Vector3::zeros());
    }
}
