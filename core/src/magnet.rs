//! Magnetic heading support through the Earth magnetic field model
//!
//! The magnetometer only ever contributes direction, never magnitude: the
//! measured field is de-rotated into the navigation frame with the current
//! attitude and its horizontal azimuth is compared against the model field
//! at the current position and date. The difference is the yaw correction
//! angle fed to the filter's scalar yaw update, and the same comparison
//! with a zero-yaw attitude yields the initial magnetic heading during
//! static alignment.
//!
//! The model is the World Magnetic Model as packaged by the
//! `world_magnetic_model` crate. Positions or dates outside the model's
//! validity return `None` and the caller skips the correction.

use nalgebra::{UnitQuaternion, Vector3};
use world_magnetic_model::time::Date;
use world_magnetic_model::uom::si::angle::degree;
use world_magnetic_model::uom::si::f32::{Angle, Length};
use world_magnetic_model::uom::si::length::meter;
use world_magnetic_model::GeomagneticField;

use crate::wrap_to_pi;

/// Days from the GPS epoch (1980-01-06) to 1970-01-01, for calendar math.
const GPS_EPOCH_ORDINAL: i64 = 3657; // days from 1970-01-01 to 1980-01-06

/// Model date from the GPS week number and time of week. Without a
/// resolved week number the model is evaluated at a fixed date inside its
/// validity window; declination drifts slowly enough that this only costs
/// a fraction of a degree.
pub fn model_date(week: Option<i32>, itow: f64) -> Date {
    let fallback = Date::from_ordinal_date(2020, 1).expect("fixed fallback date is valid");
    match week {
        Some(week) => {
            let days_since_unix =
                GPS_EPOCH_ORDINAL + i64::from(week) * 7 + (itow / 86400.0) as i64;
            match chrono::DateTime::from_timestamp(days_since_unix * 86400, 0) {
                Some(stamp) => {
                    use chrono::Datelike;
                    let date = stamp.date_naive();
                    Date::from_ordinal_date(date.year(), date.ordinal() as u16)
                        .unwrap_or(fallback)
                }
                None => fallback,
            }
        }
        None => fallback,
    }
}

/// Expected magnetic field components in NED at a geodetic position
/// (radians, meters). `None` when the position or date falls outside the
/// model.
pub fn expected_field_ned(
    latitude: f64,
    longitude: f64,
    altitude: f64,
    date: Date,
) -> Option<Vector3<f64>> {
    let field = GeomagneticField::new(
        Length::new::<meter>(altitude as f32),
        Angle::new::<degree>(latitude.to_degrees() as f32),
        Angle::new::<degree>(longitude.to_degrees() as f32),
        date,
    )
    .ok()?;
    Some(Vector3::new(
        f64::from(field.x().value),
        f64::from(field.y().value),
        f64::from(field.z().value),
    ))
}

/// Yaw correction angle (rad) from a magnetic sample: the azimuth of the
/// model field minus the azimuth of the measured field de-rotated through
/// the given attitude. Positive means the attitude's yaw must grow.
pub fn mag_delta_yaw(
    mag_body: &Vector3<f64>,
    attitude: &UnitQuaternion<f64>,
    latitude: f64,
    longitude: f64,
    altitude: f64,
    date: Date,
) -> Option<f64> {
    let mag_ned = attitude * mag_body;
    let field = expected_field_ned(latitude, longitude, altitude, date)?;
    Some(wrap_to_pi(
        field[1].atan2(field[0]) - mag_ned[1].atan2(mag_ned[0]),
    ))
}

/// Absolute magnetic heading (rad) under the static-alignment assumption:
/// the yaw correction of a zero-yaw attitude with the given pitch and
/// roll.
pub fn mag_yaw(
    mag_body: &Vector3<f64>,
    pitch: f64,
    roll: f64,
    latitude: f64,
    longitude: f64,
    altitude: f64,
    date: Date,
) -> Option<f64> {
    let attitude = UnitQuaternion::from_euler_angles(roll, pitch, 0.0);
    mag_delta_yaw(mag_body, &attitude, latitude, longitude, altitude, date)
}
