//! Decoded sensor packets and their week-aware time ordering
//!
//! The logger interleaves three asynchronous sensor streams plus an
//! occasional GPS time page. Page parsing is out of scope for this crate;
//! these are the decoded packet structures the fusion pipeline consumes.
//! Every packet carries a GPS time of week (`itow`, seconds in
//! `[0, 604800)`), and all interval arithmetic between packets is done
//! modulo one week so that a log spanning the Saturday/Sunday boundary
//! still sorts and differences correctly.

use nalgebra::Vector3;

/// Seconds in one GPS week.
pub const ONE_WEEK: f64 = 60.0 * 60.0 * 24.0 * 7.0;

/// Difference `b - a` reduced to the representative in
/// `[-one_week/2, +one_week/2)`.
///
/// Two packets on opposite sides of a week rollover are closer than half a
/// week in this metric, so `interval_rollover(604799.5, 0.5)` is `+1.0`
/// rather than `-604799.0`.
pub fn interval_rollover(a: f64, b: f64) -> f64 {
    let delta = b - a;
    delta - ((delta / ONE_WEEK) + 0.5).floor() * ONE_WEEK
}

/// Inertial sensor packet: calibrated specific force and body rate.
#[derive(Clone, Copy, Debug)]
pub struct APacket {
    /// GPS time of week, s.
    pub itow: f64,
    /// Specific force in the body frame, m/s^2.
    pub accel: Vector3<f64>,
    /// Angular rate in the body frame, rad/s.
    pub omega: Vector3<f64>,
}

/// GPS receiver solution attached to a G packet.
#[derive(Clone, Copy, Debug, Default)]
pub struct GpsSolution {
    /// Geodetic latitude, rad.
    pub latitude: f64,
    /// Geodetic longitude, rad.
    pub longitude: f64,
    /// Ellipsoidal height, m.
    pub height: f64,
    /// North velocity, m/s.
    pub v_north: f64,
    /// East velocity, m/s.
    pub v_east: f64,
    /// Down velocity, m/s.
    pub v_down: f64,
    /// Estimated horizontal 2D position accuracy (1 sigma), m.
    pub sigma_2d: f64,
    /// Estimated vertical position accuracy (1 sigma), m.
    pub sigma_height: f64,
    /// Estimated speed accuracy (1 sigma), m/s.
    pub sigma_vel: f64,
}

/// GPS packet: a single-point solution plus the optional antenna lever arm.
#[derive(Clone, Copy, Debug)]
pub struct GPacket {
    pub itow: f64,
    pub solution: GpsSolution,
    /// IMU-to-antenna offset in body coordinates, m, when configured.
    pub lever_arm: Option<Vector3<f64>>,
}

/// Magnetic sensor packet. The field vector is kept in raw sensor counts;
/// only its direction is ever used, so no scale calibration is applied.
#[derive(Clone, Copy, Debug)]
pub struct MPacket {
    pub itow: f64,
    pub mag: Vector3<f64>,
}

/// Outlier threshold between the samples bundled in one M page, counts.
const MAG_OUTLIER_THRESHOLD: i32 = 200;
/// The magnetometer counter wraps at 4096 counts on a signed span.
const MAG_WRAP: i32 = 4096 * 2;

impl MPacket {
    /// Build an M packet from the four bundled samples per axis, rejecting
    /// the whole page when any sample disagrees with the last one by more
    /// than the outlier threshold (evaluated modulo the counter wrap).
    ///
    /// The last sample of each axis is the one carried by the packet.
    pub fn from_samples(itow: f64, samples: &[[i16; 4]; 3]) -> Option<MPacket> {
        for axis in samples.iter() {
            for sample in axis.iter().take(3) {
                let diff_abs = (i32::from(*sample) - i32::from(axis[3])).abs();
                if diff_abs > MAG_OUTLIER_THRESHOLD && diff_abs < MAG_WRAP - MAG_OUTLIER_THRESHOLD
                {
                    return None;
                }
            }
        }
        Some(MPacket {
            itow,
            mag: Vector3::new(
                f64::from(samples[0][3]),
                f64::from(samples[1][3]),
                f64::from(samples[2][3]),
            ),
        })
    }
}

/// GPS time page: week number and UTC leap seconds when the receiver has
/// resolved them. Required before calendar-formatted output can start.
#[derive(Clone, Copy, Debug)]
pub struct TimePacket {
    pub itow: f64,
    pub week: Option<i32>,
    pub leap_seconds: Option<i32>,
}

/// Any decoded packet, ready for the fusion scheduler.
#[derive(Clone, Debug)]
pub enum Packet {
    Accel(APacket),
    Gps(GPacket),
    Mag(MPacket),
    Time(TimePacket),
}

impl Packet {
    pub fn itow(&self) -> f64 {
        match self {
            Packet::Accel(p) => p.itow,
            Packet::Gps(p) => p.itow,
            Packet::Mag(p) => p.itow,
            Packet::Time(p) => p.itow,
        }
    }

    /// Week-aware ordering predicate for the sort buffer: `self` sorts
    /// before `other` when the rollover-reduced interval to it is positive.
    pub fn before(&self, other: &Packet) -> bool {
        interval_rollover(self.itow(), other.itow()) > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn rollover_interval_spans_week_boundary() {
        assert_approx_eq!(interval_rollover(604799.5, 0.5), 1.0, 1e-9);
        assert_approx_eq!(interval_rollover(0.5, 604799.5), -1.0, 1e-9);
        assert_approx_eq!(interval_rollover(10.0, 12.5), 2.5, 1e-9);
    }

    #[test]
    fn packets_sort_across_rollover() {
        let early = Packet::Time(TimePacket {
            itow: 604799.5,
            week: None,
            leap_seconds: None,
        });
        let late = Packet::Time(TimePacket {
            itow: 0.5,
            week: None,
            leap_seconds: None,
        });
        assert!(early.before(&late));
        assert!(!late.before(&early));
    }

    #[test]
    fn mag_outlier_drops_packet() {
        let mut samples = [[100i16; 4]; 3];
        samples[0][0] = 5000;
        assert!(MPacket::from_samples(0.0, &samples).is_none());
    }

    #[test]
    fn mag_wraparound_is_not_an_outlier() {
        // A counter wrap looks like a huge jump but reduces to a small one
        // modulo the wrap span.
        let samples = [[4090i16, 4090, 4090, -4090], [0; 4], [0; 4]];
        let packet = MPacket::from_samples(1.0, &samples).expect("wrap should be accepted");
        assert_eq!(packet.mag[0], -4090.0);
    }

    #[test]
    fn mag_packet_carries_last_sample() {
        let samples = [[10i16, 11, 12, 13], [20, 21, 22, 23], [30, 31, 32, 33]];
        let packet = MPacket::from_samples(2.0, &samples).unwrap();
        assert_eq!(packet.mag, Vector3::new(13.0, 23.0, 33.0));
    }
}
