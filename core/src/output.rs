//! Tabular navigation output and GPS-to-calendar time stamping
//!
//! Every filter update can emit one comma-separated row: the update mode
//! (`TU`/`MU`, or `BP_TU`/`BP_MU` from the smoother), a time stamp, the
//! navigation state in output units (degrees for angles), and optionally
//! the bias estimates and one-sigma columns. The time stamp is either the
//! raw GPS time of week or, once a time packet has established the week
//! number, the six calendar fields with an optional UTC hour offset.

use std::io::{self, Write};

use chrono::{Datelike, Timelike};
use nalgebra::Vector3;

use crate::filter::StandardDeviations;
use crate::ins::InsState;
use crate::messages::TimePacket;

/// Unix timestamp of the GPS epoch, 1980-01-06T00:00:00Z.
const GPS_EPOCH_UNIX: i64 = 315_964_800;
/// Leap seconds assumed until a time packet supplies the real count.
const DEFAULT_LEAP_SECONDS: i32 = 18;

/// Row labels for the four update kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowMode {
    TimeUpdate,
    MeasurementUpdate,
    SmoothedTimeUpdate,
    SmoothedMeasurementUpdate,
}

impl RowMode {
    pub fn label(&self) -> &'static str {
        match self {
            RowMode::TimeUpdate => "TU",
            RowMode::MeasurementUpdate => "MU",
            RowMode::SmoothedTimeUpdate => "BP_TU",
            RowMode::SmoothedMeasurementUpdate => "BP_MU",
        }
    }
}

/// Time stamp format selected at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeStampMode {
    /// GPS seconds of week.
    Itow,
    /// Calendar fields, shifted from UTC by a whole number of hours.
    Calendar { utc_offset_hr: i32 },
}

/// Accumulates week number and leap seconds from time packets and converts
/// a time of week into calendar fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct CalendarConverter {
    week: Option<i32>,
    leap_seconds: Option<i32>,
}

impl CalendarConverter {
    pub fn update(&mut self, packet: &TimePacket) {
        if packet.week.is_some() {
            self.week = packet.week;
        }
        if packet.leap_seconds.is_some() {
            self.leap_seconds = packet.leap_seconds;
        }
    }

    pub fn has_week(&self) -> bool {
        self.week.is_some()
    }

    /// Calendar fields `(year, month, day, hour, minute, second)` for a
    /// time of week, or `None` before a week number is known.
    pub fn convert(&self, itow: f64, utc_offset_hr: i32) -> Option<(i32, u32, u32, u32, u32, f64)> {
        let week = self.week?;
        let leap = self.leap_seconds.unwrap_or(DEFAULT_LEAP_SECONDS);
        let gps_seconds = f64::from(week) * crate::messages::ONE_WEEK + itow;
        let utc_seconds =
            GPS_EPOCH_UNIX as f64 + gps_seconds - f64::from(leap) + f64::from(utc_offset_hr) * 3600.0;
        let whole = utc_seconds.floor();
        let frac = utc_seconds - whole;
        let stamp = chrono::DateTime::from_timestamp(whole as i64, 0)?;
        Some((
            stamp.year(),
            stamp.month(),
            stamp.day(),
            stamp.hour(),
            stamp.minute(),
            f64::from(stamp.second()) + frac,
        ))
    }
}

/// Which rows to emit and with which columns.
#[derive(Clone, Copy, Debug)]
pub struct OutputConfig {
    /// Emit rows at time updates.
    pub dump_update: bool,
    /// Emit rows at measurement updates.
    pub dump_correct: bool,
    /// Append the one-sigma columns.
    pub dump_stddev: bool,
    /// Append the bias estimate columns.
    pub est_bias: bool,
    pub time_stamp: TimeStampMode,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dump_update: true,
            dump_correct: false,
            dump_stddev: false,
            est_bias: true,
            time_stamp: TimeStampMode::Itow,
        }
    }
}

impl OutputConfig {
    /// Whether rows of this mode are emitted at all.
    pub fn emits(&self, mode: RowMode) -> bool {
        match mode {
            RowMode::TimeUpdate | RowMode::SmoothedTimeUpdate => self.dump_update,
            RowMode::MeasurementUpdate | RowMode::SmoothedMeasurementUpdate => self.dump_correct,
        }
    }
}

/// Comma-separated navigation row writer.
pub struct NavWriter<W: Write> {
    out: W,
    config: OutputConfig,
    pub calendar: CalendarConverter,
}

impl<W: Write> NavWriter<W> {
    pub fn new(out: W, config: OutputConfig) -> Self {
        NavWriter {
            out,
            config,
            calendar: CalendarConverter::default(),
        }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn write_header(&mut self) -> io::Result<()> {
        write!(self.out, "mode,")?;
        match self.config.time_stamp {
            TimeStampMode::Itow => write!(self.out, "itow")?,
            TimeStampMode::Calendar { .. } => write!(self.out, "year,month,day,hour,min,sec")?,
        }
        write!(
            self.out,
            ",lat_deg,lon_deg,h_m,v_n_ms,v_e_ms,v_d_ms,heading_deg,pitch_deg,roll_deg"
        )?;
        if self.config.est_bias {
            write!(
                self.out,
                ",bias_ax,bias_ay,bias_az,bias_gx,bias_gy,bias_gz"
            )?;
        }
        if self.config.dump_stddev {
            write!(
                self.out,
                ",s1_lat_deg,s1_lon_deg,s1_h_m,s1_v_n_ms,s1_v_e_ms,s1_v_d_ms,s1_heading_deg,s1_pitch_deg,s1_roll_deg"
            )?;
            if self.config.est_bias {
                write!(
                    self.out,
                    ",s1_bias_ax,s1_bias_ay,s1_bias_az,s1_bias_gx,s1_bias_gy,s1_bias_gz"
                )?;
            }
        }
        writeln!(self.out)
    }

    fn write_time_stamp(&mut self, itow: f64) -> io::Result<()> {
        match self.config.time_stamp {
            TimeStampMode::Itow => write!(self.out, "{:.4}", itow),
            TimeStampMode::Calendar { utc_offset_hr } => {
                match self.calendar.convert(itow, utc_offset_hr) {
                    Some((year, month, day, hour, minute, second)) => write!(
                        self.out,
                        "{},{},{},{},{},{:.4}",
                        year, month, day, hour, minute, second
                    ),
                    // Without a resolved week number the seconds field
                    // carries the raw time of week.
                    None => write!(self.out, "0,0,0,0,0,{:.4}", itow),
                }
            }
        }
    }

    /// Emit one row; the caller has already decided the row should appear.
    pub fn write_row(
        &mut self,
        mode: RowMode,
        itow: f64,
        state: &InsState,
        bias_accel: Vector3<f64>,
        bias_gyro: Vector3<f64>,
        sigma: Option<&StandardDeviations>,
    ) -> io::Result<()> {
        write!(self.out, "{},", mode.label())?;
        self.write_time_stamp(itow)?;
        write!(
            self.out,
            ",{:.9},{:.9},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4}",
            state.latitude.to_degrees(),
            state.longitude.to_degrees(),
            state.altitude,
            state.velocity_north,
            state.velocity_east,
            state.velocity_down,
            state.heading().to_degrees(),
            state.pitch().to_degrees(),
            state.roll().to_degrees(),
        )?;
        if self.config.est_bias {
            write!(
                self.out,
                ",{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
                bias_accel[0], bias_accel[1], bias_accel[2], bias_gyro[0], bias_gyro[1], bias_gyro[2]
            )?;
        }
        if self.config.dump_stddev {
            let sigma = sigma.copied().unwrap_or_default();
            write!(
                self.out,
                ",{:.9},{:.9},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4}",
                sigma.latitude_rad.to_degrees(),
                sigma.longitude_rad.to_degrees(),
                sigma.height_m,
                sigma.v_north_ms,
                sigma.v_east_ms,
                sigma.v_down_ms,
                sigma.heading_rad.to_degrees(),
                sigma.pitch_rad.to_degrees(),
                sigma.roll_rad.to_degrees(),
            )?;
            if self.config.est_bias {
                let ba = sigma.bias_accel.unwrap_or_else(Vector3::zeros);
                let bg = sigma.bias_gyro.unwrap_or_else(Vector3::zeros);
                write!(
                    self.out,
                    ",{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
                    ba[0], ba[1], ba[2], bg[0], bg[1], bg[2]
                )?;
            }
        }
        writeln!(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn calendar_conversion_needs_a_week() {
        let mut converter = CalendarConverter::default();
        assert!(converter.convert(0.0, 0).is_none());
        converter.update(&TimePacket {
            itow: 0.0,
            week: Some(0),
            leap_seconds: Some(0),
        });
        let (year, month, day, hour, minute, second) = converter.convert(0.0, 0).unwrap();
        assert_eq!((year, month, day), (1980, 1, 6));
        assert_eq!((hour, minute), (0, 0));
        assert_approx_eq!(second, 0.0, 1e-9);
    }

    #[test]
    fn calendar_applies_leap_and_offset() {
        let mut converter = CalendarConverter::default();
        converter.update(&TimePacket {
            itow: 0.0,
            week: Some(2087),
            leap_seconds: Some(18),
        });
        // Week 2087 starts 2020-01-05 00:00:00 GPS; minus 18 leap seconds.
        let (year, month, day, hour, minute, second) = converter.convert(18.0, 0).unwrap();
        assert_eq!((year, month, day), (2020, 1, 5));
        assert_eq!((hour, minute), (0, 0));
        assert_approx_eq!(second, 0.0, 1e-9);
        // A +1 hour offset moves the clock forward.
        let (_, _, _, hour, _, _) = converter.convert(18.0, 1).unwrap();
        assert_eq!(hour, 1);
    }

    #[test]
    fn header_and_row_shapes_match() {
        let config = OutputConfig {
            dump_stddev: true,
            ..Default::default()
        };
        let mut writer = NavWriter::new(Vec::new(), config);
        writer.write_header().unwrap();
        writer
            .write_row(
                RowMode::TimeUpdate,
                1.5,
                &InsState::default(),
                Vector3::zeros(),
                Vector3::zeros(),
                None,
            )
            .unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        let row = lines.next().unwrap();
        assert_eq!(
            header.split(',').count(),
            row.split(',').count(),
            "header and row column counts differ"
        );
        assert!(row.starts_with("TU,1.5000,"));
    }

    #[test]
    fn emission_gates_follow_config() {
        let config = OutputConfig::default();
        assert!(config.emits(RowMode::TimeUpdate));
        assert!(config.emits(RowMode::SmoothedTimeUpdate));
        assert!(!config.emits(RowMode::MeasurementUpdate));
        assert!(!config.emits(RowMode::SmoothedMeasurementUpdate));
    }
}
