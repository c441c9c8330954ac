//! Raw-count to physical-unit sensor calibration
//!
//! The logger records accelerometer and gyro channels as raw ADC integers.
//! Each three-axis sensor is calibrated with a bias base vector, a bias
//! temperature-coefficient vector, per-axis scale factors, and a 3x3
//! misalignment matrix:
//!
//! ```text
//! calibrated = A * diag(1/s) * (raw - (b0 + b_tc * T))
//! ```
//!
//! The per-axis output noise sigma rides along as calibration metadata and
//! seeds the filter's input-noise diagonal. Defaults match the MPU-6000
//! family at 8 g / 2000 dps full scale with mid-scale bias and identity
//! misalignment.

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibError {
    #[error("unknown calibration parameter: {0}")]
    UnknownKey(String),
    #[error("calibration parameter {0} expects {1} numeric values")]
    BadValue(String, usize),
}

/// Calibration of one three-axis sensor.
#[derive(Clone, Debug)]
pub struct SensorTriad {
    /// Bias at the reference temperature, raw counts.
    pub bias_base: Vector3<f64>,
    /// Bias temperature coefficient, counts per count of the temperature
    /// channel.
    pub bias_tc: Vector3<f64>,
    /// Scale factors, counts per physical unit.
    pub scale: Vector3<f64>,
    /// Misalignment / cross-coupling matrix.
    pub misalignment: Matrix3<f64>,
    /// Output noise standard deviation per axis, physical units.
    pub sigma: Vector3<f64>,
}

impl SensorTriad {
    fn new(bias: f64, scale: f64, sigma: f64) -> Self {
        SensorTriad {
            bias_base: Vector3::repeat(bias),
            bias_tc: Vector3::zeros(),
            scale: Vector3::repeat(scale),
            misalignment: Matrix3::identity(),
            sigma: Vector3::repeat(sigma),
        }
    }

    /// Apply bias, scale, and misalignment to a raw sample.
    pub fn calibrate(&self, raw: &Vector3<f64>, temperature: f64) -> Vector3<f64> {
        let bias = self.bias_base + self.bias_tc * temperature;
        let scaled = (raw - bias).component_div(&self.scale);
        self.misalignment * scaled
    }
}

/// Full IMU calibration: channel layout plus the two sensor triads.
#[derive(Clone, Debug)]
pub struct ImuCalibration {
    /// First channel of the accelerometer triple in the raw record.
    pub index_base: usize,
    /// Channel carrying the temperature reading.
    pub index_temp: usize,
    pub accel: SensorTriad,
    pub gyro: SensorTriad,
}

impl Default for ImuCalibration {
    /// MPU-6000/9250 defaults: mid-scale bias, 8 g and 2000 dps full scale,
    /// no temperature or misalignment compensation.
    fn default() -> Self {
        ImuCalibration {
            index_base: 0,
            index_temp: 8,
            // (1<<15)/(8*9.80665) counts per m/s^2
            accel: SensorTriad::new(32768.0, 4.1767576e+2, 0.05),
            // (1<<15)/(2000/180*pi) counts per rad/s
            gyro: SensorTriad::new(32768.0, 9.3873405e+2, 5e-3),
        }
    }
}

impl ImuCalibration {
    /// Acceleration in m/s^2 from a raw channel record.
    pub fn raw_to_accel(&self, channels: &[f64]) -> Vector3<f64> {
        let raw = Vector3::new(
            channels[self.index_base],
            channels[self.index_base + 1],
            channels[self.index_base + 2],
        );
        self.accel.calibrate(&raw, channels[self.index_temp])
    }

    /// Angular rate in rad/s from a raw channel record.
    pub fn raw_to_omega(&self, channels: &[f64]) -> Vector3<f64> {
        let raw = Vector3::new(
            channels[self.index_base + 3],
            channels[self.index_base + 4],
            channels[self.index_base + 5],
        );
        self.gyro.calibrate(&raw, channels[self.index_temp])
    }

    pub fn sigma_accel(&self) -> Vector3<f64> {
        self.accel.sigma
    }

    pub fn sigma_gyro(&self) -> Vector3<f64> {
        self.gyro.sigma
    }

    /// Consume one `key value...` line of a calibration file.
    ///
    /// Recognized keys follow the logger's convention: `index_base`,
    /// `index_temp_ch`, `acc_bias`, `acc_bias_tc`, `acc_sf`, `acc_mis`,
    /// `gyro_bias`, `gyro_bias_tc`, `gyro_sf`, `gyro_mis`, `sigma_accel`,
    /// and `sigma_gyro`. Blank lines and `#` comments are accepted.
    pub fn apply_line(&mut self, line: &str) -> Result<(), CalibError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or("");
        let values: Vec<f64> = parts.filter_map(|v| v.parse().ok()).collect();

        let parse3 = |values: &[f64], key: &str| -> Result<Vector3<f64>, CalibError> {
            if values.len() != 3 {
                return Err(CalibError::BadValue(key.to_string(), 3));
            }
            Ok(Vector3::new(values[0], values[1], values[2]))
        };
        let parse9 = |values: &[f64], key: &str| -> Result<Matrix3<f64>, CalibError> {
            if values.len() != 9 {
                return Err(CalibError::BadValue(key.to_string(), 9));
            }
            Ok(Matrix3::from_row_slice(values))
        };

        match key {
            "index_base" => {
                if values.len() != 1 {
                    return Err(CalibError::BadValue(key.to_string(), 1));
                }
                self.index_base = values[0] as usize;
            }
            "index_temp_ch" => {
                if values.len() != 1 {
                    return Err(CalibError::BadValue(key.to_string(), 1));
                }
                self.index_temp = values[0] as usize;
            }
            "acc_bias" => self.accel.bias_base = parse3(&values, key)?,
            "acc_bias_tc" => self.accel.bias_tc = parse3(&values, key)?,
            "acc_sf" => self.accel.scale = parse3(&values, key)?,
            "acc_mis" => self.accel.misalignment = parse9(&values, key)?,
            "gyro_bias" => self.gyro.bias_base = parse3(&values, key)?,
            "gyro_bias_tc" => self.gyro.bias_tc = parse3(&values, key)?,
            "gyro_sf" => self.gyro.scale = parse3(&values, key)?,
            "gyro_mis" => self.gyro.misalignment = parse9(&values, key)?,
            "sigma_accel" => self.accel.sigma = parse3(&values, key)?,
            "sigma_gyro" => self.gyro.sigma = parse3(&values, key)?,
            _ => return Err(CalibError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Parse a whole calibration file.
    pub fn from_lines<'a, I: IntoIterator<Item = &'a str>>(lines: I) -> Result<Self, CalibError> {
        let mut calibration = ImuCalibration::default();
        for line in lines {
            calibration.apply_line(line)?;
        }
        Ok(calibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn default_calibration_maps_midscale_to_zero() {
        let calib = ImuCalibration::default();
        let channels = [32768.0, 32768.0, 32768.0, 32768.0, 32768.0, 32768.0, 0.0, 0.0, 25.0];
        let accel = calib.raw_to_accel(&channels);
        let omega = calib.raw_to_omega(&channels);
        for i in 0..3 {
            assert_approx_eq!(accel[i], 0.0, 1e-12);
            assert_approx_eq!(omega[i], 0.0, 1e-12);
        }
    }

    #[test]
    fn one_g_maps_through_scale_factor() {
        let calib = ImuCalibration::default();
        let one_g_counts = 32768.0 + 4.1767576e+2 * 9.80665;
        let channels = [32768.0, 32768.0, one_g_counts, 32768.0, 32768.0, 32768.0, 0.0, 0.0, 25.0];
        let accel = calib.raw_to_accel(&channels);
        assert_approx_eq!(accel[2], 9.80665, 1e-9);
    }

    #[test]
    fn temperature_compensation_shifts_bias() {
        let mut triad = SensorTriad::new(100.0, 1.0, 0.0);
        triad.bias_tc = Vector3::new(2.0, 0.0, 0.0);
        let raw = Vector3::new(110.0, 100.0, 100.0);
        // At T = 5 the x bias becomes 110, cancelling the raw reading.
        let out = triad.calibrate(&raw, 5.0);
        assert_approx_eq!(out[0], 0.0, 1e-12);
    }

    #[test]
    fn misalignment_mixes_axes() {
        let mut triad = SensorTriad::new(0.0, 1.0, 0.0);
        triad.misalignment = Matrix3::new(
            0.0, 1.0, 0.0, //
            1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0,
        );
        let out = triad.calibrate(&Vector3::new(1.0, 2.0, 3.0), 0.0);
        assert_eq!(out, Vector3::new(2.0, 1.0, 3.0));
    }

    #[test]
    fn calibration_file_round_trip() {
        let mut calib = ImuCalibration::default();
        calib.apply_line("acc_bias 100 200 300").unwrap();
        calib.apply_line("sigma_gyro 1e-3 1e-3 2e-3").unwrap();
        calib.apply_line("# comment").unwrap();
        assert_eq!(calib.accel.bias_base, Vector3::new(100.0, 200.0, 300.0));
        assert_eq!(calib.gyro.sigma, Vector3::new(1e-3, 1e-3, 2e-3));
        assert!(calib.apply_line("bogus_key 1 2 3").is_err());
        assert!(calib.apply_line("acc_sf 1 2").is_err());
    }
}
