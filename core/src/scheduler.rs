//! Packet fusion pipeline: ordering, initialization, gating, sequencing
//!
//! The scheduler turns the interleaved packet streams into filter calls.
//! In the offline and back-propagation modes packets pass through a sort
//! buffer first: insertion is unsorted, and once the buffer reaches its
//! high watermark it is stably sorted by week-aware time of week and the
//! oldest packets are drained into the filter (the watermark must exceed
//! the worst inter-sensor delay; the default 512/256 covers GPS output
//! delays of several seconds at typical IMU rates, and both marks are
//! configurable). The real-time mode never sorts and feeds packets as
//! they arrive, leaning on the filter's deferred-correction support.
//!
//! Around the filter the scheduler owns the stationary initialization
//! (mean-accelerometer attitude plus optional magnetic heading), the GPS
//! quality gates, the elapsed-time bookkeeping with the discontinuity
//! guard, lever-arm compensation, magnetic yaw updates at low ground
//! speed, the short magnetic-sample interpolation ring, the optional
//! 1 PPS correction, and the processing time window.
//!
//! All pipeline state lives in [`Processor`], created and consumed by
//! [`run`]; there are no globals.

use std::collections::VecDeque;
use std::io::Write;

use log::{debug, info};
use nalgebra::Vector3;
use serde::Deserialize;
use thiserror::Error;

use crate::filter::{
    BackPropagateFilter, FilterError, FilterSetup, InsGps, RealTimeFilter,
};
use crate::ins::GravityModel;
use crate::magnet;
use crate::messages::{interval_rollover, APacket, GPacket, MPacket, Packet, TimePacket};
use crate::output::{NavWriter, OutputConfig, RowMode, TimeStampMode};

/// Time updates with an interval outside `(0, 10)` seconds are skipped.
const INTERVAL_THRESHOLD: f64 = 10.0;
/// A packets required in the buffer before static initialization (one when
/// the attitude is fully given).
const MIN_A_PACKETS_FOR_INIT: usize = 0x10;
/// A packets averaged for the lever-arm body rate.
const PACKETS_FOR_OMEGA_MEAN: usize = 0x10;
/// Depth of the recent magnetic sample ring.
const RECENT_M_DEPTH: usize = 0x10;
/// Extrapolation weight beyond which interpolation clamps to the nearest
/// sample.
const MAG_EXTRAPOLATION_LIMIT: f64 = 3.0;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("filter failure at itow {itow:.3}: {source}")]
    Filter {
        itow: f64,
        #[source]
        source: FilterError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the scheduler synchronizes GPS corrections with the inertial
/// stream. The modes are mutually exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Sort everything, correct at the fix time.
    #[default]
    Offline,
    /// Offline plus the fixed-interval smoother over recent states.
    BackPropagate,
    /// Never sort; defer late corrections.
    RealTime,
}

/// How much of the initial attitude the user supplied; the rest comes from
/// the stationary assumption and (for yaw) the magnetic model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttitudeMode {
    #[default]
    NotGiven,
    YawOnly,
    YawPitch,
    FullGiven,
}

/// A GPS time bound, optionally pinned to a week number.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpsTimeBound {
    pub week: Option<i32>,
    pub itow: f64,
}

/// Whole-run configuration. Field names match the stable option keys of
/// the command-line surface. Unknown keys in a configuration file are
/// rejected, not ignored.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Restrict processing to GPS times at or after this bound.
    pub start_gpst: Option<GpsTimeBound>,
    /// Stop processing at this bound.
    pub end_gpst: Option<GpsTimeBound>,

    pub dump_update: bool,
    pub dump_correct: bool,
    pub dump_stddev: bool,
    /// Calendar time stamps instead of time of week.
    pub calendar_time: bool,
    /// UTC hour offset for calendar stamps.
    pub calendar_time_offset_hr: i32,

    pub est_bias: bool,
    pub use_udkf: bool,
    pub use_egm: bool,
    pub sync: SyncMode,
    /// Smoothing window of the back-propagation mode, s.
    pub bp_depth: f64,
    /// How long the real-time mode keeps an unabsorbed correction, s.
    pub rt_pending_horizon: f64,

    pub gps_init_acc_2d: f64,
    pub gps_init_acc_v: f64,
    pub gps_cont_acc_2d: f64,

    pub use_magnet: bool,
    pub mag_heading_accuracy_deg: f64,
    pub yaw_correct_with_mag_when_speed_less_than_ms: f64,

    /// Initial attitude override, degrees (yaw, pitch, roll).
    pub init_attitude_deg: [f64; 3],
    pub init_attitude_mode: AttitudeMode,

    /// Subtract one second from A/M stamps that jump ahead by `[1, 2)` s.
    pub reduce_1pps_sync_error: bool,
    /// Antenna lever arm in body coordinates for G packets that carry
    /// none, m.
    pub lever_arm: Option<[f64; 3]>,

    pub sort_buffer_high: usize,
    pub sort_buffer_low: usize,

    /// Accelerometer noise (1 sigma per axis) from calibration.
    pub sigma_accel: [f64; 3],
    /// Gyro noise (1 sigma per axis) from calibration.
    pub sigma_gyro: [f64; 3],
}

impl Default for Config {
    fn default() -> Self {
        Config {
            start_gpst: None,
            end_gpst: None,
            dump_update: true,
            dump_correct: false,
            dump_stddev: false,
            calendar_time: false,
            calendar_time_offset_hr: 0,
            est_bias: true,
            use_udkf: false,
            use_egm: false,
            sync: SyncMode::default(),
            bp_depth: 1.0,
            rt_pending_horizon: 1.0,
            gps_init_acc_2d: 20.0,
            gps_init_acc_v: 10.0,
            gps_cont_acc_2d: 100.0,
            use_magnet: false,
            mag_heading_accuracy_deg: 3.0,
            yaw_correct_with_mag_when_speed_less_than_ms: 5.0,
            init_attitude_deg: [0.0; 3],
            init_attitude_mode: AttitudeMode::default(),
            reduce_1pps_sync_error: false,
            lever_arm: None,
            sort_buffer_high: 0x200,
            sort_buffer_low: 0x100,
            sigma_accel: [0.05; 3],
            sigma_gyro: [5e-3; 3],
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sort_buffer_low == 0 || self.sort_buffer_low > self.sort_buffer_high {
            return Err(PipelineError::Config(format!(
                "sort buffer watermarks {}/{} are inconsistent",
                self.sort_buffer_high, self.sort_buffer_low
            )));
        }
        if self.sync == SyncMode::BackPropagate && self.bp_depth <= 0.0 {
            return Err(PipelineError::Config(
                "bp_depth must be positive in back-propagation mode".to_string(),
            ));
        }
        Ok(())
    }

    fn filter_setup(&self) -> FilterSetup {
        FilterSetup {
            est_bias: self.est_bias,
            use_udkf: self.use_udkf,
            gravity: if self.use_egm {
                GravityModel::Precise
            } else {
                GravityModel::Wgs84
            },
            sigma_accel: Vector3::from_row_slice(&self.sigma_accel),
            sigma_gyro: Vector3::from_row_slice(&self.sigma_gyro),
            ..FilterSetup::default()
        }
    }

    fn output_config(&self) -> OutputConfig {
        OutputConfig {
            dump_update: self.dump_update,
            dump_correct: self.dump_correct,
            dump_stddev: self.dump_stddev,
            est_bias: self.est_bias,
            time_stamp: if self.calendar_time {
                TimeStampMode::Calendar {
                    utc_offset_hr: self.calendar_time_offset_hr,
                }
            } else {
                TimeStampMode::Itow
            },
        }
    }
}

/// Totals reported after a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunSummary {
    pub packets: u64,
    pub time_updates: u64,
    pub measurement_updates: u64,
    pub dropped_gps: u64,
    pub skipped_time_updates: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Status {
    Uninitialized,
    JustInitialized,
    TimeUpdated,
    MeasurementUpdated,
}

enum NavVariant {
    Offline(InsGps),
    BackPropagate(BackPropagateFilter),
    RealTime(RealTimeFilter),
}

impl NavVariant {
    fn inner(&self) -> &InsGps {
        match self {
            NavVariant::Offline(f) => f,
            NavVariant::BackPropagate(f) => &f.inner,
            NavVariant::RealTime(f) => &f.inner,
        }
    }

    fn inner_mut(&mut self) -> &mut InsGps {
        match self {
            NavVariant::Offline(f) => f,
            NavVariant::BackPropagate(f) => &mut f.inner,
            NavVariant::RealTime(f) => &mut f.inner,
        }
    }
}

/// The running pipeline: filter variant, packet buffers, and output.
pub struct Processor<W: Write> {
    config: Config,
    nav: NavVariant,
    writer: NavWriter<W>,
    pool: VecDeque<Packet>,
    status: Status,
    recent_a: VecDeque<APacket>,
    recent_m: VecDeque<MPacket>,
    min_a_packets_for_init: usize,
    /// Stamp of the previous A/M packet (after adjustment) for the 1 PPS
    /// correction.
    last_raw_a_itow: Option<f64>,
    last_raw_m_itow: Option<f64>,
    /// Time of the state the filter currently holds.
    filter_itow: f64,
    week: Option<i32>,
    after_end: bool,
    summary: RunSummary,
}

impl<W: Write> Processor<W> {
    pub fn new(config: Config, out: W) -> Result<Self, PipelineError> {
        config.validate()?;
        let inner = InsGps::new(&config.filter_setup());
        let nav = match config.sync {
            SyncMode::Offline => NavVariant::Offline(inner),
            SyncMode::BackPropagate => {
                NavVariant::BackPropagate(BackPropagateFilter::new(inner, config.bp_depth))
            }
            SyncMode::RealTime => {
                NavVariant::RealTime(RealTimeFilter::new(inner, config.rt_pending_horizon))
            }
        };
        let min_a_packets_for_init = if config.init_attitude_mode == AttitudeMode::FullGiven {
            1
        } else {
            MIN_A_PACKETS_FOR_INIT
        };
        let writer = NavWriter::new(out, config.output_config());
        Ok(Processor {
            config,
            nav,
            writer,
            pool: VecDeque::new(),
            status: Status::Uninitialized,
            recent_a: VecDeque::new(),
            recent_m: VecDeque::new(),
            min_a_packets_for_init,
            last_raw_a_itow: None,
            last_raw_m_itow: None,
            filter_itow: 0.0,
            week: None,
            after_end: false,
            summary: RunSummary::default(),
        })
    }

    pub fn write_header(&mut self) -> Result<(), PipelineError> {
        self.writer.write_header()?;
        Ok(())
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    /// Feed one decoded packet. Returns `false` once the end of the
    /// processing window has been reached.
    pub fn ingest(&mut self, mut packet: Packet) -> Result<bool, PipelineError> {
        if self.after_end {
            return Ok(false);
        }
        self.summary.packets += 1;
        self.adjust_1pps(&mut packet);
        match self.window_check(packet.itow()) {
            WindowCheck::Before => return Ok(true),
            WindowCheck::After => {
                self.after_end = true;
                return Ok(false);
            }
            WindowCheck::In => {}
        }
        if self.config.sync == SyncMode::RealTime {
            self.apply(&packet)?;
            return Ok(true);
        }
        self.pool.push_back(packet);
        if self.pool.len() >= self.config.sort_buffer_high {
            self.sort_and_apply(self.config.sort_buffer_low)?;
        }
        Ok(true)
    }

    /// Drain everything still buffered. Call once at end of stream.
    pub fn finish(&mut self) -> Result<(), PipelineError> {
        self.sort_and_apply(self.pool.len())?;
        info!(
            "processed {} packets: {} time updates ({} skipped), {} measurement updates, {} GPS fixes dropped",
            self.summary.packets,
            self.summary.time_updates,
            self.summary.skipped_time_updates,
            self.summary.measurement_updates,
            self.summary.dropped_gps
        );
        Ok(())
    }

    /// Subtract the spurious extra second some pages carry right after a
    /// 1 PPS resynchronization.
    fn adjust_1pps(&mut self, packet: &mut Packet) {
        if !self.config.reduce_1pps_sync_error {
            return;
        }
        match packet {
            Packet::Accel(a) => {
                if let Some(prev) = self.last_raw_a_itow {
                    let delta = a.itow - prev;
                    if (1.0..2.0).contains(&delta) {
                        a.itow -= 1.0;
                    }
                }
                self.last_raw_a_itow = Some(a.itow);
            }
            Packet::Mag(m) => {
                if let Some(prev) = self.last_raw_m_itow {
                    let delta = m.itow - prev;
                    if (1.0..2.0).contains(&delta) {
                        m.itow -= 1.0;
                    }
                }
                self.last_raw_m_itow = Some(m.itow);
            }
            _ => {}
        }
    }

    fn window_check(&self, itow: f64) -> WindowCheck {
        if let Some(start) = &self.config.start_gpst {
            if !self.bound_reached(start, itow) {
                return WindowCheck::Before;
            }
        }
        if let Some(end) = &self.config.end_gpst {
            if self.bound_passed(end, itow) {
                return WindowCheck::After;
            }
        }
        WindowCheck::In
    }

    fn bound_reached(&self, bound: &GpsTimeBound, itow: f64) -> bool {
        match (bound.week, self.week) {
            (Some(bound_week), Some(week)) if bound_week != week => bound_week < week,
            _ => interval_rollover(bound.itow, itow) >= 0.0,
        }
    }

    fn bound_passed(&self, bound: &GpsTimeBound, itow: f64) -> bool {
        match (bound.week, self.week) {
            (Some(bound_week), Some(week)) if bound_week != week => bound_week < week,
            _ => interval_rollover(bound.itow, itow) > 0.0,
        }
    }

    fn sort_and_apply(&mut self, count: usize) -> Result<(), PipelineError> {
        let mut pool: Vec<Packet> = self.pool.drain(..).collect();
        pool.sort_by(|a, b| {
            if a.before(b) {
                std::cmp::Ordering::Less
            } else if b.before(a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        let mut drained = pool.into_iter();
        for _ in 0..count {
            match drained.next() {
                Some(packet) => self.apply(&packet)?,
                None => break,
            }
        }
        self.pool = drained.collect();
        Ok(())
    }

    fn apply(&mut self, packet: &Packet) -> Result<(), PipelineError> {
        match packet {
            Packet::Accel(a) => self.handle_a(a),
            Packet::Gps(g) => self.handle_g(g),
            Packet::Mag(m) => {
                if self.recent_m.len() >= RECENT_M_DEPTH {
                    self.recent_m.pop_front();
                }
                self.recent_m.push_back(*m);
                Ok(())
            }
            Packet::Time(t) => {
                self.handle_time(t);
                Ok(())
            }
        }
    }

    fn handle_time(&mut self, packet: &TimePacket) {
        if packet.week.is_some() {
            self.week = packet.week;
        }
        self.writer.calendar.update(packet);
    }

    fn handle_a(&mut self, packet: &APacket) -> Result<(), PipelineError> {
        if self.status >= Status::JustInitialized {
            let previous_itow = self
                .recent_a
                .back()
                .expect("initialized with a non-empty A buffer")
                .itow;
            let dt = interval_rollover(previous_itow, packet.itow);
            let did_update = self.time_update(packet, dt)?;
            if did_update && self.config.sync != SyncMode::BackPropagate {
                self.emit_current(RowMode::TimeUpdate, packet.itow)?;
            }
        }
        if self.recent_a.len() >= self.recent_a_capacity() {
            self.recent_a.pop_front();
        }
        self.recent_a.push_back(*packet);
        Ok(())
    }

    fn recent_a_capacity(&self) -> usize {
        self.min_a_packets_for_init.max(0x100)
    }

    /// Advance the filter by `dt` using one inertial packet, honoring the
    /// discontinuity guard. Returns whether an update actually ran.
    fn time_update(&mut self, packet: &APacket, dt: f64) -> Result<bool, PipelineError> {
        if dt <= 0.0 || dt >= INTERVAL_THRESHOLD {
            self.summary.skipped_time_updates += 1;
            debug!("skipping time update with dt {:.3} at itow {:.3}", dt, packet.itow);
            return Ok(false);
        }
        let corrected_in_step = match &mut self.nav {
            NavVariant::Offline(f) => {
                f.update(&packet.accel, &packet.omega, dt)
                    .map_err(|source| PipelineError::Filter {
                        itow: packet.itow,
                        source,
                    })?;
                false
            }
            NavVariant::BackPropagate(f) => {
                f.update(&packet.accel, &packet.omega, dt)
                    .map_err(|source| PipelineError::Filter {
                        itow: packet.itow,
                        source,
                    })?;
                false
            }
            NavVariant::RealTime(f) => f
                .update(&packet.accel, &packet.omega, dt)
                .map_err(|source| PipelineError::Filter {
                    itow: packet.itow,
                    source,
                })?,
        };
        if corrected_in_step {
            self.summary.measurement_updates += 1;
        }
        self.filter_itow = packet.itow;
        self.summary.time_updates += 1;
        if self.status >= Status::JustInitialized {
            self.status = Status::TimeUpdated;
        }
        Ok(true)
    }

    fn handle_g(&mut self, packet: &GPacket) -> Result<(), PipelineError> {
        if packet.solution.sigma_2d >= self.config.gps_cont_acc_2d {
            self.summary.dropped_gps += 1;
            debug!(
                "dropping GPS fix at itow {:.3}: sigma_2d {:.1} m over threshold",
                packet.itow, packet.solution.sigma_2d
            );
            return Ok(());
        }
        if self.status >= Status::JustInitialized {
            self.measurement_update(packet)?;
        } else {
            self.try_initialize(packet)?;
        }
        Ok(())
    }

    fn measurement_update(&mut self, packet: &GPacket) -> Result<(), PipelineError> {
        debug!("measurement update at itow {:.3}", packet.itow);
        let last_a = *self
            .recent_a
            .back()
            .expect("initialized with a non-empty A buffer");
        let advance = interval_rollover(last_a.itow, packet.itow);
        let lever = self.lever_data(packet);
        let wrap = |itow: f64| {
            move |source: FilterError| PipelineError::Filter { itow, source }
        };

        let mut applied_now = true;
        match &mut self.nav {
            NavVariant::Offline(f) => {
                // Sorted stream: the fix is (slightly) ahead of the last
                // inertial packet, so advance up to it first.
                if advance > 0.0 && advance < INTERVAL_THRESHOLD {
                    f.update(&last_a.accel, &last_a.omega, advance)
                        .map_err(wrap(packet.itow))?;
                    self.filter_itow = packet.itow;
                }
                match &lever {
                    Some((arm, omega)) => f
                        .correct_with_lever_arm(&packet.solution, arm, omega)
                        .map_err(wrap(packet.itow))?,
                    None => f.correct(&packet.solution).map_err(wrap(packet.itow))?,
                };
            }
            NavVariant::BackPropagate(f) => {
                if advance > 0.0 && advance < INTERVAL_THRESHOLD {
                    f.update(&last_a.accel, &last_a.omega, advance)
                        .map_err(wrap(packet.itow))?;
                    self.filter_itow = packet.itow;
                }
                f.correct(&packet.solution, lever.as_ref().map(|(a, o)| (a, o)))
                    .map_err(wrap(packet.itow))?;
            }
            NavVariant::RealTime(f) => {
                applied_now = f
                    .correct(&packet.solution, lever, advance)
                    .map_err(wrap(packet.itow))?;
            }
        }
        if applied_now {
            self.summary.measurement_updates += 1;
        }
        self.status = Status::MeasurementUpdated;

        self.magnetic_yaw_update(packet)?;
        self.emit_after_correction(packet.itow)?;
        Ok(())
    }

    fn lever_data(&self, packet: &GPacket) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let arm = packet
            .lever_arm
            .or_else(|| self.config.lever_arm.map(|arm| Vector3::from_row_slice(&arm)))?;
        Some((arm, self.mean_omega_near(packet.itow)))
    }

    /// Mean body rate over the inertial packets nearest the given time.
    fn mean_omega_near(&self, itow: f64) -> Vector3<f64> {
        if self.recent_a.is_empty() {
            return Vector3::zeros();
        }
        let first_after = self
            .recent_a
            .iter()
            .position(|a| interval_rollover(itow, a.itow) >= 0.0)
            .unwrap_or(self.recent_a.len());
        let start = first_after.saturating_sub(PACKETS_FOR_OMEGA_MEAN / 2);
        let mut sum = Vector3::zeros();
        let mut count = 0usize;
        for a in self.recent_a.iter().skip(start).take(PACKETS_FOR_OMEGA_MEAN) {
            sum += a.omega;
            count += 1;
        }
        sum / count.max(1) as f64
    }

    /// Interpolated magnetic sample at the given time, with the
    /// extrapolation clamp.
    fn mag_at(&self, itow: f64) -> Vector3<f64> {
        if self.recent_m.len() < 2 {
            return self
                .recent_m
                .back()
                .map(|m| m.mag)
                .unwrap_or_else(Vector3::x);
        }
        let first_after = self
            .recent_m
            .iter()
            .position(|m| interval_rollover(itow, m.itow) >= 0.0)
            .unwrap_or(self.recent_m.len());
        let index = first_after.clamp(1, self.recent_m.len() - 1);
        let before = &self.recent_m[index - 1];
        let after = &self.recent_m[index];
        let span = after.itow - before.itow;
        if span <= 0.0 {
            return after.mag;
        }
        let mut weight_before = (after.itow - itow) / span;
        let mut weight_after = 1.0 - weight_before;
        if weight_before > MAG_EXTRAPOLATION_LIMIT {
            weight_before = 1.0;
            weight_after = 0.0;
        } else if weight_after > MAG_EXTRAPOLATION_LIMIT {
            weight_after = 1.0;
            weight_before = 0.0;
        }
        before.mag * weight_before + after.mag * weight_after
    }

    /// Magnetic yaw compensation after a fix, only below the ground-speed
    /// threshold (heading observability from GPS velocity is poor exactly
    /// when the vehicle is slow).
    fn magnetic_yaw_update(&mut self, packet: &GPacket) -> Result<(), PipelineError> {
        let threshold = self.config.yaw_correct_with_mag_when_speed_less_than_ms;
        if !self.config.use_magnet || self.recent_m.is_empty() || threshold <= 0.0 {
            return Ok(());
        }
        let speed_sq =
            packet.solution.v_north.powi(2) + packet.solution.v_east.powi(2);
        if speed_sq >= threshold.powi(2) {
            return Ok(());
        }
        let mag = self.mag_at(packet.itow);
        let date = magnet::model_date(self.week, packet.itow);
        let ins = &self.nav.inner().ins;
        let delta_yaw = match magnet::mag_delta_yaw(
            &mag,
            &ins.attitude,
            ins.latitude,
            ins.longitude,
            ins.altitude,
            date,
        ) {
            Some(delta) => delta,
            None => {
                debug!("magnetic model unavailable at itow {:.3}", packet.itow);
                return Ok(());
            }
        };
        let sigma = self.config.mag_heading_accuracy_deg.to_radians();
        self.nav
            .inner_mut()
            .correct_yaw(delta_yaw, sigma)
            .map_err(|source| PipelineError::Filter {
                itow: packet.itow,
                source,
            })?;
        Ok(())
    }

    fn try_initialize(&mut self, packet: &GPacket) -> Result<(), PipelineError> {
        let solution = &packet.solution;
        if self.recent_a.len() < self.min_a_packets_for_init {
            return Ok(());
        }
        let first_a = self.recent_a.front().expect("buffer checked non-empty");
        // The A buffer and the fix must overlap in time before the
        // stationary averages mean anything.
        if (first_a.itow - packet.itow).abs() >= 0.1 * self.recent_a.len() as f64 {
            return Ok(());
        }
        if solution.sigma_2d > self.config.gps_init_acc_2d
            || solution.sigma_height > self.config.gps_init_acc_v
        {
            return Ok(());
        }

        let mode = self.config.init_attitude_mode;
        let mut yaw = self.config.init_attitude_deg[0].to_radians();
        let mut pitch = self.config.init_attitude_deg[1].to_radians();
        let mut roll = self.config.init_attitude_deg[2].to_radians();
        if mode < AttitudeMode::FullGiven {
            let mut mean_accel = Vector3::zeros();
            for a in &self.recent_a {
                mean_accel += a.accel;
            }
            mean_accel /= self.recent_a.len() as f64;
            let (roll_est, pitch_est) = crate::ins::attitude_from_gravity(&mean_accel);
            roll = roll_est;
            if mode < AttitudeMode::YawPitch {
                pitch = pitch_est;
                if mode < AttitudeMode::YawOnly
                    && self.config.use_magnet
                    && !self.recent_m.is_empty()
                {
                    let date = magnet::model_date(self.week, packet.itow);
                    if let Some(magnetic_heading) = magnet::mag_yaw(
                        &self.mag_at(packet.itow),
                        pitch,
                        roll,
                        solution.latitude,
                        solution.longitude,
                        solution.height,
                        date,
                    ) {
                        yaw = magnetic_heading;
                    }
                }
            }
        }

        info!(
            "filter initialized at itow {:.3}; attitude (yaw, pitch, roll) deg: {:.2}, {:.2}, {:.2}",
            packet.itow,
            yaw.to_degrees(),
            pitch.to_degrees(),
            roll.to_degrees()
        );

        {
            let inner = self.nav.inner_mut();
            inner
                .ins
                .init_position(solution.latitude, solution.longitude, solution.height);
            inner
                .ins
                .init_velocity(solution.v_north, solution.v_east, solution.v_down);
            inner.ins.init_attitude(yaw, pitch, roll);
        }
        self.filter_itow = packet.itow;
        self.status = Status::JustInitialized;

        // Replay the buffered inertial packets newer than the fix so the
        // filter catches up to the head of the stream.
        let replay: Vec<APacket> = {
            let start = self
                .recent_a
                .iter()
                .rposition(|a| interval_rollover(packet.itow, a.itow) <= 0.0)
                .map_or(0, |i| i + 1);
            self.recent_a.iter().skip(start).cloned().collect()
        };
        let mut previous_itow = packet.itow;
        for a in &replay {
            let dt = interval_rollover(previous_itow, a.itow);
            self.time_update(a, dt)?;
            previous_itow = a.itow;
        }
        self.status = Status::MeasurementUpdated;
        self.summary.measurement_updates += 1;
        self.emit_after_correction(packet.itow)?;
        Ok(())
    }

    /// Emit the rows a correction produces: the smoothed window in
    /// back-propagation mode, a single MU row otherwise.
    fn emit_after_correction(&mut self, itow: f64) -> Result<(), PipelineError> {
        match &self.nav {
            NavVariant::BackPropagate(f) => {
                let head_itow = self.filter_itow.max(itow);
                for snapshot in f.snapshots() {
                    let mode = if snapshot.corrected {
                        RowMode::SmoothedMeasurementUpdate
                    } else {
                        RowMode::SmoothedTimeUpdate
                    };
                    if !self.writer.config().emits(mode) {
                        continue;
                    }
                    let nav = &snapshot.nav;
                    self.writer.write_row(
                        mode,
                        head_itow - snapshot.age,
                        &nav.ins,
                        nav.bias_accel(),
                        nav.bias_gyro(),
                        Some(&nav.sigma()),
                    )?;
                }
                Ok(())
            }
            _ => self.emit_current(RowMode::MeasurementUpdate, itow),
        }
    }

    fn emit_current(&mut self, mode: RowMode, itow: f64) -> Result<(), PipelineError> {
        if !self.writer.config().emits(mode) {
            return Ok(());
        }
        let nav = self.nav.inner();
        self.writer.write_row(
            mode,
            itow,
            &nav.ins,
            nav.bias_accel(),
            nav.bias_gyro(),
            Some(&nav.sigma()),
        )?;
        Ok(())
    }
}

enum WindowCheck {
    Before,
    In,
    After,
}

/// Run the whole pipeline over a decoded packet stream, writing navigation
/// rows to `out`.
pub fn run<I, W>(config: Config, packets: I, out: W) -> Result<RunSummary, PipelineError>
where
    I: IntoIterator<Item = Packet>,
    W: Write,
{
    let mut processor = Processor::new(config, out)?;
    processor.write_header()?;
    for packet in packets {
        if !processor.ingest(packet)? {
            break;
        }
    }
    processor.finish()?;
    Ok(processor.summary())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::earth;
    use crate::messages::GpsSolution;

    fn a_packet(itow: f64) -> Packet {
        Packet::Accel(APacket {
            itow,
            accel: Vector3::new(0.0, 0.0, -earth::gravity_wgs84(0.0, 0.0)),
            omega: Vector3::zeros(),
        })
    }

    fn g_packet(itow: f64, sigma_2d: f64) -> Packet {
        Packet::Gps(GPacket {
            itow,
            solution: GpsSolution {
                sigma_2d,
                sigma_height: 5.0,
                sigma_vel: 0.5,
                ..Default::default()
            },
            lever_arm: None,
        })
    }

    fn stationary_stream(seconds: f64) -> Vec<Packet> {
        let mut packets = Vec::new();
        let steps = (seconds / 0.02) as usize;
        for i in 0..=steps {
            let t = i as f64 * 0.02;
            packets.push(a_packet(t));
            if i % 50 == 0 {
                packets.push(g_packet(t + 0.001, 5.0));
            }
        }
        packets
    }

    #[test]
    fn pipeline_initializes_and_emits_rows() {
        let config = Config {
            dump_correct: true,
            ..Default::default()
        };
        let mut out = Vec::new();
        let summary = run(config, stationary_stream(5.0), &mut out).unwrap();
        assert!(summary.measurement_updates >= 4);
        assert!(summary.time_updates >= 200);
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().next().unwrap().starts_with("mode,itow"));
        assert!(text.lines().any(|line| line.starts_with("TU,")));
        assert!(text.lines().any(|line| line.starts_with("MU,")));
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let misspelled: Result<Config, _> = toml::from_str("gps_init_acc_2dd = 5.0");
        assert!(misspelled.is_err());
        let nested: Result<Config, _> =
            toml::from_str("[start_gpst]\nitow = 1.0\nweeek = 3");
        assert!(nested.is_err());
        let valid: Config = toml::from_str("gps_init_acc_2d = 5.0\nuse_udkf = true").unwrap();
        assert_eq!(valid.gps_init_acc_2d, 5.0);
        assert!(valid.use_udkf);
        // Untouched keys keep their defaults.
        assert_eq!(valid.gps_cont_acc_2d, 100.0);
    }

    #[test]
    fn inaccurate_fixes_are_dropped() {
        let mut packets = stationary_stream(2.0);
        packets.push(g_packet(2.5, 500.0)); // over cont_acc_2d
        let config = Config::default();
        let summary = run(config, packets, Vec::new()).unwrap();
        assert_eq!(summary.dropped_gps, 1);
    }

    #[test]
    fn initialization_requires_accurate_fix() {
        let mut packets = Vec::new();
        for i in 0..100 {
            packets.push(a_packet(i as f64 * 0.02));
        }
        // sigma_2d above the init threshold but below the drop threshold:
        // the fix is admitted to the pipeline but must not initialize it.
        packets.push(g_packet(1.0, 50.0));
        let config = Config {
            dump_correct: true,
            ..Default::default()
        };
        let mut out = Vec::new();
        let summary = run(config, packets, &mut out).unwrap();
        assert_eq!(summary.measurement_updates, 0);
        assert_eq!(summary.dropped_gps, 0);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1); // header only
    }

    #[test]
    fn discontinuity_guard_skips_large_gaps() {
        let mut packets = stationary_stream(2.0);
        packets.push(a_packet(100.0)); // 98 s gap
        packets.push(a_packet(100.02));
        let summary = run(Config::default(), packets, Vec::new()).unwrap();
        assert!(summary.skipped_time_updates >= 1);
    }

    #[test]
    fn sort_buffer_reorders_interleaved_packets() {
        // Feed the GPS fix ahead of the inertial packets that precede it
        // in time; the sort buffer must reorder before applying.
        let mut packets = Vec::new();
        packets.push(g_packet(1.0001, 5.0));
        for i in 0..=100 {
            packets.push(a_packet(i as f64 * 0.02));
        }
        let config = Config {
            dump_correct: true,
            ..Default::default()
        };
        let mut out = Vec::new();
        let summary = run(config, packets, &mut out).unwrap();
        assert_eq!(summary.measurement_updates, 1);
        let text = String::from_utf8(out).unwrap();
        let mu_line = text
            .lines()
            .find(|line| line.starts_with("MU,"))
            .expect("one MU row");
        let mu_itow: f64 = mu_line.split(',').nth(1).unwrap().parse().unwrap();
        // The fix applied at its own time, between the 1.00 and 1.02 A
        // packets.
        assert!(mu_itow > 1.0 && mu_itow < 1.02);
    }

    #[test]
    fn one_pps_correction_pulls_back_stamps() {
        let mut processor = Processor::new(
            Config {
                reduce_1pps_sync_error: true,
                ..Default::default()
            },
            Vec::new(),
        )
        .unwrap();
        let mut first = a_packet(10.00);
        let mut second = a_packet(11.02); // 1.02 s jump: spurious second
        processor.adjust_1pps(&mut first);
        processor.adjust_1pps(&mut second);
        assert_eq!(second.itow(), 10.02);
        let mut third = a_packet(10.04);
        processor.adjust_1pps(&mut third);
        assert_eq!(third.itow(), 10.04);
    }

    #[test]
    fn time_window_limits_processing() {
        let config = Config {
            start_gpst: Some(GpsTimeBound {
                week: None,
                itow: 1.0,
            }),
            end_gpst: Some(GpsTimeBound {
                week: None,
                itow: 3.0,
            }),
            ..Default::default()
        };
        let mut out = Vec::new();
        run(config, stationary_stream(5.0), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        for line in text.lines().skip(1) {
            let itow: f64 = line.split(',').nth(1).unwrap().parse().unwrap();
            assert!((1.0..=3.0).contains(&itow));
        }
    }

    #[test]
    fn realtime_mode_handles_late_fixes() {
        let config = Config {
            sync: SyncMode::RealTime,
            dump_correct: true,
            ..Default::default()
        };
        let mut packets = Vec::new();
        // Warm-up A packets so initialization can happen on the fix.
        for i in 0..=60 {
            packets.push(a_packet(i as f64 * 0.02));
        }
        packets.push(g_packet(1.2, 5.0)); // initializes
        packets.push(a_packet(1.22));
        packets.push(a_packet(1.24));
        // Late fix: behind the newest A packet, absorbed by the next step.
        packets.push(g_packet(1.23, 5.0));
        packets.push(a_packet(1.26));
        let summary = run(config, packets, Vec::new()).unwrap();
        assert!(summary.measurement_updates >= 2);
    }

    #[test]
    fn mag_interpolation_clamps_extrapolation() {
        let mut processor = Processor::new(Config::default(), Vec::new()).unwrap();
        for (itow, value) in [(0.0, 100.0), (1.0, 200.0)] {
            processor.recent_m.push_back(MPacket {
                itow,
                mag: Vector3::new(value, 0.0, 0.0),
            });
        }
        // Interpolation inside the bracket.
        let mid = processor.mag_at(0.5);
        assert!((mid[0] - 150.0).abs() < 1e-9);
        // Far beyond the newest sample: weight would exceed the clamp, so
        // the nearest sample wins.
        let clamped = processor.mag_at(10.0);
        assert!((clamped[0] - 200.0).abs() < 1e-9);
    }
}
