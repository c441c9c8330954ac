//! INS/GPS post-processor command line driver
//!
//! Reads a decoded packet log, fuses it through the `navfuse` pipeline, and
//! writes the navigation table. The binary page framing of the logger is
//! handled by the companion decoder; this tool consumes its CSV packet
//! export, one packet per row:
//!
//! ```text
//! A,<itow>,<ch0>..<ch7>,<temp>          raw inertial counts (accel x3, gyro x3 per the calibration channel map)
//! G,<itow>,<lat_deg>,<lon_deg>,<h_m>,<v_n>,<v_e>,<v_d>,<sigma_2d>,<sigma_h>,<sigma_v>[,<lx>,<ly>,<lz>]
//! M,<itow>,<x0..x3>,<y0..y3>,<z0..z3>   four magnetic samples per axis, counts
//! T,<itow>[,<week>[,<leap_sec>]]
//! ```
//!
//! Options mirror the pipeline configuration keys; a TOML file given with
//! `--config` supplies defaults that individual flags override. The
//! process exits 0 on success and -1 on unusable configuration or a
//! malformed stream, keeping any output already written.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};

use navfuse::calib::ImuCalibration;
use navfuse::messages::{APacket, GPacket, GpsSolution, MPacket, Packet, TimePacket};
use navfuse::scheduler::{self, AttitudeMode, Config, GpsTimeBound, SyncMode};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Loosely-coupled INS/GPS post-processor for logger packet streams",
    rename_all = "snake_case"
)]
struct Cli {
    /// Input packet log (CSV), or '-' for standard input
    input: PathBuf,

    /// Output file (standard output when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// TOML configuration file supplying defaults for the options below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start of the processing window: "<itow>" or "<week>:<itow>"
    #[arg(long)]
    start_gpst: Option<String>,

    /// End of the processing window: "<itow>" or "<week>:<itow>"
    #[arg(long)]
    end_gpst: Option<String>,

    /// Emit rows at time updates
    #[arg(long)]
    dump_update: Option<bool>,

    /// Emit rows at measurement updates
    #[arg(long)]
    dump_correct: Option<bool>,

    /// Append one-sigma columns
    #[arg(long)]
    dump_stddev: Option<bool>,

    /// Calendar time stamps, with an optional UTC hour offset
    #[arg(long, num_args = 0..=1, default_missing_value = "0", require_equals = true)]
    calendar_time: Option<i32>,

    /// Initial attitude in degrees: "yaw[,pitch[,roll]]"
    #[arg(long)]
    init_attitude_deg: Option<String>,

    /// Initial true heading in degrees
    #[arg(long)]
    init_yaw_deg: Option<f64>,

    /// Estimate accelerometer/gyro bias drift
    #[arg(long)]
    est_bias: Option<bool>,

    /// Use the UD-factorized Kalman filter
    #[arg(long)]
    use_udkf: Option<bool>,

    /// Use the precise Earth gravity model
    #[arg(long)]
    use_egm: Option<bool>,

    /// Smooth previously time-updated states (exclusive with --realtime)
    #[arg(long)]
    back_propagate: bool,

    /// Smoothing depth in seconds
    #[arg(long)]
    bp_depth: Option<f64>,

    /// Process without sorting, deferring late GPS corrections
    #[arg(long)]
    realtime: bool,

    /// Initial measurement update threshold for the GPS 2D error, m
    #[arg(long)]
    gps_init_acc_2d: Option<f64>,

    /// Initial measurement update threshold for the GPS vertical error, m
    #[arg(long)]
    gps_init_acc_v: Option<f64>,

    /// Continual measurement update threshold for the GPS 2D error, m
    #[arg(long)]
    gps_cont_acc_2d: Option<f64>,

    /// Use the magnetic sensor stream
    #[arg(long)]
    use_magnet: Option<bool>,

    /// Magnetic heading accuracy, degrees
    #[arg(long)]
    mag_heading_accuracy_deg: Option<f64>,

    /// Apply magnetic yaw compensation below this ground speed, m/s
    /// (non-positive disables)
    #[arg(long)]
    yaw_correct_with_mag_when_speed_less_than_ms: Option<f64>,

    /// IMU calibration file
    #[arg(long)]
    calib_file: Option<PathBuf>,

    /// Antenna lever arm in body coordinates: "x,y,z" in meters
    #[arg(long)]
    lever_arm: Option<String>,

    /// Subtract the spurious second after 1 PPS resynchronization
    #[arg(long)]
    reduce_1pps_sync_error: Option<bool>,

    /// Sort buffer high watermark (drain half when reached)
    #[arg(long)]
    sort_buffer_depth: Option<usize>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_gps_time(spec: &str) -> Result<GpsTimeBound> {
    match spec.split_once(':') {
        Some((week, itow)) => Ok(GpsTimeBound {
            week: Some(week.parse().context("bad GPS week")?),
            itow: itow.parse().context("bad GPS time of week")?,
        }),
        None => Ok(GpsTimeBound {
            week: None,
            itow: spec.parse().context("bad GPS time of week")?,
        }),
    }
}

fn parse_vector3(spec: &str) -> Result<[f64; 3]> {
    let parts: Vec<f64> = spec
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .context("expected three comma-separated numbers")?;
    if parts.len() != 3 {
        bail!("expected three comma-separated numbers, got {}", parts.len());
    }
    Ok([parts[0], parts[1], parts[2]])
}

/// Build the pipeline configuration: file defaults, then flag overrides.
fn build_config(cli: &Cli, calibration: &ImuCalibration) -> Result<Config> {
    let mut config: Config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            // Unknown or malformed keys are configuration errors and stop
            // the run before any processing.
            toml::from_str(&text)
                .with_context(|| format!("configuration error in {}", path.display()))?
        }
        None => Config::default(),
    };

    if cli.back_propagate && cli.realtime {
        bail!("--back_propagate and --realtime are mutually exclusive");
    }
    if cli.back_propagate {
        config.sync = SyncMode::BackPropagate;
    }
    if cli.realtime {
        config.sync = SyncMode::RealTime;
    }

    if let Some(spec) = &cli.start_gpst {
        config.start_gpst = Some(parse_gps_time(spec)?);
    }
    if let Some(spec) = &cli.end_gpst {
        config.end_gpst = Some(parse_gps_time(spec)?);
    }
    if let Some(value) = cli.dump_update {
        config.dump_update = value;
    }
    if let Some(value) = cli.dump_correct {
        config.dump_correct = value;
    }
    if let Some(value) = cli.dump_stddev {
        config.dump_stddev = value;
    }
    if let Some(offset) = cli.calendar_time {
        config.calendar_time = true;
        config.calendar_time_offset_hr = offset;
    }
    if let Some(spec) = &cli.init_attitude_deg {
        let parts: Vec<f64> = spec
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .context("bad --init_attitude_deg")?;
        if parts.is_empty() || parts.len() > 3 {
            bail!("--init_attitude_deg expects 1 to 3 angles");
        }
        for (i, angle) in parts.iter().enumerate() {
            config.init_attitude_deg[i] = *angle;
        }
        config.init_attitude_mode = match parts.len() {
            1 => AttitudeMode::YawOnly,
            2 => AttitudeMode::YawPitch,
            _ => AttitudeMode::FullGiven,
        };
    }
    if let Some(yaw) = cli.init_yaw_deg {
        config.init_attitude_deg[0] = yaw;
        config.init_attitude_mode = config.init_attitude_mode.max(AttitudeMode::YawOnly);
    }
    if let Some(value) = cli.est_bias {
        config.est_bias = value;
    }
    if let Some(value) = cli.use_udkf {
        config.use_udkf = value;
    }
    if let Some(value) = cli.use_egm {
        config.use_egm = value;
    }
    if let Some(depth) = cli.bp_depth {
        config.bp_depth = depth;
    }
    if let Some(value) = cli.gps_init_acc_2d {
        config.gps_init_acc_2d = value;
    }
    if let Some(value) = cli.gps_init_acc_v {
        config.gps_init_acc_v = value;
    }
    if let Some(value) = cli.gps_cont_acc_2d {
        config.gps_cont_acc_2d = value;
    }
    if let Some(value) = cli.use_magnet {
        config.use_magnet = value;
    }
    if let Some(value) = cli.mag_heading_accuracy_deg {
        config.mag_heading_accuracy_deg = value;
    }
    if let Some(value) = cli.yaw_correct_with_mag_when_speed_less_than_ms {
        config.yaw_correct_with_mag_when_speed_less_than_ms = value;
    }
    if let Some(spec) = &cli.lever_arm {
        config.lever_arm = Some(parse_vector3(spec).context("bad --lever_arm")?);
    }
    if let Some(value) = cli.reduce_1pps_sync_error {
        config.reduce_1pps_sync_error = value;
    }
    if let Some(depth) = cli.sort_buffer_depth {
        config.sort_buffer_high = depth;
        config.sort_buffer_low = (depth / 2).max(1);
    }

    config.sigma_accel = calibration.sigma_accel().into();
    config.sigma_gyro = calibration.sigma_gyro().into();
    Ok(config)
}

fn load_calibration(cli: &Cli) -> Result<ImuCalibration> {
    let mut calibration = ImuCalibration::default();
    if let Some(path) = &cli.calib_file {
        info!("reading IMU calibration {}", path.display());
        let file =
            File::open(path).with_context(|| format!("opening {}", path.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            calibration
                .apply_line(&line)
                .with_context(|| format!("in calibration file {}", path.display()))?;
        }
    }
    Ok(calibration)
}

/// Decode the CSV packet export into pipeline packets. Magnetic pages that
/// fail the outlier check are dropped here, matching the page decoder.
fn decode_packets<R: Read>(
    reader: R,
    calibration: &ImuCalibration,
) -> Result<Vec<Packet>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut packets = Vec::new();
    let mut dropped_mag = 0u64;
    for (index, record) in csv_reader.records().enumerate() {
        let record = record.with_context(|| format!("packet log row {}", index + 1))?;
        let row = index + 1;
        let field = |i: usize| -> Result<f64> {
            record
                .get(i)
                .with_context(|| format!("row {}: missing field {}", row, i))?
                .parse::<f64>()
                .with_context(|| format!("row {}: bad numeric field {}", row, i))
        };
        let kind = record
            .get(0)
            .with_context(|| format!("row {}: empty record", row))?;
        let itow = field(1)?;
        match kind {
            "A" => {
                if record.len() < 11 {
                    bail!("row {}: A packet needs 9 channel fields", row);
                }
                let mut channels = [0.0f64; 9];
                for (i, channel) in channels.iter_mut().enumerate() {
                    *channel = field(2 + i)?;
                }
                packets.push(Packet::Accel(APacket {
                    itow,
                    accel: calibration.raw_to_accel(&channels),
                    omega: calibration.raw_to_omega(&channels),
                }));
            }
            "G" => {
                if record.len() < 11 {
                    bail!("row {}: G packet needs 9 solution fields", row);
                }
                let lever_arm = if record.len() >= 14 {
                    Some(nalgebra::Vector3::new(field(11)?, field(12)?, field(13)?))
                } else {
                    None
                };
                packets.push(Packet::Gps(GPacket {
                    itow,
                    solution: GpsSolution {
                        latitude: field(2)?.to_radians(),
                        longitude: field(3)?.to_radians(),
                        height: field(4)?,
                        v_north: field(5)?,
                        v_east: field(6)?,
                        v_down: field(7)?,
                        sigma_2d: field(8)?,
                        sigma_height: field(9)?,
                        sigma_vel: field(10)?,
                    },
                    lever_arm,
                }));
            }
            "M" => {
                if record.len() < 14 {
                    bail!("row {}: M packet needs 12 sample fields", row);
                }
                let mut samples = [[0i16; 4]; 3];
                for axis in 0..3 {
                    for sample in 0..4 {
                        samples[axis][sample] = field(2 + axis * 4 + sample)? as i16;
                    }
                }
                match MPacket::from_samples(itow, &samples) {
                    Some(packet) => packets.push(Packet::Mag(packet)),
                    None => dropped_mag += 1,
                }
            }
            "T" => {
                let week = record
                    .get(2)
                    .filter(|v| !v.is_empty())
                    .map(|v| v.parse::<i32>())
                    .transpose()
                    .with_context(|| format!("row {}: bad week number", row))?;
                let leap_seconds = record
                    .get(3)
                    .filter(|v| !v.is_empty())
                    .map(|v| v.parse::<i32>())
                    .transpose()
                    .with_context(|| format!("row {}: bad leap second count", row))?;
                packets.push(Packet::Time(TimePacket {
                    itow,
                    week,
                    leap_seconds,
                }));
            }
            other => bail!("row {}: unknown packet kind {:?}", row, other),
        }
    }
    if dropped_mag > 0 {
        info!("dropped {} magnetic pages as outliers", dropped_mag);
    }
    Ok(packets)
}

fn process(cli: &Cli) -> Result<()> {
    let calibration = load_calibration(cli)?;
    let config = build_config(cli, &calibration)?;

    let packets = if cli.input.as_os_str() == "-" {
        decode_packets(io::stdin().lock(), &calibration)?
    } else {
        let file = File::open(&cli.input)
            .with_context(|| format!("opening {}", cli.input.display()))?;
        decode_packets(BufReader::new(file), &calibration)?
    };
    if packets.is_empty() {
        warn!("no packets decoded from {}", cli.input.display());
    }

    let summary = match &cli.output {
        Some(path) => {
            let out = File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            scheduler::run(config, packets, io::BufWriter::new(out))?
        }
        None => {
            let stdout = io::stdout();
            scheduler::run(config, packets, io::BufWriter::new(stdout.lock()))?
        }
    };
    info!(
        "done: {} packets, {} time updates, {} measurement updates",
        summary.packets, summary.time_updates, summary.measurement_updates
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_level.clone()),
    )
    .format_timestamp(None)
    .init();

    if let Err(err) = process(&cli) {
        error!("{:#}", err);
        let _ = io::stderr().flush();
        std::process::exit(-1);
    }
}
