//! Tune the sensorless homing stall threshold for one axis.
//!
//! Run with: cargo run --bin sensorless_tune -- --axes X
//! Dry run:  cargo run --bin sensorless_tune -- --axes X --simulate

use anyhow::{Context, Result};
use clap::Parser;
use gethostname::gethostname;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sensorless_tune::config_loader::{self, TuneSettings};
use sensorless_tune::gcode_connection::KlipperHost;
use sensorless_tune::motion::{LogReporter, Reporter};
use sensorless_tune::simulated_axis::SimulatedAxis;
use sensorless_tune::{Axis, ThresholdTuner, TuningRequest, TuningResult};

/// Sensorless homing threshold tuner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Axis to tune: X or Y
    #[arg(long)]
    axes: String,
    /// Config file (defaults to sensorless_tune.yaml next to Cargo.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Host block to read instead of this machine's hostname
    #[arg(long)]
    host: Option<String>,
    /// Override SERIAL_PORT
    #[arg(long)]
    port: Option<String>,
    /// Override MIN_STALL_TIME (seconds)
    #[arg(long)]
    min_time: Option<f64>,
    /// Override MAX_STALL_TIME (seconds)
    #[arg(long)]
    max_time: Option<f64>,
    /// Print the result as JSON instead of progress lines
    #[arg(long, default_value_t = false)]
    json: bool,
    /// Echo progress on the printer console with RESPOND
    #[arg(long, default_value_t = false)]
    respond: bool,
    /// Run against a simulated axis instead of the printer
    #[arg(long, default_value_t = false)]
    simulate: bool,
    /// Simulated stall time at threshold 0 (seconds)
    #[arg(long, default_value_t = 20.0)]
    sim_base: f64,
    /// Simulated stall time lost per threshold step (seconds)
    #[arg(long, default_value_t = 0.1)]
    sim_slope: f64,
    /// Also write timestamped logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    match log_file {
        Some(path) => {
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!(
                        "{} [{}] {}: {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                        record.level(),
                        record.target(),
                        message
                    ))
                })
                .level(log::LevelFilter::Info)
                .chain(std::io::stderr())
                .chain(fern::log_file(path)?)
                .apply()?;
        }
        None => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        }
    }
    Ok(())
}

fn build_tuner(args: &Args, config_path: &Path, hostname: &str) -> Result<ThresholdTuner> {
    if args.simulate {
        log::info!("Simulating stall time = {} - {} * threshold", args.sim_base, args.sim_slope);
        let sim = SimulatedAxis::linear(args.sim_base, args.sim_slope);
        return Ok(sim.tuner().with_reporter(Box::new(LogReporter::new(!args.json))));
    }

    let mut printer = config_loader::load_printer_settings(config_path, hostname)?;
    if let Some(port) = &args.port {
        printer.port = port.clone();
    }
    let host = KlipperHost::connect(&printer)?;
    let local: Box<dyn Reporter> = Box::new(LogReporter::new(!args.json));
    let reporter: Box<dyn Reporter> = if args.respond {
        let reporters: Vec<Box<dyn Reporter>> = vec![local, Box::new(host.clone())];
        Box::new(reporters)
    } else {
        local
    };

    Ok(ThresholdTuner::new(
        Box::new(host.clone()),
        Box::new(host.clone()),
        Box::new(host.clone()),
        Box::new(host),
        reporter,
    )
    .with_poll_interval(Duration::from_millis(printer.poll_interval_ms))
    .with_feed_rate(printer.feed_rate))
}

fn tune_axis(tuner: &mut ThresholdTuner, axis: Axis, settings: &TuneSettings) -> Result<TuningResult> {
    let result = tuner
        .tune(&TuningRequest::from_settings(axis, settings))
        .context("Tuning failed")?;
    Ok(result)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_deref())?;

    let hostname = args.host.clone()
        .unwrap_or_else(|| gethostname().to_string_lossy().to_string());
    let config_path = args.config.clone().unwrap_or_else(config_loader::default_config_path);

    let mut settings = match config_loader::load_tune_settings(&config_path, &hostname) {
        Ok(settings) => settings,
        Err(e) if args.simulate => {
            log::warn!("{}; simulating with default tuning values", e);
            TuneSettings::default()
        }
        Err(e) => return Err(e),
    };
    if let Some(t) = args.min_time {
        settings.min_stall_time = t;
    }
    if let Some(t) = args.max_time {
        settings.max_stall_time = t;
    }

    // Reject a bad selector before opening the printer link
    let axis: Axis = args.axes.parse()?;

    let mut tuner = build_tuner(&args, &config_path, &hostname)?;
    let result = tune_axis(&mut tuner, axis, &settings)?;

    if args.json {
        let report = serde_json::json!({
            "host": hostname,
            "axis": axis,
            "settings": settings,
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
