/// Configuration for the sensorless tuner
///
/// Single source of truth: sensorless_tune.yaml, with one block per hostname
/// under an OS section (RaspberryPi / Ubuntu / macOS). Tuning scalars fall back
/// to the stock values when a key is absent; the printer link settings fail
/// loudly when required keys are missing.

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Serialize;
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

const OS_SECTIONS: [&str; 3] = ["RaspberryPi", "Ubuntu", "macOS"];

/// Scalars that shape one tuning run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuneSettings {
    pub backtrack_amount: f64,
    pub backtrack_to_mid: f64,
    pub timeout: f64,
    pub min_stall_time: f64,
    pub max_stall_time: f64,
}

impl Default for TuneSettings {
    fn default() -> Self {
        Self {
            backtrack_amount: 5.0,
            backtrack_to_mid: 150.0,
            timeout: 15.0,
            min_stall_time: 1.0,
            max_stall_time: 10.0,
        }
    }
}

/// How to reach and drive the printer host
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterSettings {
    pub port: String,
    pub baud_rate: u32,
    pub homing_command: String,
    pub threshold_field: String,
    pub steppers: Vec<String>,
    pub feed_rate: f64,
    pub poll_interval_ms: u64,
    /// Seconds a homing move may run before the next command gives up waiting
    pub homing_timeout: f64,
}

/// sensorless_tune.yaml next to Cargo.toml
pub fn default_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("sensorless_tune.yaml")
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value> {
    let file = File::open(path)
        .map_err(|e| anyhow!("Missing required sensorless_tune.yaml at {:?}: {}", path, e))?;
    let yaml: serde_yaml::Value = serde_yaml::from_reader(file)
        .with_context(|| format!("Failed to parse {:?}", path))?;
    Ok(yaml)
}

/// Search across known OS sections to find the block for `hostname`
fn find_host_block<'a>(yaml: &'a serde_yaml::Value, hostname: &str) -> Result<&'a serde_yaml::Mapping> {
    for os_key in OS_SECTIONS.iter() {
        if let Some(os_map) = yaml.get(*os_key).and_then(|v| v.as_mapping()) {
            for (k, v) in os_map.iter() {
                if k.as_str() == Some(hostname) {
                    return v
                        .as_mapping()
                        .ok_or_else(|| anyhow!("Host entry for '{}' is not a mapping", hostname));
                }
            }
        }
    }
    Err(anyhow!("No host entry for '{}' in sensorless_tune.yaml", hostname))
}

fn get_f64(block: &serde_yaml::Mapping, key: &str, default: f64) -> Result<f64> {
    match block.get(&serde_yaml::Value::from(key)) {
        None | Some(serde_yaml::Value::Null) => Ok(default),
        Some(v) => v.as_f64().ok_or_else(|| anyhow!("{} must be a number (got {:?})", key, v)),
    }
}

fn get_u64(block: &serde_yaml::Mapping, key: &str, default: u64) -> Result<u64> {
    match block.get(&serde_yaml::Value::from(key)) {
        None | Some(serde_yaml::Value::Null) => Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| anyhow!("{} must be a non-negative integer (got {:?})", key, v)),
    }
}

fn get_string(block: &serde_yaml::Mapping, key: &str) -> Option<String> {
    block.get(&serde_yaml::Value::from(key))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn tune_settings_from_block(block: &serde_yaml::Mapping) -> Result<TuneSettings> {
    let defaults = TuneSettings::default();
    Ok(TuneSettings {
        backtrack_amount: get_f64(block, "BACKTRACK_AMOUNT", defaults.backtrack_amount)?,
        backtrack_to_mid: get_f64(block, "BACKTRACK_TO_MID", defaults.backtrack_to_mid)?,
        timeout: get_f64(block, "TIMEOUT", defaults.timeout)?,
        min_stall_time: get_f64(block, "MIN_STALL_TIME", defaults.min_stall_time)?,
        max_stall_time: get_f64(block, "MAX_STALL_TIME", defaults.max_stall_time)?,
    })
}

fn printer_settings_from_block(block: &serde_yaml::Mapping, hostname: &str) -> Result<PrinterSettings> {
    let port = get_string(block, "SERIAL_PORT")
        .ok_or_else(|| anyhow!("SERIAL_PORT missing for '{}' in sensorless_tune.yaml", hostname))?;

    let baud_rate = get_u64(block, "BAUD_RATE", 250_000)?;
    let baud_rate = u32::try_from(baud_rate)
        .map_err(|_| anyhow!("BAUD_RATE {} out of range for '{}'", baud_rate, hostname))?;

    let steppers = match block.get(&serde_yaml::Value::from("STEPPERS")) {
        None | Some(serde_yaml::Value::Null) => vec!["stepper_x".to_string(), "stepper_y".to_string()],
        Some(v) => {
            let seq = v.as_sequence()
                .ok_or_else(|| anyhow!("STEPPERS must be a list for '{}'", hostname))?;
            let names: Vec<String> = seq.iter()
                .filter_map(|s| s.as_str().map(|s| s.to_string()))
                .collect();
            if names.is_empty() || names.len() != seq.len() {
                return Err(anyhow!("STEPPERS must be a non-empty list of names for '{}'", hostname));
            }
            names
        }
    };

    Ok(PrinterSettings {
        port,
        baud_rate,
        homing_command: get_string(block, "HOMING_COMMAND").unwrap_or_else(|| "G2800".to_string()),
        threshold_field: get_string(block, "THRESHOLD_FIELD").unwrap_or_else(|| "SGTHRS".to_string()),
        steppers,
        feed_rate: get_f64(block, "FEED_RATE", 3000.0)?,
        poll_interval_ms: get_u64(block, "POLL_INTERVAL_MS", 100)?,
        homing_timeout: get_f64(block, "HOMING_TIMEOUT", 60.0)?,
    })
}

pub fn tune_settings_from_str(yaml: &str, hostname: &str) -> Result<TuneSettings> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    tune_settings_from_block(find_host_block(&yaml, hostname)?)
}

pub fn printer_settings_from_str(yaml: &str, hostname: &str) -> Result<PrinterSettings> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    printer_settings_from_block(find_host_block(&yaml, hostname)?, hostname)
}

/// Load tuning scalars for `hostname`
pub fn load_tune_settings(path: &Path, hostname: &str) -> Result<TuneSettings> {
    let yaml = read_yaml(path)?;
    let settings = tune_settings_from_block(find_host_block(&yaml, hostname)?)?;
    log::info!(target: "config_loader", "TuneSettings for {}: {:?}", hostname, settings);
    Ok(settings)
}

/// Load printer link settings for `hostname`.
/// TUNE_SERIAL_PORT (environment or .env) overrides SERIAL_PORT.
pub fn load_printer_settings(path: &Path, hostname: &str) -> Result<PrinterSettings> {
    let _ = dotenv();
    let yaml = read_yaml(path)?;
    let block = find_host_block(&yaml, hostname)?;
    let mut settings = match env::var("TUNE_SERIAL_PORT") {
        Ok(port) => {
            let mut block = block.clone();
            block.insert(serde_yaml::Value::from("SERIAL_PORT"), serde_yaml::Value::from(port));
            printer_settings_from_block(&block, hostname)?
        }
        Err(_) => printer_settings_from_block(block, hostname)?,
    };
    settings.steppers.dedup();
    log::info!(
        target: "config_loader",
        "PrinterSettings for {}: port={} baud={} steppers={:?}",
        hostname, settings.port, settings.baud_rate, settings.steppers
    );
    Ok(settings)
}
