// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatcher configuration: CLI flags layered over environment variables,
//! plus calibration table loading.

use crate::error::ConfigError;
use crate::types::{CalibrationTable, StationKey};
use clap::Parser;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Dispatcher Core — real-time EEW waveform and pick fanout.
#[derive(Parser, Debug, Clone)]
#[command(name = "eew-dispatcher")]
#[command(about = "Earthquake early-warning dispatcher core")]
#[command(version)]
pub struct Args {
    /// Optional TOML config file; its values fill in any of the flags
    /// below that aren't set by flag or environment variable.
    #[arg(long)]
    pub config: Option<String>,

    /// Redis host (env REDIS_HOST)
    #[arg(long, default_value_t = env_or("REDIS_HOST", "127.0.0.1"))]
    pub redis_host: String,

    /// Redis port (env REDIS_PORT)
    #[arg(long, default_value_t = env_or("REDIS_PORT", "6379").parse().unwrap_or(6379))]
    pub redis_port: u16,

    /// Redis logical DB index (env REDIS_DB)
    #[arg(long, default_value_t = env_or("REDIS_DB", "0").parse().unwrap_or(0))]
    pub redis_db: i64,

    /// HTTP/WebSocket bind address (env BIND)
    #[arg(short, long, default_value_t = env_or("BIND", "0.0.0.0"))]
    pub bind: String,

    /// HTTP/WebSocket bind port (env PORT)
    #[arg(short, long, default_value_t = env_or("PORT", "5001").parse().unwrap_or(5001))]
    pub port: u16,

    /// Calibration table CSV path (columns: Station,Channel,Constant; env CALIBRATION_PATH)
    #[arg(long, default_value_t = env_or("CALIBRATION_PATH", "calibration.csv"))]
    pub calibration_path: String,

    /// Live window length, seconds (env LIVE_WINDOW_SEC)
    #[arg(long, default_value_t = env_or("LIVE_WINDOW_SEC", "30").parse().unwrap_or(30))]
    pub live_window_sec: u64,

    /// Historical retention / max query window, seconds (env HISTORICAL_RETENTION_SEC)
    #[arg(
        long,
        default_value_t = env_or("HISTORICAL_RETENTION_SEC", "120").parse().unwrap_or(120)
    )]
    pub historical_retention_sec: u64,

    /// Default client display width in pixels, used until the client sets
    /// one (env DEFAULT_DISPLAY_WIDTH_PX)
    #[arg(
        long,
        default_value_t = env_or("DEFAULT_DISPLAY_WIDTH_PX", "1000").parse().unwrap_or(1000)
    )]
    pub default_display_width_px: u32,

    /// Per-client send queue capacity (env CLIENT_QUEUE_CAPACITY)
    #[arg(
        long,
        default_value_t = env_or("CLIENT_QUEUE_CAPACITY", "2000").parse().unwrap_or(2000)
    )]
    pub client_queue_capacity: usize,

    /// Log level (trace, debug, info, warn, error; env LOG_LEVEL)
    #[arg(long, default_value_t = env_or("LOG_LEVEL", "info"))]
    pub log_level: String,
}

/// Optional TOML overlay for [`Args`]' env-backed fields. Every field is
/// optional; a present value becomes that env var before `Args::parse()`
/// resolves its `default_value_t`, so the precedence is flag > real env >
/// config file > built-in default.
#[derive(Debug, Default, serde::Deserialize)]
struct ConfigFile {
    redis_host: Option<String>,
    redis_port: Option<u16>,
    redis_db: Option<i64>,
    bind: Option<String>,
    port: Option<u16>,
    calibration_path: Option<String>,
    live_window_sec: Option<u64>,
    historical_retention_sec: Option<u64>,
    default_display_width_px: Option<u32>,
    client_queue_capacity: Option<usize>,
    log_level: Option<String>,
}

/// Reads `path` as TOML and sets the corresponding env vars for any field
/// present and not already set in the process environment. Call this
/// before [`Args::parse`] so the file acts as a lower-priority layer than
/// both real CLI flags and real env vars.
pub fn apply_config_file(path: &str) -> Result<(), ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_string(),
        source: e,
    })?;
    let file: ConfigFile =
        toml::from_str(&content).map_err(|e| ConfigError::Invalid(e.to_string()))?;

    macro_rules! layer {
        ($env:literal, $field:expr) => {
            if std::env::var($env).is_err() {
                if let Some(v) = $field {
                    std::env::set_var($env, v.to_string());
                }
            }
        };
    }
    layer!("REDIS_HOST", file.redis_host);
    layer!("REDIS_PORT", file.redis_port);
    layer!("REDIS_DB", file.redis_db);
    layer!("BIND", file.bind);
    layer!("PORT", file.port);
    layer!("CALIBRATION_PATH", file.calibration_path);
    layer!("LIVE_WINDOW_SEC", file.live_window_sec);
    layer!("HISTORICAL_RETENTION_SEC", file.historical_retention_sec);
    layer!("DEFAULT_DISPLAY_WIDTH_PX", file.default_display_width_px);
    layer!("CLIENT_QUEUE_CAPACITY", file.client_queue_capacity);
    layer!("LOG_LEVEL", file.log_level);
    Ok(())
}

impl Args {
    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Load the calibration table from a CSV with columns
/// `Station,Channel,Constant[,...]`. A missing file is a warning, not a
/// fatal error — callers fall back to the documented default constant.
pub fn load_calibration_table(path: impl AsRef<Path>) -> CalibrationTable {
    let path = path.as_ref();
    match read_calibration_csv(path) {
        Ok(table) => table,
        Err(e) => {
            warn!(
                "could not load calibration table from {}: {e}; using default constant for all stations",
                path.display()
            );
            CalibrationTable::default()
        }
    }
}

fn read_calibration_csv(path: &Path) -> Result<CalibrationTable, ConfigError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| match e.kind() {
        csv::ErrorKind::Io(_) => ConfigError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
        },
        _ => ConfigError::Csv(e),
    })?;

    let mut constants = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let station = record.get(0).unwrap_or_default().trim();
        let channel = record.get(1).unwrap_or_default().trim();
        let constant: f64 = match record.get(2).and_then(|v| v.trim().parse().ok()) {
            Some(c) => c,
            None => {
                warn!("skipping malformed calibration row: {record:?}");
                continue;
            }
        };
        if station.is_empty() || channel.is_empty() {
            continue;
        }
        constants.insert(StationKey::new(station, channel), constant);
    }

    Ok(CalibrationTable::new(constants))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn redis_url_format() {
        let args = Args {
            config: None,
            redis_host: "redis".into(),
            redis_port: 6379,
            redis_db: 2,
            bind: "0.0.0.0".into(),
            port: 5001,
            calibration_path: "calibration.csv".into(),
            live_window_sec: 30,
            historical_retention_sec: 120,
            default_display_width_px: 1000,
            client_queue_capacity: 2000,
            log_level: "info".into(),
        };
        assert_eq!(args.redis_url(), "redis://redis:6379/2");
        assert_eq!(args.bind_addr(), "0.0.0.0:5001");
    }

    #[test]
    fn missing_calibration_file_falls_back_to_default() {
        let table = load_calibration_table("/nonexistent/path/calibration.csv");
        assert!(table.is_empty());
    }

    #[test]
    fn loads_calibration_csv() {
        let mut file = tempfile_csv();
        writeln!(file, "Station,Channel,Constant").unwrap();
        writeln!(file, "A001,HLZ,1.5e-6").unwrap();
        writeln!(file, "A002,HLZ,2.0e-6").unwrap();
        let path = file.path().to_path_buf();
        let table = read_calibration_csv(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(&StationKey::new("A001", "HLZ")), 1.5e-6);
    }

    fn tempfile_csv() -> tempfile_shim::NamedTempFile {
        tempfile_shim::NamedTempFile::new()
    }

    /// Minimal inline temp-file helper so the test above doesn't pull in an
    /// extra dev-dependency just for one CSV parse test.
    mod tempfile_shim {
        use std::fs::File;
        use std::path::PathBuf;

        pub struct NamedTempFile {
            file: File,
            path: PathBuf,
        }

        impl NamedTempFile {
            pub fn new() -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!(
                    "eew-dispatcher-test-calibration-{}.csv",
                    std::process::id()
                ));
                let file = File::create(&path).unwrap();
                Self { file, path }
            }

            pub fn path(&self) -> &std::path::Path {
                &self.path
            }
        }

        impl std::io::Write for NamedTempFile {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.file.write(buf)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                self.file.flush()
            }
        }

        impl Drop for NamedTempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}
