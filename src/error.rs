// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the dispatcher core.
//!
//! Each failing subsystem gets its own variant set rather than one
//! crate-wide enum, so call sites can match on exactly the failures they
//! can recover from.

use thiserror::Error;

/// Failures from the message bus abstraction.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("bus operation timed out")]
    Timeout,

    #[error("malformed record on {0}: {1}")]
    MalformedRecord(String, String),

    #[error("bus configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// Transient errors get a local retry with backoff; everything else is
    /// either fatal at startup or a drop-and-log at the record level.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::Timeout)
    }
}

/// Configuration load/validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("calibration CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures surfaced by historical query handling.
#[derive(Debug, Error)]
pub enum HistoricalError {
    #[error("bus error during historical scan: {0}")]
    Bus(#[from] BusError),

    #[error("requested window exceeds retention: {requested}s > {retention}s")]
    WindowTooLarge { requested: u64, retention: u64 },
}

/// Top-level dispatcher error, used by `main` and component bootstrapping.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("http server error: {0}")]
    Server(#[from] std::io::Error),
}
