//! Domain error taxonomy (spec §7).
//!
//! Workers catch these at the top of their loop, log with context via
//! `tracing`, and continue — only migration failures are fatal to the
//! process (see `store::Store::migrate`).

use thiserror::Error;

/// Errors raised by the Modbus transport and the sensor drivers built on it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bus error: {0}")]
    Bus(String),

    #[error("modbus frame timeout")]
    Timeout,

    #[error("device did not respond")]
    DeviceAbsent,

    #[error("modbus exception response: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether this kind of failure should flip a device's sticky presence
    /// bit to "absent" (persistent I/O errors only — see spec §4.1).
    pub fn marks_absent(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Bus(_))
    }
}

/// Errors from the Measurement Store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration {version} checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        version: String,
        expected: String,
        found: String,
    },

    #[error("migration file name is not a valid versioned script: {0}")]
    BadMigrationName(String),
}

/// Errors from the weather client.
#[derive(Debug, Error)]
pub enum WeatherFetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response shape: {0}")]
    BadShape(String),

    #[error("io error persisting raw response: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from configuration/settings parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid MM-DD value: {0:?}")]
    BadMonthDay(String),

    #[error("invalid timezone offset: {0:?}")]
    BadTimezone(String),

    #[error("invalid setting value for {key}: {reason}")]
    BadValue { key: &'static str, reason: String },
}
