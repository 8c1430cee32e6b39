//! Error types for each subsystem. Library code returns these; the
//! coordinator and `main` compose them under `anyhow::Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("BLE radio unavailable")]
    TransportUnavailable,
    #[error("device {0} not found after scan")]
    DeviceNotFound(String),
    #[error("characteristic {0} missing on device")]
    CharacteristicMissing(String),
    #[error("connect attempt to {0} timed out")]
    ConnectTimeout(String),
    #[error("btleplug error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("write budget of {0:?} exhausted, falling back to NDJSON")]
    WriteBudgetExhausted(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown MAC referenced in sensor assignment: {0}")]
    UnknownMac(String),
    #[error("duplicate target id in sensor assignments: {0}")]
    DuplicateTarget(u32),
}
