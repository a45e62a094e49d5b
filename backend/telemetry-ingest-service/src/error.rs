use std::time::Duration;
use thiserror::Error;

pub use crate::models::MalformedRecordError;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Top-level error for the ingestion service
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Invalid or missing settings; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Errors raised by the storage writer
#[derive(Debug, Error)]
pub enum StorageError {
    /// Cluster unreachable, or schema provisioning failed during connect
    #[error("Storage connection error: {0}")]
    Connection(String),

    /// Write attempted before a successful connect
    #[error("Storage unavailable: writer is not connected")]
    Unavailable,

    /// Batch rejected or not acknowledged by the cluster
    #[error("Storage write error: {0}")]
    Write(String),

    #[error("Storage write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Connect loop stopped by shutdown before a session was established
    #[error("Storage connect cancelled")]
    ConnectCancelled,
}

impl StorageError {
    /// True for failures of an issued batch (the batch must not be committed)
    pub fn is_write_failure(&self) -> bool {
        matches!(self, StorageError::Write(_) | StorageError::WriteTimeout(_))
    }
}

/// Errors raised by the bus reader
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Source reader used before start()")]
    NotStarted,
}
