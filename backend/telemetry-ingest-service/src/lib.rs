//! Telemetry ingestion service
//!
//! Consumes JSON sensor readings from a Kafka topic and persists them into a
//! Cassandra time-series table with at-least-once delivery: the consumer
//! group position is committed only after the batch built from the same poll
//! has been acknowledged by the cluster.

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{IngestError, Result};
pub use metrics::IngestMetrics;
pub use models::SensorReading;
pub use services::{Pipeline, PipelineState};
