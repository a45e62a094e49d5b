pub mod pipeline;
pub mod source;
pub mod storage;

pub use pipeline::{IterationOutcome, Pipeline, PipelineState};
pub use source::{BatchSource, KafkaSourceReader, PendingOffsets, RawMessage};
pub use storage::{
    provision_schema, Replication, ScyllaBackend, SensorSchema, StorageBackend, StorageSession,
    StorageWriter, WriterOptions, WRITE_CONSISTENCY,
};
