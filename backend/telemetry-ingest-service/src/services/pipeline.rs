//! Poll → parse → write → commit loop
//!
//! The bus position is committed only after the storage cluster acknowledged
//! the batch built from the same poll. Malformed messages are dropped and
//! their positions are committed together with the valid readings of the
//! batch. A failed write leaves the position untouched and stops the
//! pipeline so the batch is redelivered after a restart.

use std::fmt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::source::{BatchSource, RawMessage};
use super::storage::{StorageBackend, StorageWriter};
use crate::config::PipelineConfig;
use crate::error::{Result, StorageError};
use crate::metrics::IngestMetrics;
use crate::models::SensorReading;

/// Bytes of a malformed payload echoed into the warning
const RAW_PREVIEW_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Connecting,
    Running,
    Stopping,
}

impl PipelineState {
    pub fn as_gauge(&self) -> i64 {
        match self {
            PipelineState::Stopped => 0,
            PipelineState::Connecting => 1,
            PipelineState::Running => 2,
            PipelineState::Stopping => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Connecting => "connecting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one iteration did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IterationOutcome {
    pub polled: usize,
    pub malformed: usize,
    pub written: usize,
    pub committed: bool,
}

pub struct Pipeline<S: BatchSource, B: StorageBackend> {
    source: S,
    writer: StorageWriter<B>,
    config: PipelineConfig,
    metrics: IngestMetrics,
    state: watch::Sender<PipelineState>,
}

impl<S: BatchSource, B: StorageBackend> Pipeline<S, B> {
    pub fn new(
        source: S,
        writer: StorageWriter<B>,
        config: PipelineConfig,
        metrics: IngestMetrics,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Stopped);
        metrics
            .pipeline_state
            .set(PipelineState::Stopped.as_gauge());

        Self {
            source,
            writer,
            config,
            metrics,
            state,
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn writer(&self) -> &StorageWriter<B> {
        &self.writer
    }

    fn set_state(&self, next: PipelineState) {
        let previous = self.state.send_replace(next);
        self.metrics.pipeline_state.set(next.as_gauge());
        if previous != next {
            info!(from = %previous, to = %next, "Pipeline state changed");
        }
    }

    /// Connect, then process batches until `shutdown` turns `true` or a batch
    /// write fails.
    ///
    /// Returns `Ok(())` on a requested shutdown, including one that arrives
    /// while the storage connection is still being retried. An iteration that
    /// already started writing always completes its write and commit first.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.set_state(PipelineState::Connecting);

        match self.writer.connect(shutdown.clone()).await {
            Ok(()) => {}
            Err(StorageError::ConnectCancelled) => {
                info!("Shutdown requested before storage connection was established");
                self.set_state(PipelineState::Stopping);
                self.teardown().await;
                self.set_state(PipelineState::Stopped);
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "Giving up on storage connection");
                self.set_state(PipelineState::Stopping);
                self.teardown().await;
                self.set_state(PipelineState::Stopped);
                return Err(e.into());
            }
        }

        if let Err(e) = self.source.start().await {
            error!(error = %e, "Failed to start source reader");
            self.set_state(PipelineState::Stopping);
            self.teardown().await;
            self.set_state(PipelineState::Stopped);
            return Err(e.into());
        }

        self.set_state(PipelineState::Running);
        let result = self.process_until_shutdown(&mut shutdown).await;

        self.set_state(PipelineState::Stopping);
        self.teardown().await;
        self.set_state(PipelineState::Stopped);
        result
    }

    async fn process_until_shutdown(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, leaving processing loop");
                return Ok(());
            }

            // Nothing is written or committed while polling, so a pending poll
            // can be abandoned.
            let messages = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => {
                    debug!("Shutdown requested during poll, abandoning it");
                    return Ok(());
                }
                polled = self
                    .source
                    .poll_batch(self.config.poll_timeout, self.config.batch_size) => polled?,
            };

            self.process_batch(messages).await?;
        }
    }

    /// Run a single poll → parse → write → commit iteration
    pub async fn run_once(&mut self) -> Result<IterationOutcome> {
        let messages = self
            .source
            .poll_batch(self.config.poll_timeout, self.config.batch_size)
            .await?;
        self.process_batch(messages).await
    }

    async fn process_batch(&mut self, messages: Vec<RawMessage>) -> Result<IterationOutcome> {
        let mut outcome = IterationOutcome {
            polled: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            return Ok(outcome);
        }
        self.metrics
            .messages_polled_total
            .inc_by(messages.len() as u64);

        let mut readings = Vec::with_capacity(messages.len());
        for message in &messages {
            match SensorReading::parse(message.payload_bytes()) {
                Ok(reading) => readings.push(reading),
                Err(e) => {
                    outcome.malformed += 1;
                    self.metrics.malformed_messages_total.inc();
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        raw = %raw_preview(message.payload_bytes()),
                        "Skipping malformed message"
                    );
                }
            }
        }

        if readings.is_empty() {
            debug!(
                malformed = outcome.malformed,
                "No valid readings in batch, nothing to write"
            );
            return Ok(outcome);
        }

        if let Err(e) = self.writer.write_batch(&readings).await {
            if e.is_write_failure() {
                error!(
                    records = readings.len(),
                    error = %e,
                    "Batch write failed, position not committed"
                );
            } else {
                error!(
                    records = readings.len(),
                    error = %e,
                    "Storage not usable, position not committed"
                );
            }
            return Err(e.into());
        }
        outcome.written = readings.len();

        match self.source.commit().await {
            Ok(()) => {
                outcome.committed = true;
                self.metrics.commits_total.inc();
            }
            // Already written; a redelivery only rewrites the same rows
            Err(e) => warn!(error = %e, "Commit failed after successful write"),
        }

        debug!(
            polled = outcome.polled,
            written = outcome.written,
            malformed = outcome.malformed,
            "Batch processed"
        );
        Ok(outcome)
    }

    /// Stop the source without committing and release the storage session
    async fn teardown(&mut self) {
        if let Err(e) = self.source.stop().await {
            warn!(error = %e, "Failed to stop source reader cleanly");
        }
        self.writer.close();
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone: shutdown can no longer be requested
            std::future::pending::<()>().await;
        }
    }
}

fn raw_preview(payload: &[u8]) -> String {
    let end = payload.len().min(RAW_PREVIEW_BYTES);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}
