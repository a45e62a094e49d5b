//! Kafka source reader with manual position control
//!
//! Auto-commit is disabled: the group position only moves when the pipeline
//! calls [`BatchSource::commit`] after a batch has been durably written.

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::error::SourceError;

/// One message as returned by the bus, detached from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

impl RawMessage {
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

/// Pull-based consumer with explicit position advancement
#[async_trait]
pub trait BatchSource: Send {
    /// Connect and subscribe
    async fn start(&mut self) -> Result<(), SourceError>;

    /// Return what arrives within `max_wait`, at most `max_records` messages.
    /// May return an empty batch; never blocks past the window.
    async fn poll_batch(
        &mut self,
        max_wait: Duration,
        max_records: usize,
    ) -> Result<Vec<RawMessage>, SourceError>;

    /// Acknowledge every message returned by the polls since the last commit
    async fn commit(&mut self) -> Result<(), SourceError>;

    /// Leave the group and release the client. Does not commit.
    async fn stop(&mut self) -> Result<(), SourceError>;
}

/// Next offset to commit for each topic partition
#[derive(Debug, Default, Clone)]
pub struct PendingOffsets {
    next: BTreeMap<(String, i32), i64>,
}

impl PendingOffsets {
    pub fn record(&mut self, message: &RawMessage) {
        let next = message.offset + 1;
        self.next
            .entry((message.topic.clone(), message.partition))
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.next.get(&(topic.to_string(), partition)).copied()
    }

    pub fn clear(&mut self) {
        self.next.clear();
    }

    /// Forget partitions this member no longer owns
    pub fn revoke(&mut self, partitions: &TopicPartitionList) {
        for elem in partitions.elements() {
            self.next.remove(&(elem.topic().to_string(), elem.partition()));
        }
    }

    pub fn to_partition_list(&self) -> Result<TopicPartitionList, SourceError> {
        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in &self.next {
            tpl.add_partition_offset(topic, *partition, Offset::Offset(*offset))?;
        }
        Ok(tpl)
    }
}

type SharedPending = Arc<Mutex<PendingOffsets>>;

fn lock(pending: &SharedPending) -> MutexGuard<'_, PendingOffsets> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops pending positions of revoked partitions so a later commit never
/// overwrites the new owner's position
pub struct IngestConsumerContext {
    pending: SharedPending,
}

impl ClientContext for IngestConsumerContext {}

impl ConsumerContext for IngestConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "Partitions revoked");
                lock(&self.pending).revoke(partitions);
            }
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "Partitions assigned");
            }
            Rebalance::Error(e) => warn!(error = %e, "Rebalance error"),
        }
    }
}

/// [`BatchSource`] over an rdkafka [`StreamConsumer`]
pub struct KafkaSourceReader {
    config: KafkaConfig,
    consumer: Option<StreamConsumer<IngestConsumerContext>>,
    pending: SharedPending,
}

impl KafkaSourceReader {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            consumer: None,
            pending: SharedPending::default(),
        }
    }

    fn context(&self) -> IngestConsumerContext {
        IngestConsumerContext {
            pending: Arc::clone(&self.pending),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.group_id)
            .set("enable.auto.commit", "false") // Manual commit after durable write
            .set("auto.offset.reset", self.config.auto_offset_reset.as_str())
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            )
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false");
        client
    }
}

#[async_trait]
impl BatchSource for KafkaSourceReader {
    async fn start(&mut self) -> Result<(), SourceError> {
        if self.consumer.is_some() {
            return Ok(());
        }

        let consumer: StreamConsumer<IngestConsumerContext> =
            self.client_config().create_with_context(self.context())?;
        consumer.subscribe(&[self.config.topic.as_str()])?;

        info!(
            brokers = %self.config.brokers,
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            "Kafka source reader subscribed"
        );

        self.consumer = Some(consumer);
        Ok(())
    }

    async fn poll_batch(
        &mut self,
        max_wait: Duration,
        max_records: usize,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let consumer = self.consumer.as_ref().ok_or(SourceError::NotStarted)?;
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut batch = Vec::with_capacity(max_records.min(1024));

        // Wait up to the window for the first message, then only take what is
        // already buffered.
        while batch.len() < max_records {
            let received = if batch.is_empty() {
                match tokio::time::timeout_at(deadline, consumer.recv()).await {
                    Ok(received) => received,
                    Err(_) => break,
                }
            } else {
                match consumer.recv().now_or_never() {
                    Some(received) => received,
                    None => break,
                }
            };

            match received {
                Ok(message) => batch.push(RawMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    payload: message.payload().map(<[u8]>::to_vec),
                }),
                Err(e) => {
                    warn!(error = %e, "Kafka consumer error during poll");
                    if !batch.is_empty() {
                        break;
                    }
                }
            }
        }

        {
            let mut pending = lock(&self.pending);
            for message in &batch {
                pending.record(message);
            }
        }

        if !batch.is_empty() {
            debug!(messages = batch.len(), "Polled batch");
        }
        Ok(batch)
    }

    async fn commit(&mut self) -> Result<(), SourceError> {
        let consumer = self.consumer.as_ref().ok_or(SourceError::NotStarted)?;
        let tpl = {
            let pending = lock(&self.pending);
            if pending.is_empty() {
                return Ok(());
            }
            pending.to_partition_list()?
        };

        // Sync: the pipeline only moves on once the broker stored the position.
        // The call blocks until then, so keep it off the async worker.
        tokio::task::block_in_place(|| consumer.commit(&tpl, CommitMode::Sync))?;

        debug!(partitions = tpl.count(), "Committed consumer position");
        lock(&self.pending).clear();
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SourceError> {
        lock(&self.pending).clear();
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            info!(topic = %self.config.topic, "Kafka source reader stopped");
        }
        Ok(())
    }
}
