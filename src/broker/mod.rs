//! Broker seam.
//!
//! This module contains:
//! - `TopicAdmin`: topic metadata and creation
//! - `LogProducer`: appending keyed records
//! - `ConsumerSession` / `SessionFactory`: one consumer-group session per owner
//! - Message and position types shared by writer, reader and consumer
//! - Implementations: Kafka (rdkafka), in-memory

use std::time::Duration;

use async_trait::async_trait;

// Implementation modules
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

// Re-exports
#[cfg(feature = "kafka")]
pub use kafka::{KafkaAdmin, KafkaProducer, KafkaSessionFactory};
pub use memory::InMemoryBroker;

use crate::event::LogPosition;

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by broker adapters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("Topic creation failed for '{topic}': {reason}")]
    CreateTopic { topic: String, reason: String },

    #[error("Produce failed: {0}")]
    Produce(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("No offsets to commit")]
    NothingToCommit,

    #[error("Seek failed: {0}")]
    Seek(String),

    #[error("Session is closed")]
    Closed,

    #[error("Fatal broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    /// Whether the session can no longer make progress (e.g. authentication
    /// failure). Consumers stop their loop on fatal errors.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_) | BrokerError::Closed)
    }
}

// ============================================================================
// Types
// ============================================================================

/// Topic creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

impl TopicSpec {
    /// Single partition, replication factor 1.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: 1,
            replication_factor: 1,
        }
    }

    pub fn with_partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_replication_factor(mut self, replication_factor: i32) -> Self {
        self.replication_factor = replication_factor;
        self
    }
}

/// Outcome of a create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Someone else created it first. Not an error.
    AlreadyExists,
}

/// A record on its way to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// Broker acknowledgement of an appended record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A message read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// UTF-8 key. `None` when absent or not valid UTF-8.
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
}

impl LogMessage {
    pub fn position(&self) -> LogPosition {
        LogPosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(&self.topic, self.partition)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A (topic, partition) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// What a single poll produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Message(LogMessage),
    /// The consumer caught up with the end of a partition.
    PartitionEof { topic: String, partition: i32 },
}

/// Where a group without committed offsets starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Parameters for opening a consumer session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub group_id: String,
    pub auto_offset_reset: OffsetReset,
    pub session_timeout: Duration,
    pub max_poll_interval: Duration,
    /// Ask the broker to report end-of-partition.
    pub enable_partition_eof: bool,
}

impl SessionOptions {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            auto_offset_reset: OffsetReset::Earliest,
            session_timeout: Duration::from_secs(10),
            max_poll_interval: Duration::from_secs(300),
            enable_partition_eof: false,
        }
    }

    pub fn with_auto_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn with_partition_eof(mut self, enabled: bool) -> Self {
        self.enable_partition_eof = enabled;
        self
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Topic metadata and creation.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Query broker metadata for `topic`.
    async fn topic_exists(&self, topic: &str) -> Result<bool>;

    /// Create a topic. A concurrent creation by someone else yields
    /// `CreateOutcome::AlreadyExists`, not an error.
    async fn create_topic(&self, spec: &TopicSpec) -> Result<CreateOutcome>;
}

/// Appends records to the log. Safe for concurrent use.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Send one record and wait for the broker acknowledgement.
    async fn send(&self, record: OutboundRecord) -> Result<Delivery>;

    /// Wait for in-flight sends to complete.
    async fn flush(&self, timeout: Duration) -> Result<()>;
}

/// One consumer-group session. Owned by exactly one reader call or runner.
#[async_trait]
pub trait ConsumerSession: Send {
    async fn subscribe(&mut self, topics: &[String]) -> Result<()>;

    /// Wait up to `timeout` for the next message or partition event.
    /// `Ok(None)` means nothing arrived in time.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<PollEvent>>;

    /// Commit the offset following `position`.
    async fn commit(&mut self, position: &LogPosition) -> Result<()> {
        let next = (
            TopicPartition::new(&position.topic, position.partition),
            position.offset + 1,
        );
        self.commit_offsets(&[next]).await
    }

    /// Commit explicit next-to-consume offsets. An empty list fails with
    /// `NothingToCommit`.
    async fn commit_offsets(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()>;

    async fn assignment(&mut self) -> Result<Vec<TopicPartition>>;

    /// Move the fetch position of an assigned partition.
    async fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<()>;

    /// Leave the group and release resources. Further calls fail with `Closed`.
    async fn close(&mut self) -> Result<()>;
}

/// Opens consumer sessions.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self, options: &SessionOptions) -> Result<Box<dyn ConsumerSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_spec_defaults() {
        let spec = TopicSpec::new("accounts");
        assert_eq!(spec.partitions, 1);
        assert_eq!(spec.replication_factor, 1);

        let spec = spec.with_partitions(6).with_replication_factor(3);
        assert_eq!(spec.partitions, 6);
        assert_eq!(spec.replication_factor, 3);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(BrokerError::Fatal("SASL authentication failed".to_string()).is_fatal());
        assert!(BrokerError::Closed.is_fatal());
        assert!(!BrokerError::Consume("timed out".to_string()).is_fatal());
        assert!(!BrokerError::NothingToCommit.is_fatal());
    }

    #[test]
    fn test_log_message_header_lookup() {
        let message = LogMessage {
            topic: "accounts".to_string(),
            partition: 0,
            offset: 4,
            key: Some("AccountOpened".to_string()),
            payload: None,
            headers: vec![("traceparent".to_string(), "00-abc-def-01".to_string())],
        };

        assert_eq!(message.header("traceparent"), Some("00-abc-def-01"));
        assert_eq!(message.header("tracestate"), None);
        assert_eq!(message.position().offset, 4);
    }
}
