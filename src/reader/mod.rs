//! Event reader: ordered replay from the log.
//!
//! Every replay opens a throwaway consumer group (`{prefix}-{uuid}`), waits
//! for its partition assignment, seeks each partition to the requested
//! offset and polls until the log goes quiet or every partition reports
//! end-of-partition. Nothing is committed; the group is abandoned when the
//! session closes.
//!
//! Replays are best effort, not snapshots: events appended while a replay
//! runs may or may not be included.
//!
//! Envelope versions count from the start of the replay, not of the log: a
//! replay after a nonzero position numbers the first event it returns for
//! each aggregate 1.
//!
//! With an admin attached ([`EventReader::with_admin`]) a replay of a topic
//! the broker does not know returns an empty result instead of waiting out
//! the assignment timeout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{
    BrokerError, ConsumerSession, LogMessage, OffsetReset, PollEvent, SessionFactory,
    SessionOptions, TopicAdmin, TopicPartition,
};
use crate::config::ReaderDefaults;
use crate::event::{Event, EventEnvelope};
use crate::registry::EventTypeRegistry;

/// Replay errors.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Failed to open replay session: {0}")]
    Session(#[source] BrokerError),

    #[error("No partitions of '{topic}' assigned within {timeout:?}")]
    AssignmentTimeout { topic: String, timeout: Duration },

    #[error("Replay of '{topic}' failed: {source}")]
    Broker {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

/// Reader settings.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub topic: String,
    /// Wait per poll.
    pub poll_timeout: Duration,
    /// Consecutive empty polls that end a replay.
    pub max_idle_polls: u32,
    /// Bound on waiting for the group to receive partitions.
    pub assignment_timeout: Duration,
    pub group_prefix: String,
}

impl ReaderConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self::from_defaults(topic, &ReaderDefaults::default())
    }

    pub fn from_defaults(topic: impl Into<String>, defaults: &ReaderDefaults) -> Self {
        Self {
            topic: topic.into(),
            poll_timeout: Duration::from_millis(defaults.poll_timeout_ms),
            max_idle_polls: defaults.max_idle_polls.max(1),
            assignment_timeout: Duration::from_millis(defaults.assignment_timeout_ms),
            group_prefix: defaults.group_prefix.clone(),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_idle_polls(mut self, polls: u32) -> Self {
        self.max_idle_polls = polls.max(1);
        self
    }

    pub fn with_assignment_timeout(mut self, timeout: Duration) -> Self {
        self.assignment_timeout = timeout;
        self
    }

    pub fn with_group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.group_prefix = prefix.into();
        self
    }
}

/// Outcome of one replay.
#[derive(Debug, Default)]
pub struct Replay {
    /// Decoded events in log order (per partition).
    pub envelopes: Vec<EventEnvelope>,
    /// Messages skipped because their key or payload could not be decoded.
    pub deserialization_errors: u64,
}

impl Replay {
    pub fn into_events(self) -> Vec<Box<dyn Event>> {
        self.envelopes.into_iter().map(|e| e.event).collect()
    }
}

/// Replays events from one topic.
pub struct EventReader {
    sessions: Arc<dyn SessionFactory>,
    registry: Arc<EventTypeRegistry>,
    config: ReaderConfig,
    admin: Option<Arc<dyn TopicAdmin>>,
    replay_lock: Mutex<()>,
}

impl EventReader {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        registry: Arc<EventTypeRegistry>,
        config: ReaderConfig,
    ) -> Self {
        Self {
            sessions,
            registry,
            config,
            admin: None,
            replay_lock: Mutex::new(()),
        }
    }

    /// Check topic metadata before each replay and skip missing topics.
    pub fn with_admin(mut self, admin: Arc<dyn TopicAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Events at or after offset `position` on every partition.
    pub async fn get_events_after(&self, position: i64) -> Result<Vec<Box<dyn Event>>, ReadError> {
        Ok(self.replay_after(position).await?.into_events())
    }

    /// Every event of one aggregate, from the start of the log.
    pub async fn get_events_for_aggregate(
        &self,
        aggregate_id: &str,
    ) -> Result<Vec<Box<dyn Event>>, ReadError> {
        let replay = self.replay_after(0).await?;
        Ok(replay
            .envelopes
            .into_iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.event)
            .collect())
    }

    /// Replay with positions, per-aggregate versions and the error count.
    ///
    /// Versions are numbered within this replay, so they only match an
    /// aggregate's true sequence when `position` is 0.
    #[tracing::instrument(name = "reader.replay", skip(self), fields(topic = %self.config.topic))]
    pub async fn replay_after(&self, position: i64) -> Result<Replay, ReadError> {
        let _guard = self.replay_lock.lock().await;

        if let Some(admin) = &self.admin {
            let exists = admin
                .topic_exists(&self.config.topic)
                .await
                .map_err(|source| ReadError::Broker {
                    topic: self.config.topic.clone(),
                    source,
                })?;
            if !exists {
                debug!("Topic does not exist, nothing to replay");
                return Ok(Replay::default());
            }
        }

        let group_id = format!("{}-{}", self.config.group_prefix, Uuid::new_v4());
        let options = SessionOptions::new(&group_id)
            .with_auto_offset_reset(OffsetReset::Earliest)
            .with_partition_eof(true);
        let mut session = self
            .sessions
            .create_session(&options)
            .map_err(ReadError::Session)?;

        let result = self.replay_in(session.as_mut(), position.max(0)).await;

        if let Err(e) = session.close().await {
            warn!(group_id = %group_id, error = %e, "Failed to close replay session");
        }

        if let Ok(ref replay) = result {
            info!(
                group_id = %group_id,
                position,
                events = replay.envelopes.len(),
                deserialization_errors = replay.deserialization_errors,
                "Replay complete"
            );
        }
        result
    }

    async fn replay_in(
        &self,
        session: &mut dyn ConsumerSession,
        position: i64,
    ) -> Result<Replay, ReadError> {
        let topic = self.config.topic.clone();
        let broker_err = |source: BrokerError| ReadError::Broker {
            topic: topic.clone(),
            source,
        };

        session
            .subscribe(std::slice::from_ref(&self.config.topic))
            .await
            .map_err(broker_err)?;

        let assignment = self.await_assignment(session).await?;
        for tp in &assignment {
            session.seek(tp, position).await.map_err(broker_err)?;
        }
        debug!(assignment = ?assignment, position, "Replay positioned");

        let mut replay = Replay::default();
        let mut versions: HashMap<String, u64> = HashMap::new();
        let mut at_end: HashSet<TopicPartition> = HashSet::new();
        let mut idle_polls = 0;

        while idle_polls < self.config.max_idle_polls {
            match session
                .poll(self.config.poll_timeout)
                .await
                .map_err(broker_err)?
            {
                None => idle_polls += 1,
                Some(PollEvent::PartitionEof { topic, partition }) => {
                    at_end.insert(TopicPartition::new(topic, partition));
                    if assignment.iter().all(|tp| at_end.contains(tp)) {
                        debug!("All partitions at end");
                        break;
                    }
                }
                Some(PollEvent::Message(message)) => {
                    idle_polls = 0;
                    at_end.remove(&message.topic_partition());
                    if message.offset < position {
                        continue;
                    }
                    match self.decode(&message) {
                        Some(event) => {
                            let aggregate_id = event.aggregate_id();
                            let version = versions.entry(aggregate_id.clone()).or_insert(0);
                            *version += 1;
                            replay.envelopes.push(EventEnvelope {
                                event,
                                aggregate_id,
                                version: *version,
                                position: message.position(),
                            });
                        }
                        None => replay.deserialization_errors += 1,
                    }
                }
            }
        }

        Ok(replay)
    }

    /// Poll until the group owns partitions. Messages polled meanwhile are
    /// dropped; the seek that follows rewinds past them.
    async fn await_assignment(
        &self,
        session: &mut dyn ConsumerSession,
    ) -> Result<Vec<TopicPartition>, ReadError> {
        let deadline = Instant::now() + self.config.assignment_timeout;
        loop {
            let assignment = session.assignment().await.map_err(|source| ReadError::Broker {
                topic: self.config.topic.clone(),
                source,
            })?;
            if !assignment.is_empty() {
                return Ok(assignment);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ReadError::AssignmentTimeout {
                    topic: self.config.topic.clone(),
                    timeout: self.config.assignment_timeout,
                });
            }
            session
                .poll(self.config.poll_timeout.min(deadline - now))
                .await
                .map_err(|source| ReadError::Broker {
                    topic: self.config.topic.clone(),
                    source,
                })?;
        }
    }

    fn decode(&self, message: &LogMessage) -> Option<Box<dyn Event>> {
        let Some(key) = message.key.as_deref() else {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Skipping message without type key"
            );
            self.record_deserialization_error();
            return None;
        };

        match self
            .registry
            .decode(key, message.payload.as_deref().unwrap_or_default())
        {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    event_type = %key,
                    error = %e,
                    "Skipping undecodable message"
                );
                self.record_deserialization_error();
                None
            }
        }
    }

    fn record_deserialization_error(&self) {
        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, READER_DESERIALIZATION_ERRORS};
            READER_DESERIALIZATION_ERRORS.add(1, &[metrics::topic_attr(&self.config.topic)]);
        }
    }
}
