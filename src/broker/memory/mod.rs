//! In-memory broker for tests and local development.
//!
//! Keeps partitioned logs, per-group committed offsets and an admin call
//! log inside the process. Every session of a group is assigned all
//! partitions of its subscribed topics (no group balancing), which matches a
//! single-member group on a real broker.
//!
//! Faults can be injected to exercise error paths: broker unavailability,
//! topic creation failure, a one-shot poll error, and admin latency.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    BrokerError, ConsumerSession, CreateOutcome, Delivery, LogMessage, LogProducer,
    OffsetReset, OutboundRecord, PollEvent, Result, SessionFactory, SessionOptions, TopicAdmin,
    TopicPartition, TopicSpec,
};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Option<Vec<u8>>,
    headers: Vec<(String, String)>,
}

/// A committed offset, as recorded by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub group_id: String,
    pub topic: String,
    pub partition: i32,
    /// Next offset to consume.
    pub offset: i64,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    create_failure: Option<String>,
    poll_failure: Option<BrokerError>,
    admin_latency: Duration,
    suppress_partition_eof: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    committed: HashMap<(String, TopicPartition), i64>,
    commit_log: Vec<CommitRecord>,
    metadata_calls: usize,
    create_calls: usize,
    sessions_opened: usize,
    sessions_open: usize,
    faults: Faults,
}

impl BrokerState {
    fn partition_len(&self, tp: &TopicPartition) -> i64 {
        self.topics
            .get(&tp.topic)
            .and_then(|partitions| partitions.get(tp.partition as usize))
            .map(|log| log.len() as i64)
            .unwrap_or(0)
    }
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Make admin, produce and session-open calls fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().faults.unavailable = unavailable;
    }

    /// Make topic creation fail with `reason`.
    pub fn fail_topic_creation(&self, reason: impl Into<String>) {
        self.lock().faults.create_failure = Some(reason.into());
    }

    /// Fail the next poll of any session with `error`.
    pub fn fail_next_poll(&self, error: BrokerError) {
        self.lock().faults.poll_failure = Some(error);
        self.notify.notify_waiters();
    }

    /// Never report end-of-partition, even to sessions that asked for it.
    /// Some brokers and proxies do not deliver EOF events.
    pub fn suppress_partition_eof(&self, suppress: bool) {
        self.lock().faults.suppress_partition_eof = suppress;
    }

    /// Delay every admin call by `latency`.
    pub fn set_admin_latency(&self, latency: Duration) {
        self.lock().faults.admin_latency = latency;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Number of metadata (existence) queries served.
    pub fn metadata_calls(&self) -> usize {
        self.lock().metadata_calls
    }

    /// Number of create-topic calls served.
    pub fn create_topic_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn topic_exists_now(&self, topic: &str) -> bool {
        self.lock().topics.contains_key(topic)
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.lock().topics.get(topic).map(Vec::len)
    }

    /// Committed next-to-consume offset of a group.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group_id.to_string(), TopicPartition::new(topic, partition)))
            .copied()
    }

    /// Every commit of `group_id`, in order.
    pub fn commits(&self, group_id: &str) -> Vec<CommitRecord> {
        self.lock()
            .commit_log
            .iter()
            .filter(|c| c.group_id == group_id)
            .cloned()
            .collect()
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions_open
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    /// All messages of a topic, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<LogMessage> {
        let state = self.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, record)| LogMessage {
                    topic: topic.to_string(),
                    partition: partition as i32,
                    offset: offset as i64,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                    headers: record.headers.clone(),
                })
            })
            .collect()
    }

    /// Append a raw record, bypassing serialization. Used to inject messages
    /// a well-behaved writer would never produce.
    pub fn append_raw(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Option<&[u8]>,
    ) -> Result<Delivery> {
        self.append(
            topic,
            StoredRecord {
                key: key.map(str::to_string),
                payload: payload.map(<[u8]>::to_vec),
                headers: Vec::new(),
            },
        )
    }

    fn append(&self, topic: &str, record: StoredRecord) -> Result<Delivery> {
        let delivery = {
            let mut state = self.lock();
            if state.faults.unavailable {
                return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
            }
            let partitions = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
            let partition = partition_for(record.key.as_deref(), partitions.len());
            let log = &mut partitions[partition];
            log.push(record);
            Delivery {
                topic: topic.to_string(),
                partition: partition as i32,
                offset: log.len() as i64 - 1,
            }
        };
        self.notify.notify_waiters();
        Ok(delivery)
    }

    async fn admin_delay(&self) {
        let latency = self.lock().faults.admin_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn partition_for(key: Option<&str>, partitions: usize) -> usize {
    match key {
        Some(key) if partitions > 1 => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % partitions as u64) as usize
        }
        _ => 0,
    }
}

#[async_trait]
impl TopicAdmin for InMemoryBroker {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        self.admin_delay().await;
        let mut state = self.lock();
        state.metadata_calls += 1;
        if state.faults.unavailable {
            return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
        }
        Ok(state.topics.contains_key(topic))
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<CreateOutcome> {
        self.admin_delay().await;
        let mut state = self.lock();
        state.create_calls += 1;
        if state.faults.unavailable {
            return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
        }
        if let Some(reason) = state.faults.create_failure.clone() {
            return Err(BrokerError::CreateTopic {
                topic: spec.name.clone(),
                reason,
            });
        }
        if spec.partitions < 1 {
            return Err(BrokerError::CreateTopic {
                topic: spec.name.clone(),
                reason: format!("invalid partition count {}", spec.partitions),
            });
        }
        if state.topics.contains_key(&spec.name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        state
            .topics
            .insert(spec.name.clone(), vec![Vec::new(); spec.partitions as usize]);
        info!(topic = %spec.name, partitions = spec.partitions, "Created in-memory topic");
        Ok(CreateOutcome::Created)
    }
}

#[async_trait]
impl LogProducer for InMemoryBroker {
    async fn send(&self, record: OutboundRecord) -> Result<Delivery> {
        self.append(
            &record.topic,
            StoredRecord {
                key: Some(record.key),
                payload: Some(record.payload),
                headers: record.headers,
            },
        )
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

impl SessionFactory for InMemoryBroker {
    fn create_session(&self, options: &SessionOptions) -> Result<Box<dyn ConsumerSession>> {
        {
            let mut state = self.lock();
            if state.faults.unavailable {
                return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
            }
            state.sessions_opened += 1;
            state.sessions_open += 1;
        }
        debug!(group_id = %options.group_id, "Opened in-memory consumer session");
        Ok(Box::new(InMemorySession {
            broker: self.clone(),
            options: options.clone(),
            subscription: Vec::new(),
            assignment: Vec::new(),
            positions: HashMap::new(),
            eof_reported: HashSet::new(),
            cursor: 0,
            closed: false,
        }))
    }
}

/// Consumer session against an [`InMemoryBroker`].
pub struct InMemorySession {
    broker: InMemoryBroker,
    options: SessionOptions,
    subscription: Vec<String>,
    assignment: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    eof_reported: HashSet<TopicPartition>,
    cursor: usize,
    closed: bool,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Join the group: take every partition of the subscribed topics that
    /// exist, starting from the committed offset or the reset policy.
    fn assign(&mut self, state: &BrokerState) {
        for topic in &self.subscription {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (partition, log) in partitions.iter().enumerate() {
                let tp = TopicPartition::new(topic, partition as i32);
                let start = state
                    .committed
                    .get(&(self.options.group_id.clone(), tp.clone()))
                    .copied()
                    .unwrap_or(match self.options.auto_offset_reset {
                        OffsetReset::Earliest => 0,
                        OffsetReset::Latest => log.len() as i64,
                    });
                self.positions.insert(tp.clone(), start);
                self.assignment.push(tp);
            }
        }
        if !self.assignment.is_empty() {
            debug!(
                group_id = %self.options.group_id,
                assignment = ?self.assignment,
                "Partitions assigned"
            );
        }
    }

    fn try_next(&mut self) -> Result<Option<PollEvent>> {
        let broker = self.broker.clone();
        let mut state = broker.lock();
        if let Some(error) = state.faults.poll_failure.take() {
            return Err(error);
        }
        if self.assignment.is_empty() {
            self.assign(&state);
        }

        let count = self.assignment.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let tp = &self.assignment[index];
            let position = self.positions.get(tp).copied().unwrap_or(0);
            let record = state
                .topics
                .get(&tp.topic)
                .and_then(|partitions| partitions.get(tp.partition as usize))
                .and_then(|log| log.get(position as usize))
                .cloned();
            if let Some(record) = record {
                let tp = tp.clone();
                self.positions.insert(tp.clone(), position + 1);
                self.eof_reported.remove(&tp);
                self.cursor = index;
                return Ok(Some(PollEvent::Message(LogMessage {
                    topic: tp.topic,
                    partition: tp.partition,
                    offset: position,
                    key: record.key,
                    payload: record.payload,
                    headers: record.headers,
                })));
            }
        }

        if self.options.enable_partition_eof && !state.faults.suppress_partition_eof {
            for tp in &self.assignment {
                let position = self.positions.get(tp).copied().unwrap_or(0);
                if position >= state.partition_len(tp) && self.eof_reported.insert(tp.clone()) {
                    return Ok(Some(PollEvent::PartitionEof {
                        topic: tp.topic.clone(),
                        partition: tp.partition,
                    }));
                }
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl ConsumerSession for InMemorySession {
    async fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        self.ensure_open()?;
        self.subscription = topics.to_vec();
        self.assignment.clear();
        self.positions.clear();
        self.eof_reported.clear();
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<PollEvent>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let notify = Arc::clone(&self.broker.notify);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.try_next()? {
                return Ok(Some(event));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn commit_offsets(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        self.ensure_open()?;
        if offsets.is_empty() {
            return Err(BrokerError::NothingToCommit);
        }
        let mut state = self.broker.lock();
        for (tp, offset) in offsets {
            state
                .committed
                .insert((self.options.group_id.clone(), tp.clone()), *offset);
            state.commit_log.push(CommitRecord {
                group_id: self.options.group_id.clone(),
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: *offset,
            });
        }
        Ok(())
    }

    async fn assignment(&mut self) -> Result<Vec<TopicPartition>> {
        self.ensure_open()?;
        Ok(self.assignment.clone())
    }

    async fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<()> {
        self.ensure_open()?;
        if !self.assignment.contains(partition) {
            return Err(BrokerError::Seek(format!(
                "{}[{}] is not assigned",
                partition.topic, partition.partition
            )));
        }
        self.positions.insert(partition.clone(), offset.max(0));
        self.eof_reported.remove(partition);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.assignment.clear();
        let mut state = self.broker.lock();
        state.sessions_open = state.sessions_open.saturating_sub(1);
        debug!(group_id = %self.options.group_id, "Closed in-memory consumer session");
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if !self.closed {
            let mut state = self.broker.lock();
            state.sessions_open = state.sessions_open.saturating_sub(1);
        }
    }
}
