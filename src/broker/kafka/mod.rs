//! Kafka broker adapter.
//!
//! - `KafkaAdmin`: metadata queries and topic creation (`AdminClient`)
//! - `KafkaProducer`: idempotent, `acks=all` producer (`FutureProducer`)
//! - `KafkaSessionFactory`: one `StreamConsumer` per session, manual commits
//!
//! All clients share the connection and security settings of
//! [`KafkaConfig`](crate::config::KafkaConfig).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{
    BrokerError, ConsumerSession, CreateOutcome, Delivery, LogMessage, LogProducer,
    OutboundRecord, PollEvent, Result, SessionFactory, SessionOptions, TopicAdmin,
    TopicPartition, TopicSpec,
};
use crate::config::KafkaConfig;

/// Timeout for seeks and metadata requests issued by sessions.
const SESSION_OP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Client configuration
// ============================================================================

/// Build a ClientConfig for the admin client.
fn admin_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    client.set("request.timeout.ms", config.request_timeout_ms.to_string());

    apply_security_config(config, &mut client);
    client
}

/// Build a ClientConfig for producers.
fn producer_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    client.set("message.timeout.ms", config.message_timeout_ms.to_string());
    client.set("request.timeout.ms", config.request_timeout_ms.to_string());
    client.set("acks", "all");
    client.set("enable.idempotence", config.enable_idempotence.to_string());

    apply_security_config(config, &mut client);
    client
}

/// Build a ClientConfig for a consumer session.
fn consumer_client_config(config: &KafkaConfig, options: &SessionOptions) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    client.set("group.id", &options.group_id);
    client.set("enable.auto.commit", "false");
    client.set("enable.auto.offset.store", "false");
    client.set("auto.offset.reset", options.auto_offset_reset.as_str());
    client.set(
        "session.timeout.ms",
        options.session_timeout.as_millis().to_string(),
    );
    client.set(
        "heartbeat.interval.ms",
        config.heartbeat_interval_ms.to_string(),
    );
    client.set(
        "max.poll.interval.ms",
        options.max_poll_interval.as_millis().to_string(),
    );
    client.set(
        "enable.partition.eof",
        options.enable_partition_eof.to_string(),
    );

    apply_security_config(config, &mut client);
    client
}

/// Apply security settings to a ClientConfig.
fn apply_security_config(config: &KafkaConfig, client: &mut ClientConfig) {
    if let Some(ref protocol) = config.security_protocol {
        client.set("security.protocol", protocol);
    }

    if let Some(ref mechanism) = config.sasl_mechanism {
        client.set("sasl.mechanism", mechanism);
    }

    if let Some(ref username) = config.sasl_username {
        client.set("sasl.username", username);
    }

    if let Some(ref password) = config.sasl_password {
        client.set("sasl.password", password);
    }

    if let Some(ref ca_location) = config.ssl_ca_location {
        client.set("ssl.ca.location", ca_location);
    }
}

/// Authentication and authorization failures cannot be retried away.
fn is_fatal_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::Fatal
    )
}

fn classify_commit_error(err: KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(code) if is_fatal_code(code) => BrokerError::Fatal(err.to_string()),
        _ => BrokerError::Commit(err.to_string()),
    }
}

/// Offsets to commit, as an rdkafka partition list.
fn commit_list(offsets: &[(TopicPartition, i64)]) -> Result<TopicPartitionList> {
    let mut list = TopicPartitionList::with_capacity(offsets.len());
    for (tp, offset) in offsets {
        list.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*offset))
            .map_err(|e| BrokerError::Commit(e.to_string()))?;
    }
    Ok(list)
}

fn classify_consume_error(err: KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(code) if is_fatal_code(code) => BrokerError::Fatal(err.to_string()),
        _ => BrokerError::Consume(err.to_string()),
    }
}

// ============================================================================
// Admin
// ============================================================================

/// Topic metadata and creation through the Kafka admin API.
pub struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
    request_timeout: Duration,
}

impl KafkaAdmin {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let client: AdminClient<DefaultClientContext> = admin_client_config(config)
            .create()
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create Kafka admin client: {}", e)))?;

        Ok(Self {
            client: Arc::new(client),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }
}

#[async_trait]
impl TopicAdmin for KafkaAdmin {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        let client = Arc::clone(&self.client);
        let name = topic.to_string();
        let timeout = self.request_timeout;

        // Metadata requests block; keep them off the runtime threads.
        tokio::task::spawn_blocking(move || {
            let metadata = client
                .inner()
                .fetch_metadata(Some(name.as_str()), timeout)
                .map_err(|e| BrokerError::Unavailable(format!("Failed to fetch Kafka metadata: {}", e)))?;

            if metadata.brokers().is_empty() {
                return Err(BrokerError::Unavailable("No Kafka brokers available".to_string()));
            }

            Ok(metadata
                .topics()
                .iter()
                .any(|t| t.name() == name && t.error().is_none() && !t.partitions().is_empty()))
        })
        .await
        .map_err(|e| BrokerError::Unavailable(format!("Failed to join task: {}", e)))?
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<CreateOutcome> {
        let new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.request_timeout));

        let results = self
            .client
            .create_topics([&new_topic], &options)
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create topic: {}", e)))?;

        match results.into_iter().next() {
            Some(Ok(_)) => {
                info!(
                    topic = %spec.name,
                    partitions = spec.partitions,
                    replication_factor = spec.replication_factor,
                    "Created Kafka topic"
                );
                Ok(CreateOutcome::Created)
            }
            Some(Err((_, RDKafkaErrorCode::TopicAlreadyExists))) => Ok(CreateOutcome::AlreadyExists),
            Some(Err((_, code))) => Err(BrokerError::CreateTopic {
                topic: spec.name.clone(),
                reason: code.to_string(),
            }),
            None => Err(BrokerError::CreateTopic {
                topic: spec.name.clone(),
                reason: "broker returned no result".to_string(),
            }),
        }
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Idempotent Kafka producer. Clones share the underlying client.
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = producer_client_config(config)
            .create()
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create Kafka producer: {}", e)))?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            idempotent = config.enable_idempotence,
            "Connected to Kafka"
        );

        Ok(Self {
            producer,
            send_timeout: config.message_timeout(),
        })
    }
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn send(&self, record: OutboundRecord) -> Result<Delivery> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let kafka_record = FutureRecord::to(&record.topic)
            .key(record.key.as_str())
            .payload(record.payload.as_slice())
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(kafka_record, self.send_timeout)
            .await
            .map_err(|(e, _)| match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::UnknownTopicOrPartition) => {
                    BrokerError::UnknownTopic(record.topic.clone())
                }
                Some(code) if is_fatal_code(code) => BrokerError::Fatal(e.to_string()),
                _ => BrokerError::Produce(format!("Failed to publish: {}", e)),
            })?;

        debug!(
            topic = %record.topic,
            key = %record.key,
            partition,
            offset,
            "Published record to Kafka"
        );

        Ok(Delivery {
            topic: record.topic,
            partition,
            offset,
        })
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::Produce(format!("Failed to join task: {}", e)))?
            .map_err(|e| BrokerError::Produce(format!("Flush failed: {}", e)))
    }
}

// ============================================================================
// Consumer sessions
// ============================================================================

/// Opens one `StreamConsumer` per session.
#[derive(Clone)]
pub struct KafkaSessionFactory {
    config: KafkaConfig,
}

impl KafkaSessionFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    /// Session options seeded from the connection defaults.
    pub fn options(&self, group_id: impl Into<String>) -> SessionOptions {
        SessionOptions::new(group_id)
            .with_auto_offset_reset(self.config.auto_offset_reset)
            .with_session_timeout(self.config.session_timeout())
            .with_max_poll_interval(self.config.max_poll_interval())
            .with_partition_eof(self.config.enable_partition_eof)
    }
}

impl SessionFactory for KafkaSessionFactory {
    fn create_session(&self, options: &SessionOptions) -> Result<Box<dyn ConsumerSession>> {
        let consumer: StreamConsumer = consumer_client_config(&self.config, options)
            .create()
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create Kafka consumer: {}", e)))?;

        debug!(group_id = %options.group_id, "Created Kafka consumer session");

        Ok(Box::new(KafkaSession {
            consumer: Some(Arc::new(consumer)),
            group_id: options.group_id.clone(),
            subscription: Vec::new(),
        }))
    }
}

/// A consumer-group session backed by a `StreamConsumer`.
///
/// Commits, seeks and leaving the group block until the broker answers, so
/// they run on the blocking pool.
pub struct KafkaSession {
    consumer: Option<Arc<StreamConsumer>>,
    group_id: String,
    subscription: Vec<String>,
}

impl KafkaSession {
    fn consumer(&self) -> Result<&Arc<StreamConsumer>> {
        self.consumer.as_ref().ok_or(BrokerError::Closed)
    }
}

#[async_trait]
impl ConsumerSession for KafkaSession {
    async fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer()?
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::Consume(format!("Failed to subscribe to topics: {}", e)))?;
        self.subscription = topics.to_vec();

        info!(group_id = %self.group_id, topics = ?topics, "Subscribed to Kafka topics");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<PollEvent>> {
        let consumer = self.consumer()?;

        match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => {
                let headers = message
                    .headers()
                    .map(|headers| {
                        headers
                            .iter()
                            .filter_map(|h| {
                                let value = std::str::from_utf8(h.value?).ok()?;
                                Some((h.key.to_string(), value.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                Ok(Some(PollEvent::Message(LogMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key: message
                        .key()
                        .and_then(|k| std::str::from_utf8(k).ok())
                        .map(str::to_string),
                    payload: message.payload().map(<[u8]>::to_vec),
                    headers,
                })))
            }
            // librdkafka reports EOF with the partition only; sessions
            // subscribe to a single topic.
            Ok(Err(KafkaError::PartitionEOF(partition))) => Ok(Some(PollEvent::PartitionEof {
                topic: self.subscription.first().cloned().unwrap_or_default(),
                partition,
            })),
            Ok(Err(e)) => Err(classify_consume_error(e)),
        }
    }

    async fn commit_offsets(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        if offsets.is_empty() {
            return Err(BrokerError::NothingToCommit);
        }

        let list = commit_list(offsets)?;
        let consumer = Arc::clone(self.consumer()?);

        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Commit(format!("Failed to join task: {}", e)))?
            .map_err(classify_commit_error)
    }

    async fn assignment(&mut self) -> Result<Vec<TopicPartition>> {
        let list = self
            .consumer()?
            .assignment()
            .map_err(|e| BrokerError::Consume(format!("Failed to read assignment: {}", e)))?;

        Ok(list
            .elements()
            .iter()
            .map(|e| TopicPartition::new(e.topic(), e.partition()))
            .collect())
    }

    async fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<()> {
        let consumer = Arc::clone(self.consumer()?);
        let tp = partition.clone();

        tokio::task::spawn_blocking(move || {
            consumer.seek(
                &tp.topic,
                tp.partition,
                Offset::Offset(offset),
                SESSION_OP_TIMEOUT,
            )
        })
        .await
        .map_err(|e| BrokerError::Seek(format!("Failed to join task: {}", e)))?
        .map_err(|e| BrokerError::Seek(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(());
        };

        // Leaving the group blocks until the broker acknowledges.
        tokio::task::spawn_blocking(move || {
            consumer.unsubscribe();
            drop(consumer);
        })
        .await
        .map_err(|e| BrokerError::Consume(format!("Failed to join task: {}", e)))?;

        debug!(group_id = %self.group_id, "Closed Kafka consumer session");
        Ok(())
    }
}
