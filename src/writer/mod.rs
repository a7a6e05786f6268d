//! Event writer: the append side of the event store.
//!
//! Each event is routed to a topic by a [`TopicResolver`], the topic is
//! created on first use, and the event is sent keyed by its type name with
//! a JSON payload and the current trace context in the headers. A batch is
//! written in order and stops at the first failure; events acknowledged
//! before the failure stay in the log.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn, Instrument};

use crate::broker::{BrokerError, Delivery, LogProducer, OutboundRecord};
use crate::event::{DomainEvent, Event};
use crate::topic::{TopicError, TopicInitializer};
use crate::utils::trace_context;

/// Event append errors.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("Failed to serialize event '{event_type}': {source}")]
    Serialize {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to append event '{event_type}' to '{topic}': {source}")]
    Send {
        event_type: &'static str,
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("Flush failed: {0}")]
    Flush(#[source] BrokerError),
}

// ============================================================================
// Topic resolution
// ============================================================================

/// Chooses the topic an event is written to.
pub trait TopicResolver: Send + Sync {
    fn resolve(&self, event: &dyn Event) -> String;
}

impl<F> TopicResolver for F
where
    F: Fn(&dyn Event) -> String + Send + Sync,
{
    fn resolve(&self, event: &dyn Event) -> String {
        self(event)
    }
}

/// Every event goes to one topic.
#[derive(Debug, Clone)]
pub struct FixedTopic(String);

impl FixedTopic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }
}

impl TopicResolver for FixedTopic {
    fn resolve(&self, _event: &dyn Event) -> String {
        self.0.clone()
    }
}

/// One topic per event type: `{prefix}.{EventType}`, or the bare type name
/// without a prefix.
#[derive(Debug, Clone, Default)]
pub struct TopicPerType {
    prefix: Option<String>,
}

impl TopicPerType {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    /// Topic name for an event type.
    pub fn topic_for(&self, event_type: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}.{}", prefix, event_type),
            None => event_type.to_string(),
        }
    }
}

impl TopicResolver for TopicPerType {
    fn resolve(&self, event: &dyn Event) -> String {
        self.topic_for(event.event_type())
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Appends domain events to the log. Safe to share between tasks.
pub struct EventWriter {
    producer: Arc<dyn LogProducer>,
    topics: Arc<TopicInitializer>,
    resolver: Arc<dyn TopicResolver>,
}

impl EventWriter {
    pub fn new(
        producer: Arc<dyn LogProducer>,
        topics: Arc<TopicInitializer>,
        resolver: impl TopicResolver + 'static,
    ) -> Self {
        Self {
            producer,
            topics,
            resolver: Arc::new(resolver),
        }
    }

    /// Append events in order, waiting for each acknowledgement.
    ///
    /// Stops at the first failure. Deliveries for the events written before
    /// it are lost to the caller but the events remain in the log.
    #[tracing::instrument(name = "writer.append_events", skip_all, fields(count = events.len()))]
    pub async fn append_events(&self, events: &[&dyn Event]) -> Result<Vec<Delivery>, WriteError> {
        let mut deliveries = Vec::with_capacity(events.len());
        for event in events {
            deliveries.push(self.append_one(*event).await?);
        }
        Ok(deliveries)
    }

    /// Append a single event.
    pub async fn append<E: DomainEvent>(&self, event: &E) -> Result<Delivery, WriteError> {
        self.append_one(event).await
    }

    /// Wait for in-flight sends to complete.
    pub async fn flush(&self, timeout: Duration) -> Result<(), WriteError> {
        self.producer.flush(timeout).await.map_err(WriteError::Flush)
    }

    async fn append_one(&self, event: &dyn Event) -> Result<Delivery, WriteError> {
        let event_type = event.event_type();
        let topic = self.resolver.resolve(event);
        let span = tracing::info_span!("writer.append", %topic, event_type);

        #[cfg(feature = "otel")]
        let start = std::time::Instant::now();

        let result = self.send(event, &topic).instrument(span).await;

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{
                self, WRITER_APPEND_DURATION, WRITER_APPEND_ERRORS, WRITER_APPEND_TOTAL,
            };
            let outcome = if result.is_ok() { "success" } else { "error" };
            let attrs = [
                metrics::topic_attr(&topic),
                metrics::event_type_attr(event_type),
                metrics::outcome_attr(outcome),
            ];
            WRITER_APPEND_DURATION.record(start.elapsed().as_secs_f64(), &attrs);
            WRITER_APPEND_TOTAL.add(1, &attrs);
            if result.is_err() {
                WRITER_APPEND_ERRORS.add(1, &attrs);
            }
        }

        if let Err(ref e) = result {
            warn!(topic = %topic, event_type, error = %e, "Failed to append event");
        }
        result
    }

    async fn send(&self, event: &dyn Event, topic: &str) -> Result<Delivery, WriteError> {
        let event_type = event.event_type();
        self.topics.ensure_exists(topic).await?;

        let payload = event.to_payload().map_err(|source| WriteError::Serialize {
            event_type,
            source,
        })?;

        let record = OutboundRecord {
            topic: topic.to_string(),
            key: event_type.to_string(),
            payload,
            headers: trace_context::inject_current(),
        };

        let delivery = self
            .producer
            .send(record)
            .await
            .map_err(|source| WriteError::Send {
                event_type,
                topic: topic.to_string(),
                source,
            })?;

        debug!(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            event_type,
            aggregate_id = %event.aggregate_id(),
            "Event appended"
        );
        Ok(delivery)
    }
}
