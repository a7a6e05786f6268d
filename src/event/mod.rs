//! Domain events and their type-erased view.
//!
//! Application events implement [`DomainEvent`]. The framework moves them
//! around as `dyn Event` (write path, replay) and recovers the concrete type
//! with [`downcast`](trait@Event) once the registry has decoded the payload.

use std::any::Any;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed, immutable domain event.
///
/// `EVENT_TYPE` is the log message key. Several event types may share one
/// topic; consumers route on the key.
pub trait DomainEvent: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Stable type name written as the message key.
    const EVENT_TYPE: &'static str;

    /// Identity of the aggregate this event belongs to.
    fn aggregate_id(&self) -> String;

    /// When the event occurred.
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Object-safe view of a [`DomainEvent`].
///
/// Implemented for every `DomainEvent`; do not implement it by hand.
pub trait Event: Debug + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;

    fn aggregate_id(&self) -> String;

    fn occurred_at(&self) -> DateTime<Utc>;

    /// Serialize the payload to UTF-8 JSON.
    fn to_payload(&self) -> serde_json::Result<Vec<u8>>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<E: DomainEvent> Event for E {
    fn event_type(&self) -> &'static str {
        E::EVENT_TYPE
    }

    fn aggregate_id(&self) -> String {
        DomainEvent::aggregate_id(self)
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        DomainEvent::occurred_at(self)
    }

    fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl dyn Event {
    /// Borrow the concrete event if it is an `E`.
    pub fn downcast_ref<E: DomainEvent>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    /// Recover the concrete event. `None` if it is not an `E`.
    pub fn downcast<E: DomainEvent>(self: Box<Self>) -> Option<E> {
        self.into_any().downcast::<E>().ok().map(|event| *event)
    }
}

/// Location of a message in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Replay-time wrapper around a decoded event. Never persisted.
#[derive(Debug)]
pub struct EventEnvelope {
    pub event: Box<dyn Event>,
    pub aggregate_id: String,
    /// Per-aggregate sequence, assigned in replay order starting at 1. A
    /// replay from a later position restarts the count at its first event.
    pub version: u64,
    pub position: LogPosition,
}
