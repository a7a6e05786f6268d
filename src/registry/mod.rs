//! Event type registry.
//!
//! Maps the type name carried in the message key to a decoder for the
//! concrete payload type. This is the static dispatch table the consumer and
//! reader use to turn `(key, bytes)` into a typed event: each entry is a
//! monomorphized `serde_json` decoder, fixed at registration time.
//!
//! The registry is populated once at startup and then shared read-only as
//! `Arc<EventTypeRegistry>`, so lookups on the hot path take no lock.

use std::collections::HashMap;
use std::fmt;

use crate::event::{DomainEvent, Event};

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors raised while building the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Event type name must not be empty")]
    EmptyTypeName,

    #[error("Event type '{0}' is already registered")]
    Duplicate(String),
}

/// Why a payload could not be turned into an event.
///
/// Both cases are message-local: callers skip the message and count it.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown event type '{0}'")]
    UnknownType(String),

    #[error("Malformed payload for event type '{type_name}': {source}")]
    Malformed {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
}

type DecodeFn = fn(&[u8]) -> serde_json::Result<Box<dyn Event>>;

fn decode_as<E: DomainEvent>(bytes: &[u8]) -> serde_json::Result<Box<dyn Event>> {
    let event: E = serde_json::from_slice(bytes)?;
    Ok(Box::new(event))
}

/// Decoder for one concrete event type.
#[derive(Clone, Copy)]
pub struct EventSchema {
    type_name: &'static str,
    decode: DecodeFn,
}

impl EventSchema {
    /// Schema for `E`, decoding JSON payloads into `E`.
    pub fn of<E: DomainEvent>() -> Self {
        Self {
            type_name: E::EVENT_TYPE,
            decode: decode_as::<E>,
        }
    }

    /// Type name of the concrete event this schema produces.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Decode a payload into the concrete event.
    pub fn decode(&self, bytes: &[u8]) -> serde_json::Result<Box<dyn Event>> {
        (self.decode)(bytes)
    }
}

impl fmt::Debug for EventSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSchema")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Type name → schema table.
#[derive(Debug, Default)]
pub struct EventTypeRegistry {
    schemas: HashMap<String, EventSchema>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `schema` under `type_name`.
    ///
    /// The name need not equal the schema's own type name, which allows a
    /// legacy key to decode into a current type.
    pub fn register(&mut self, type_name: impl Into<String>, schema: EventSchema) -> Result<()> {
        let type_name = type_name.into();
        if type_name.is_empty() {
            return Err(RegistryError::EmptyTypeName);
        }
        if self.schemas.contains_key(&type_name) {
            return Err(RegistryError::Duplicate(type_name));
        }
        self.schemas.insert(type_name, schema);
        Ok(())
    }

    /// Register `E` under its own `EVENT_TYPE`.
    pub fn register_event<E: DomainEvent>(&mut self) -> Result<()> {
        self.register(E::EVENT_TYPE, EventSchema::of::<E>())
    }

    /// Builder-style [`register_event`](Self::register_event).
    pub fn with_event<E: DomainEvent>(mut self) -> Result<Self> {
        self.register_event::<E>()?;
        Ok(self)
    }

    pub fn resolve(&self, type_name: &str) -> Option<&EventSchema> {
        self.schemas.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.schemas.contains_key(type_name)
    }

    /// Resolve and decode in one step.
    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> std::result::Result<Box<dyn Event>, DecodeError> {
        let schema = self
            .resolve(type_name)
            .ok_or_else(|| DecodeError::UnknownType(type_name.to_string()))?;
        schema.decode(bytes).map_err(|source| DecodeError::Malformed {
            type_name: type_name.to_string(),
            source,
        })
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
