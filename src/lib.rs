//! evlog - event store and event bus on a Kafka-compatible log
//!
//! Domain events are appended to log topics keyed by their type name,
//! consumed at least once by long-running [`ConsumerRunner`]s that commit
//! only after their handler succeeds, and replayed in order by an
//! [`EventReader`].
//!
//! The broker sits behind the traits in [`broker`]: the `kafka` feature
//! provides an rdkafka adapter, and [`InMemoryBroker`] serves tests and local
//! development.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod event;
pub mod reader;
pub mod registry;
pub mod topic;
pub mod utils;
pub mod writer;

#[cfg(test)]
mod test_utils;

pub use broker::{BrokerError, InMemoryBroker, LogMessage, TopicPartition};
pub use config::{Config, KafkaConfig};
pub use consumer::{
    CancellationSignal, ConsumerConfig, ConsumerError, ConsumerHost, ConsumerRunner,
    ConsumerState, EventHandler, HandlerError, HandlerFactory, ManagedConsumer, SharedHandler,
};
pub use event::{DomainEvent, Event, EventEnvelope, LogPosition};
pub use reader::{EventReader, ReadError, ReaderConfig, Replay};
pub use registry::{DecodeError, EventSchema, EventTypeRegistry, RegistryError};
pub use topic::{TopicError, TopicInitializer};
pub use writer::{EventWriter, FixedTopic, TopicPerType, TopicResolver, WriteError};

#[cfg(feature = "kafka")]
pub use broker::{KafkaAdmin, KafkaProducer, KafkaSessionFactory};
