//! Lazy topic creation.
//!
//! [`TopicInitializer`] makes sure a topic exists before the first write or
//! subscription. Known topics are answered from a process-lifetime cache
//! without locking; misses are serialized through one async mutex so at most
//! one metadata/create round-trip per topic reaches the broker at a time.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broker::{BrokerError, CreateOutcome, TopicAdmin, TopicSpec};
use crate::config::TopicDefaults;

/// Topic initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error("Broker unavailable while checking topic '{topic}': {source}")]
    BrokerUnavailable {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("Failed to create topic '{topic}': {source}")]
    CreateFailed {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

/// Ensures topics exist, creating them on first use.
pub struct TopicInitializer {
    admin: Arc<dyn TopicAdmin>,
    defaults: TopicDefaults,
    known: RwLock<HashSet<String>>,
    create_lock: Mutex<()>,
}

impl TopicInitializer {
    pub fn new(admin: Arc<dyn TopicAdmin>) -> Self {
        Self::with_defaults(admin, TopicDefaults::default())
    }

    pub fn with_defaults(admin: Arc<dyn TopicAdmin>, defaults: TopicDefaults) -> Self {
        Self {
            admin,
            defaults,
            known: RwLock::new(HashSet::new()),
            create_lock: Mutex::new(()),
        }
    }

    /// Ensure `topic` exists, creating it with the configured partition count
    /// and replication factor when absent.
    pub async fn ensure_exists(&self, topic: &str) -> Result<(), TopicError> {
        if self.is_cached(topic) {
            return Ok(());
        }
        self.ensure_exists_with(&self.defaults.spec(topic)).await
    }

    /// Ensure a topic exists, creating it from `spec` when absent.
    pub async fn ensure_exists_with(&self, spec: &TopicSpec) -> Result<(), TopicError> {
        if self.is_cached(&spec.name) {
            return Ok(());
        }

        let _guard = self.create_lock.lock().await;
        // Another caller may have finished while we waited.
        if self.is_cached(&spec.name) {
            return Ok(());
        }

        let exists = self
            .admin
            .topic_exists(&spec.name)
            .await
            .map_err(|source| TopicError::BrokerUnavailable {
                topic: spec.name.clone(),
                source,
            })?;

        if exists {
            debug!(topic = %spec.name, "Topic already present on broker");
        } else {
            match self.admin.create_topic(spec).await {
                Ok(CreateOutcome::Created) => {
                    info!(
                        topic = %spec.name,
                        partitions = spec.partitions,
                        replication_factor = spec.replication_factor,
                        "Topic created"
                    );
                }
                Ok(CreateOutcome::AlreadyExists) => {
                    debug!(topic = %spec.name, "Topic created concurrently elsewhere");
                }
                Err(source @ BrokerError::Unavailable(_)) => {
                    return Err(TopicError::BrokerUnavailable {
                        topic: spec.name.clone(),
                        source,
                    });
                }
                Err(source) => {
                    return Err(TopicError::CreateFailed {
                        topic: spec.name.clone(),
                        source,
                    });
                }
            }
        }

        self.known
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(spec.name.clone());
        Ok(())
    }

    /// Whether `topic` has been confirmed in this process.
    pub fn is_cached(&self, topic: &str) -> bool {
        self.known
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(topic)
    }
}
