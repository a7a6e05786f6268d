//! Runs a set of consumers as one unit.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use super::{ConsumerError, ConsumerRunner, ConsumerState};
use crate::event::DomainEvent;

/// Lifecycle of a consumer, independent of its event type.
#[async_trait]
pub trait ManagedConsumer: Send + Sync {
    /// `"{topic}/{group}"`, for logs.
    fn name(&self) -> String;

    fn state(&self) -> ConsumerState;

    async fn start(&self) -> Result<(), ConsumerError>;

    async fn stop(&self) -> Result<(), ConsumerError>;
}

#[async_trait]
impl<E: DomainEvent> ManagedConsumer for ConsumerRunner<E> {
    fn name(&self) -> String {
        format!("{}/{}", self.config.topic, self.config.group_id)
    }

    fn state(&self) -> ConsumerState {
        ConsumerRunner::state(self)
    }

    async fn start(&self) -> Result<(), ConsumerError> {
        ConsumerRunner::start(self).await
    }

    async fn stop(&self) -> Result<(), ConsumerError> {
        ConsumerRunner::stop(self).await
    }
}

/// Starts consumers in order and stops them together.
#[derive(Default)]
pub struct ConsumerHost {
    consumers: Vec<Arc<dyn ManagedConsumer>>,
}

impl ConsumerHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, consumer: Arc<dyn ManagedConsumer>) {
        self.consumers.push(consumer);
    }

    pub fn with(mut self, consumer: Arc<dyn ManagedConsumer>) -> Self {
        self.add(consumer);
        self
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Start every consumer. If one fails, those already started are stopped
    /// and the error is returned.
    pub async fn start_all(&self) -> Result<(), ConsumerError> {
        for (index, consumer) in self.consumers.iter().enumerate() {
            if let Err(e) = consumer.start().await {
                error!(consumer = %consumer.name(), error = %e, "Consumer failed to start");
                stop_each(&self.consumers[..index]).await;
                return Err(e);
            }
        }
        info!(count = self.consumers.len(), "All consumers started");
        Ok(())
    }

    /// Drain every consumer concurrently.
    pub async fn stop_all(&self) {
        stop_each(&self.consumers).await;
        info!(count = self.consumers.len(), "All consumers stopped");
    }
}

async fn stop_each(consumers: &[Arc<dyn ManagedConsumer>]) {
    let stops = consumers.iter().map(|consumer| async move {
        if let Err(e) = consumer.stop().await {
            error!(consumer = %consumer.name(), error = %e, "Consumer failed to stop");
        }
    });
    futures::future::join_all(stops).await;
}
