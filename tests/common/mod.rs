//! Shared fixtures for integration tests: order events, a registry and a
//! handler that forwards events to a channel.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use evlog::{CancellationSignal, DomainEvent, EventHandler, EventTypeRegistry, HandlerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub quantity: u32,
    pub placed_at: DateTime<Utc>,
}

impl OrderPlaced {
    pub fn new(order_id: &str, quantity: u32) -> Self {
        Self {
            order_id: order_id.to_string(),
            quantity,
            placed_at: Utc::now(),
        }
    }
}

impl DomainEvent for OrderPlaced {
    const EVENT_TYPE: &'static str = "OrderPlaced";

    fn aggregate_id(&self) -> String {
        self.order_id.clone()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.placed_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: String,
    pub shipped_at: DateTime<Utc>,
}

impl DomainEvent for OrderShipped {
    const EVENT_TYPE: &'static str = "OrderShipped";

    fn aggregate_id(&self) -> String {
        self.order_id.clone()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.shipped_at
    }
}

pub fn shipped(order_id: &str) -> OrderShipped {
    OrderShipped {
        order_id: order_id.to_string(),
        shipped_at: Utc::now(),
    }
}

pub fn registry() -> Arc<EventTypeRegistry> {
    let registry = EventTypeRegistry::new()
        .with_event::<OrderPlaced>()
        .and_then(|r| r.with_event::<OrderShipped>())
        .expect("Failed to build registry");
    Arc::new(registry)
}

/// Forwards every delivery to a channel, then fails the first `failures`.
pub struct ChannelHandler<E> {
    tx: mpsc::UnboundedSender<E>,
    failures: AtomicUsize,
}

impl<E> ChannelHandler<E> {
    pub fn new(failures: usize) -> (Self, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Self {
            tx,
            failures: AtomicUsize::new(failures),
        };
        (handler, rx)
    }
}

#[async_trait]
impl<E: DomainEvent + Clone> EventHandler<E> for ChannelHandler<E> {
    async fn handle(&self, event: E, _cancel: CancellationSignal) -> Result<(), HandlerError> {
        let _ = self.tx.send(event);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err("downstream rejected event".into());
        }
        Ok(())
    }
}
