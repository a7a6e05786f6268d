//! Event handler contract.
//!
//! A runner asks its [`HandlerFactory`] for a fresh handler per message and
//! calls [`EventHandler::handle`] with the typed event. Handlers must be
//! idempotent: a message is redelivered whenever its handler fails, and may be
//! redelivered after a crash even when it succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

/// Error returned by handlers. Any error counts as a failure.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Tells a handler that its consumer is shutting down.
///
/// Handlers are never aborted; long-running ones should watch the signal and
/// return early (with an error, so the message is redelivered later).
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
    // Keeps a detached signal's channel open.
    _sender: Option<Arc<watch::Sender<bool>>>,
}

impl CancellationSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx, _sender: None }
    }

    /// A signal that never fires. Useful when calling handlers directly.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _sender: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested or the consumer is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Applies one event to a read model or side effect.
#[async_trait]
pub trait EventHandler<E: Send + 'static>: Send + Sync {
    async fn handle(&self, event: E, cancel: CancellationSignal) -> Result<(), HandlerError>;
}

#[async_trait]
impl<E, H> EventHandler<E> for Arc<H>
where
    E: Send + 'static,
    H: EventHandler<E> + ?Sized,
{
    async fn handle(&self, event: E, cancel: CancellationSignal) -> Result<(), HandlerError> {
        (**self).handle(event, cancel).await
    }
}

/// Creates the handler for each message.
///
/// Closures returning a handler implement this, so a factory is usually
/// `|| MyProjection::new(pool.clone())`.
pub trait HandlerFactory<E: Send + 'static>: Send + Sync {
    fn create(&self) -> Box<dyn EventHandler<E>>;
}

impl<E, H, F> HandlerFactory<E> for F
where
    E: Send + 'static,
    H: EventHandler<E> + 'static,
    F: Fn() -> H + Send + Sync,
{
    fn create(&self) -> Box<dyn EventHandler<E>> {
        Box::new(self())
    }
}

/// Factory handing out one shared instance, for stateless handlers.
pub struct SharedHandler<H>(Arc<H>);

impl<H> SharedHandler<H> {
    pub fn new(handler: H) -> Self {
        Self(Arc::new(handler))
    }

    pub fn from_arc(handler: Arc<H>) -> Self {
        Self(handler)
    }
}

impl<H> Clone for SharedHandler<H> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<E, H> HandlerFactory<E> for SharedHandler<H>
where
    E: Send + 'static,
    H: EventHandler<E> + 'static,
{
    fn create(&self) -> Box<dyn EventHandler<E>> {
        Box::new(Arc::clone(&self.0))
    }
}
