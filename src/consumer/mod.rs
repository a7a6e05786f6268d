//! At-least-once event consumers.
//!
//! [`ConsumerRunner`] owns one consumer-group session and one polling task
//! for a single event type. For every message it:
//!
//! 1. skips (and commits) messages keyed with another event type,
//! 2. decodes the payload through the registry, skipping and committing
//!    unknown or malformed messages,
//! 3. calls a fresh handler from the [`HandlerFactory`],
//! 4. commits on success; on failure rewinds the partition to the failed
//!    offset so the message is redelivered, after an exponential backoff.
//!
//! Lifecycle: `Created → Starting → Running → Draining → Stopped`.

mod handler;
mod host;

pub use handler::{CancellationSignal, EventHandler, HandlerError, HandlerFactory, SharedHandler};
pub use host::{ConsumerHost, ManagedConsumer};

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::{
    BrokerError, ConsumerSession, LogMessage, OffsetReset, PollEvent, SessionFactory,
    SessionOptions, TopicPartition,
};
use crate::config::Config;
use crate::event::DomainEvent;
use crate::registry::{DecodeError, EventTypeRegistry};
use crate::topic::{TopicError, TopicInitializer};
use crate::utils::{retry, trace_context};

/// Consumer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Starting,
    Running,
    Draining,
    /// Terminal.
    Stopped,
}

/// Consumer lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Cannot {operation} a consumer in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConsumerState,
    },

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("Consumer broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Consumer settings. Built once, then handed to the runner.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group_id: String,
    /// Upper bound of a single poll.
    pub poll_interval: Duration,
    pub session_timeout: Duration,
    pub max_poll_interval: Duration,
    /// How long `stop()` waits for the polling task.
    pub shutdown_timeout: Duration,
    /// First delay after a handler failure.
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub auto_offset_reset: OffsetReset,
    pub enable_partition_eof: bool,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self::from_config(topic, group_id, &Config::default())
    }

    /// Settings from the `consumer` and `kafka` configuration sections.
    pub fn from_config(
        topic: impl Into<String>,
        group_id: impl Into<String>,
        config: &Config,
    ) -> Self {
        let defaults = &config.consumer;
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            poll_interval: Duration::from_millis(defaults.poll_interval_ms),
            session_timeout: config.kafka.session_timeout(),
            max_poll_interval: config.kafka.max_poll_interval(),
            shutdown_timeout: Duration::from_millis(defaults.shutdown_timeout_ms),
            retry_backoff: Duration::from_millis(defaults.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(defaults.max_retry_backoff_ms),
            auto_offset_reset: config.kafka.auto_offset_reset,
            enable_partition_eof: config.kafka.enable_partition_eof,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.retry_backoff = min;
        self.max_retry_backoff = max;
        self
    }

    pub fn with_auto_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn with_partition_eof(mut self, enabled: bool) -> Self {
        self.enable_partition_eof = enabled;
        self
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions::new(&self.group_id)
            .with_auto_offset_reset(self.auto_offset_reset)
            .with_session_timeout(self.session_timeout)
            .with_max_poll_interval(self.max_poll_interval)
            .with_partition_eof(self.enable_partition_eof)
    }
}

type SharedSession = Arc<Mutex<Box<dyn ConsumerSession>>>;

/// Next offset to commit per partition: one past the last message that was
/// handled or skipped.
type CompletedOffsets = Arc<std::sync::Mutex<HashMap<TopicPartition, i64>>>;

#[derive(Default)]
struct Lifecycle {
    session: Option<SharedSession>,
    task: Option<JoinHandle<()>>,
}

/// Long-running consumer for one event type.
pub struct ConsumerRunner<E: DomainEvent> {
    config: Arc<ConsumerConfig>,
    sessions: Arc<dyn SessionFactory>,
    topics: Arc<TopicInitializer>,
    registry: Arc<EventTypeRegistry>,
    factory: Arc<dyn HandlerFactory<E>>,
    running: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    state_tx: watch::Sender<ConsumerState>,
    completed: CompletedOffsets,
    lifecycle: Mutex<Lifecycle>,
}

impl<E: DomainEvent> ConsumerRunner<E> {
    pub fn new(
        config: ConsumerConfig,
        sessions: Arc<dyn SessionFactory>,
        topics: Arc<TopicInitializer>,
        registry: Arc<EventTypeRegistry>,
        factory: impl HandlerFactory<E> + 'static,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(ConsumerState::Created);
        Self {
            config: Arc::new(config),
            sessions,
            topics,
            registry,
            factory: Arc::new(factory),
            running: Arc::new(AtomicBool::new(false)),
            cancel_tx,
            state_tx,
            completed: Arc::default(),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.state_tx.borrow()
    }

    /// Running and the polling loop has not ended on a fatal broker error.
    pub fn is_running(&self) -> bool {
        self.state() == ConsumerState::Running && self.running.load(Ordering::SeqCst)
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state_tx.send_replace(state);
        debug!(
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            state = ?state,
            "Consumer state changed"
        );
    }

    /// Ensure the topic, join the group and start polling.
    ///
    /// On failure the session (if any) is closed and the runner is left
    /// `Stopped`.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let state = self.state();
        if state != ConsumerState::Created {
            return Err(ConsumerError::InvalidState {
                operation: "start",
                state,
            });
        }
        self.set_state(ConsumerState::Starting);

        let session = match self.open_session().await {
            Ok(session) => session,
            Err(e) => {
                error!(
                    topic = %self.config.topic,
                    group_id = %self.config.group_id,
                    error = %e,
                    "Consumer failed to start"
                );
                self.set_state(ConsumerState::Stopped);
                return Err(e);
            }
        };

        let session: SharedSession = Arc::new(Mutex::new(session));
        self.running.store(true, Ordering::SeqCst);

        let worker = Worker::<E> {
            config: Arc::clone(&self.config),
            session: Arc::clone(&session),
            registry: Arc::clone(&self.registry),
            factory: Arc::clone(&self.factory),
            running: Arc::clone(&self.running),
            cancel_rx: self.cancel_tx.subscribe(),
            completed: Arc::clone(&self.completed),
            backoff: retry::handler_backoff(self.config.retry_backoff, self.config.max_retry_backoff),
            _event: PhantomData,
        };

        lifecycle.session = Some(session);
        lifecycle.task = Some(tokio::spawn(worker.run()));
        self.set_state(ConsumerState::Running);

        info!(
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            event_type = E::EVENT_TYPE,
            "Consumer started"
        );
        Ok(())
    }

    async fn open_session(&self) -> Result<Box<dyn ConsumerSession>, ConsumerError> {
        self.topics.ensure_exists(&self.config.topic).await?;

        let mut session = self.sessions.create_session(&self.config.session_options())?;
        if let Err(e) = session
            .subscribe(std::slice::from_ref(&self.config.topic))
            .await
        {
            if let Err(close_err) = session.close().await {
                warn!(error = %close_err, "Failed to close session after subscribe failure");
            }
            return Err(e.into());
        }
        Ok(session)
    }

    /// Drain and stop. Idempotent.
    ///
    /// Signals cancellation, commits the offsets of completed messages, waits
    /// up to `shutdown_timeout` for the polling task and closes the session.
    /// Drain failures are logged, never returned.
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match self.state() {
            ConsumerState::Stopped => return Ok(()),
            ConsumerState::Created => {
                self.set_state(ConsumerState::Stopped);
                return Ok(());
            }
            _ => {}
        }

        self.set_state(ConsumerState::Draining);
        info!(
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            "Consumer draining"
        );

        self.running.store(false, Ordering::SeqCst);
        self.cancel_tx.send_replace(true);

        let deadline = Instant::now() + self.config.shutdown_timeout;

        if let Some(session) = lifecycle.session.as_ref() {
            self.commit_completed(session, deadline).await;
        }

        if let Some(mut task) = lifecycle.task.take() {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!("Consumer loop joined"),
                Ok(Err(e)) => error!(error = %e, "Consumer loop panicked"),
                Err(_) => warn!(
                    topic = %self.config.topic,
                    group_id = %self.config.group_id,
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "Consumer did not stop within shutdown timeout, proceeding"
                ),
            }
        }

        if let Some(session) = lifecycle.session.take() {
            // The loop only holds the session during a poll or commit.
            let grace = self.config.poll_interval + Duration::from_secs(1);
            match tokio::time::timeout(grace, async { session.lock().await.close().await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to close consumer session"),
                Err(_) => warn!("Timed out closing consumer session"),
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!(
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            "Consumer stopped"
        );
        Ok(())
    }

    /// Best-effort commit of completed offsets for the current assignment.
    async fn commit_completed(&self, session: &SharedSession, deadline: Instant) {
        let commit = async {
            let mut session = session.lock().await;
            let assignment = session.assignment().await?;
            let offsets = retain_assigned(&self.completed, &assignment);
            session.commit_offsets(&offsets).await
        };

        match tokio::time::timeout_at(deadline, commit).await {
            Ok(Ok(())) => debug!("Committed completed offsets"),
            Ok(Err(BrokerError::NothingToCommit)) => debug!("No offsets to commit at shutdown"),
            Ok(Err(e)) => warn!(error = %e, "Failed to commit offsets at shutdown"),
            Err(_) => warn!("Timed out committing offsets at shutdown"),
        }
    }
}

/// Forget completed offsets of partitions that are no longer assigned, so a
/// later reassignment never commits a stale position. Returns what is left.
fn retain_assigned(
    completed: &CompletedOffsets,
    assignment: &[TopicPartition],
) -> Vec<(TopicPartition, i64)> {
    let mut completed = completed
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    completed.retain(|tp, _| assignment.contains(tp));
    completed
        .iter()
        .map(|(tp, offset)| (tp.clone(), *offset))
        .collect()
}

impl<E: DomainEvent> Drop for ConsumerRunner<E> {
    fn drop(&mut self) {
        // Let a loop that was never stopped wind down.
        self.running.store(false, Ordering::SeqCst);
        self.cancel_tx.send_replace(true);
    }
}

// ============================================================================
// Polling loop
// ============================================================================

struct Worker<E: DomainEvent> {
    config: Arc<ConsumerConfig>,
    session: SharedSession,
    registry: Arc<EventTypeRegistry>,
    factory: Arc<dyn HandlerFactory<E>>,
    running: Arc<AtomicBool>,
    cancel_rx: watch::Receiver<bool>,
    completed: CompletedOffsets,
    backoff: ExponentialBuilder,
    _event: PhantomData<fn() -> E>,
}

impl<E: DomainEvent> Worker<E> {
    fn should_run(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !*self.cancel_rx.borrow()
    }

    async fn run(mut self) {
        let mut handler_delays = self.backoff.build();
        let mut poll_delays = retry::poll_error_backoff().build();

        while self.should_run() {
            let (polled, assignment) = {
                let mut session = self.session.lock().await;
                let polled = session.poll(self.config.poll_interval).await;
                (polled, session.assignment().await.ok())
            };
            if let Some(assignment) = assignment {
                retain_assigned(&self.completed, &assignment);
            }

            let flow = match polled {
                Ok(None) => ControlFlow::Continue(()),
                Ok(Some(PollEvent::PartitionEof { topic, partition })) => {
                    debug!(topic = %topic, partition, "Reached end of partition");
                    ControlFlow::Continue(())
                }
                Ok(Some(PollEvent::Message(message))) => {
                    poll_delays = retry::poll_error_backoff().build();
                    self.process(message, &mut handler_delays).await
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        topic = %self.config.topic,
                        group_id = %self.config.group_id,
                        error = %e,
                        "Fatal broker error, consumer loop ending"
                    );
                    ControlFlow::Break(())
                }
                Err(e) => {
                    let delay = poll_delays.next().unwrap_or(Duration::from_secs(5));
                    warn!(
                        topic = %self.config.topic,
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "Poll failed, retrying after backoff"
                    );
                    self.pause(delay).await;
                    ControlFlow::Continue(())
                }
            };

            if flow.is_break() {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!(topic = %self.config.topic, group_id = %self.config.group_id, "Consumer loop exited");
    }

    async fn process(
        &mut self,
        message: LogMessage,
        handler_delays: &mut ExponentialBackoff,
    ) -> ControlFlow<()> {
        if message.key.as_deref() != Some(E::EVENT_TYPE) {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                key = ?message.key,
                "Skipping message for another event type"
            );
            return self.complete(&message, "skipped_foreign").await;
        }

        let decoded = self
            .registry
            .decode(E::EVENT_TYPE, message.payload.as_deref().unwrap_or_default());
        let event = match decoded {
            Ok(event) => match event.downcast::<E>() {
                Some(event) => event,
                None => {
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        event_type = E::EVENT_TYPE,
                        "Registry decoded a different type, skipping message"
                    );
                    return self.complete(&message, "skipped_malformed").await;
                }
            },
            Err(e @ DecodeError::UnknownType(_)) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Skipping message of unregistered type"
                );
                return self.complete(&message, "skipped_unknown").await;
            }
            Err(e @ DecodeError::Malformed { .. }) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Skipping poison message"
                );
                return self.complete(&message, "skipped_malformed").await;
            }
        };

        let span = tracing::info_span!(
            "consumer.handle",
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            event_type = E::EVENT_TYPE,
            group_id = %self.config.group_id,
        );
        trace_context::set_parent_from_headers(&span, &message.headers);

        let handler = self.factory.create();
        let cancel = handler::CancellationSignal::new(self.cancel_rx.clone());

        #[cfg(feature = "otel")]
        let start = std::time::Instant::now();

        let result = handler.handle(event, cancel).instrument(span).await;

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, CONSUMER_HANDLER_DURATION};
            let outcome = if result.is_ok() { "success" } else { "error" };
            CONSUMER_HANDLER_DURATION.record(start.elapsed().as_secs_f64(), &[
                metrics::topic_attr(&message.topic),
                metrics::event_type_attr(E::EVENT_TYPE),
                metrics::outcome_attr(outcome),
            ]);
        }

        match result {
            Ok(()) => {
                *handler_delays = self.backoff.build();
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Event handled"
                );
                self.complete(&message, "handled").await
            }
            Err(e) => {
                self.record_outcome(&message, "failed");
                let delay = handler_delays
                    .next()
                    .unwrap_or(self.config.max_retry_backoff);
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    event_type = E::EVENT_TYPE,
                    error = %e,
                    backoff_ms = delay.as_millis() as u64,
                    "Handler failed, message will be redelivered"
                );

                let rewind = {
                    let mut session = self.session.lock().await;
                    session
                        .seek(&message.topic_partition(), message.offset)
                        .await
                };
                if let Err(e) = rewind {
                    if e.is_fatal() {
                        return ControlFlow::Break(());
                    }
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Failed to rewind partition"
                    );
                }

                self.pause(delay).await;
                ControlFlow::Continue(())
            }
        }
    }

    /// Mark a message done and commit past it.
    async fn complete(&mut self, message: &LogMessage, outcome: &'static str) -> ControlFlow<()> {
        self.record_outcome(message, outcome);
        self.completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(message.topic_partition(), message.offset + 1);

        let committed = {
            let mut session = self.session.lock().await;
            session.commit(&message.position()).await
        };

        match committed {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) if e.is_fatal() => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Commit failed fatally, consumer loop ending"
                );
                ControlFlow::Break(())
            }
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Commit failed, message may be redelivered"
                );
                ControlFlow::Continue(())
            }
        }
    }

    /// Sleep, waking early on cancellation.
    async fn pause(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel_rx.changed() => {}
        }
    }

    fn record_outcome(&self, _message: &LogMessage, _outcome: &'static str) {
        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, CONSUMER_MESSAGES_TOTAL};
            CONSUMER_MESSAGES_TOTAL.add(1, &[
                metrics::topic_attr(&_message.topic),
                metrics::group_attr(&self.config.group_id),
                metrics::outcome_attr(_outcome),
            ]);
        }
    }
}

#[cfg(test)]
mod tests;
