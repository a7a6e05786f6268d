use super::*;
use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broker::{InMemoryBroker, TopicAdmin, TopicSpec};
use crate::test_utils::{deposited, opened, registry, AccountOpened, FundsDeposited};
use crate::writer::{EventWriter, FixedTopic};

const GROUP: &str = "balance-projector";

// ============================================================================
// Test handlers
// ============================================================================

/// Records every event it handles; fails the first `failures` calls.
struct Recorder<E> {
    seen: Arc<std::sync::Mutex<Vec<E>>>,
    attempts: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl<E> Clone for Recorder<E> {
    fn clone(&self) -> Self {
        Self {
            seen: Arc::clone(&self.seen),
            attempts: Arc::clone(&self.attempts),
            failures: Arc::clone(&self.failures),
        }
    }
}

impl<E: Clone> Recorder<E> {
    fn new() -> Self {
        Self::failing(0)
    }

    fn failing(failures: usize) -> Self {
        Self {
            seen: Arc::default(),
            attempts: Arc::new(AtomicUsize::new(0)),
            failures: Arc::new(AtomicUsize::new(failures)),
        }
    }

    fn seen(&self) -> Vec<E> {
        self.seen.lock().unwrap().clone()
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E: DomainEvent + Clone> EventHandler<E> for Recorder<E> {
    async fn handle(&self, event: E, _cancel: CancellationSignal) -> Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err("projection store offline".into());
        }
        self.seen.lock().unwrap().push(event);
        Ok(())
    }
}

/// Sleeps for `duration`, ignoring cancellation.
struct Stubborn {
    started: Arc<Notify>,
    duration: Duration,
}

#[async_trait]
impl EventHandler<FundsDeposited> for Stubborn {
    async fn handle(&self, _event: FundsDeposited, _cancel: CancellationSignal) -> Result<(), HandlerError> {
        self.started.notify_one();
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

/// Waits for cancellation, then gives up.
struct Cooperative {
    started: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl EventHandler<FundsDeposited> for Cooperative {
    async fn handle(&self, _event: FundsDeposited, cancel: CancellationSignal) -> Result<(), HandlerError> {
        self.started.notify_one();
        cancel.cancelled().await;
        self.cancelled.store(cancel.is_cancelled(), Ordering::SeqCst);
        Err("interrupted by shutdown".into())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn config(group: &str) -> ConsumerConfig {
    ConsumerConfig::new("bank", group)
        .with_poll_interval(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_secs(1))
        .with_retry_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .with_auto_offset_reset(OffsetReset::Earliest)
}

fn runner_with<E: DomainEvent>(
    broker: &InMemoryBroker,
    config: ConsumerConfig,
    factory: impl HandlerFactory<E> + 'static,
) -> ConsumerRunner<E> {
    ConsumerRunner::new(
        config,
        Arc::new(broker.clone()),
        Arc::new(TopicInitializer::new(Arc::new(broker.clone()))),
        registry(),
        factory,
    )
}

fn runner<E: DomainEvent>(
    broker: &InMemoryBroker,
    handler: impl EventHandler<E> + 'static,
) -> ConsumerRunner<E> {
    runner_with(broker, config(GROUP), SharedHandler::new(handler))
}

fn writer(broker: &InMemoryBroker) -> EventWriter {
    let topics = Arc::new(TopicInitializer::new(Arc::new(broker.clone())));
    EventWriter::new(Arc::new(broker.clone()), topics, FixedTopic::new("bank"))
}

async fn create_bank_topic(broker: &InMemoryBroker) {
    broker.create_topic(&TopicSpec::new("bank")).await.unwrap();
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn committed(broker: &InMemoryBroker) -> Option<i64> {
    broker.committed_offset(GROUP, "bank", 0)
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_handles_and_commits_each_event() {
    let broker = InMemoryBroker::new();
    let writer = writer(&broker);
    for amount in [10, 20, 30] {
        writer.append(&deposited("acc-1", amount)).await.unwrap();
    }

    let recorder = Recorder::<FundsDeposited>::new();
    let runner = runner(&broker, recorder.clone());
    runner.start().await.unwrap();
    assert!(runner.is_running());

    eventually("three commits", || committed(&broker) == Some(3)).await;
    let amounts: Vec<i64> = recorder.seen().iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![10, 20, 30]);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_picks_up_events_written_after_start() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::<FundsDeposited>::new();
    let runner = runner(&broker, recorder.clone());
    runner.start().await.unwrap();

    writer(&broker).append(&deposited("acc-1", 5)).await.unwrap();

    eventually("late event", || recorder.seen().len() == 1).await;
    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_handler_is_retried_before_commit() {
    let broker = InMemoryBroker::new();
    writer(&broker).append(&deposited("acc-1", 42)).await.unwrap();

    let recorder = Recorder::<FundsDeposited>::failing(1);
    let runner = runner(&broker, recorder.clone());
    runner.start().await.unwrap();

    eventually("commit after retry", || committed(&broker) == Some(1)).await;
    assert_eq!(recorder.attempts(), 2);
    assert_eq!(recorder.seen().len(), 1);

    // Only the successful attempt committed.
    let commits = broker.commits(GROUP);
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].offset, 1);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_failing_message_blocks_its_partition() {
    let broker = InMemoryBroker::new();
    let writer = writer(&broker);
    writer.append(&deposited("acc-1", 1)).await.unwrap();
    writer.append(&deposited("acc-1", 2)).await.unwrap();

    let recorder = Recorder::<FundsDeposited>::failing(3);
    let runner = runner(&broker, recorder.clone());
    runner.start().await.unwrap();

    eventually("both handled", || recorder.seen().len() == 2).await;
    let amounts: Vec<i64> = recorder.seen().iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![1, 2]);
    assert_eq!(recorder.attempts(), 5);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_payload_is_skipped_and_committed() {
    let broker = InMemoryBroker::new();
    create_bank_topic(&broker).await;
    broker
        .append_raw("bank", Some("FundsDeposited"), Some(b"{\"amount\": \"lots\""))
        .unwrap();
    writer(&broker).append(&deposited("acc-1", 7)).await.unwrap();

    let recorder = Recorder::<FundsDeposited>::new();
    let runner = runner(&broker, recorder.clone());
    runner.start().await.unwrap();

    eventually("both committed", || committed(&broker) == Some(2)).await;
    assert_eq!(recorder.attempts(), 1);
    assert_eq!(recorder.seen()[0].amount, 7);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_and_foreign_types_are_skipped_without_handler() {
    let broker = InMemoryBroker::new();
    create_bank_topic(&broker).await;
    broker
        .append_raw("bank", Some("InterestAccrued"), Some(b"{}"))
        .unwrap();
    broker.append_raw("bank", None, Some(b"{}")).unwrap();
    writer(&broker).append(&opened("acc-1", "dana")).await.unwrap();

    let recorder = Recorder::<FundsDeposited>::new();
    let runner = runner(&broker, recorder.clone());
    runner.start().await.unwrap();

    eventually("all skipped", || committed(&broker) == Some(3)).await;
    assert_eq!(recorder.attempts(), 0);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_routes_by_type_in_log_order() {
    let broker = InMemoryBroker::new();
    let writer = writer(&broker);
    writer
        .append_events(&[
            &deposited("acc-1", 1),
            &opened("acc-1", "dana"),
            &deposited("acc-1", 3),
        ])
        .await
        .unwrap();

    let deposits = Recorder::<FundsDeposited>::new();
    let deposit_runner = runner(&broker, deposits.clone());
    let openings = Recorder::<AccountOpened>::new();
    let opening_runner: ConsumerRunner<AccountOpened> =
        runner_with(&broker, config("onboarding"), SharedHandler::new(openings.clone()));

    deposit_runner.start().await.unwrap();
    opening_runner.start().await.unwrap();

    eventually("deposits committed", || committed(&broker) == Some(3)).await;
    eventually("openings committed", || {
        broker.committed_offset("onboarding", "bank", 0) == Some(3)
    })
    .await;

    let amounts: Vec<i64> = deposits.seen().iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![1, 3]);
    assert_eq!(openings.seen().len(), 1);
    assert_eq!(openings.seen()[0].owner, "dana");

    deposit_runner.stop().await.unwrap();
    opening_runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_closure_factory_creates_handler_per_message() {
    let broker = InMemoryBroker::new();
    let writer = writer(&broker);
    writer.append(&deposited("acc-1", 1)).await.unwrap();
    writer.append(&deposited("acc-1", 2)).await.unwrap();

    let recorder = Recorder::<FundsDeposited>::new();
    let created = Arc::new(AtomicUsize::new(0));
    let factory = {
        let recorder = recorder.clone();
        let created = Arc::clone(&created);
        move || {
            created.fetch_add(1, Ordering::SeqCst);
            recorder.clone()
        }
    };
    let runner: ConsumerRunner<FundsDeposited> = runner_with(&broker, config(GROUP), factory);
    runner.start().await.unwrap();

    eventually("both handled", || recorder.seen().len() == 2).await;
    assert_eq!(created.load(Ordering::SeqCst), 2);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_resumes_from_committed_offset() {
    let broker = InMemoryBroker::new();
    let writer = writer(&broker);
    writer.append(&deposited("acc-1", 1)).await.unwrap();

    let first = Recorder::<FundsDeposited>::new();
    let consumer = runner(&broker, first.clone());
    consumer.start().await.unwrap();
    eventually("first commit", || committed(&broker) == Some(1)).await;
    consumer.stop().await.unwrap();

    writer.append(&deposited("acc-1", 2)).await.unwrap();

    let second = Recorder::<FundsDeposited>::new();
    let consumer = runner(&broker, second.clone());
    consumer.start().await.unwrap();
    eventually("second commit", || committed(&broker) == Some(2)).await;
    consumer.stop().await.unwrap();

    let amounts: Vec<i64> = second.seen().iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![2]);
}

// ============================================================================
// Broker errors
// ============================================================================

#[tokio::test]
async fn test_transient_poll_error_is_retried() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::<FundsDeposited>::new();
    let runner = runner(&broker, recorder.clone());
    runner.start().await.unwrap();

    broker.fail_next_poll(BrokerError::Consume("leader moved".to_string()));
    writer(&broker).append(&deposited("acc-1", 9)).await.unwrap();

    eventually("handled after blip", || recorder.seen().len() == 1).await;
    assert!(runner.is_running());
    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_fatal_poll_error_ends_loop() {
    let broker = InMemoryBroker::new();
    let runner = runner(&broker, Recorder::<FundsDeposited>::new());
    runner.start().await.unwrap();

    broker.fail_next_poll(BrokerError::Fatal("authentication failed".to_string()));

    eventually("loop ended", || !runner.is_running()).await;
    assert_eq!(runner.state(), ConsumerState::Running);

    runner.stop().await.unwrap();
    assert_eq!(runner.state(), ConsumerState::Stopped);
    assert_eq!(broker.open_sessions(), 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let broker = InMemoryBroker::new();
    let runner = runner(&broker, Recorder::<FundsDeposited>::new());
    runner.start().await.unwrap();

    let err = runner.start().await.unwrap_err();
    assert!(matches!(
        err,
        ConsumerError::InvalidState {
            operation: "start",
            state: ConsumerState::Running
        }
    ));

    runner.stop().await.unwrap();
    let err = runner.start().await.unwrap_err();
    assert!(matches!(
        err,
        ConsumerError::InvalidState {
            state: ConsumerState::Stopped,
            ..
        }
    ));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let broker = InMemoryBroker::new();
    let runner = runner(&broker, Recorder::<FundsDeposited>::new());
    runner.start().await.unwrap();

    runner.stop().await.unwrap();
    runner.stop().await.unwrap();

    assert_eq!(runner.state(), ConsumerState::Stopped);
    assert!(!runner.is_running());
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_stop_before_start() {
    let broker = InMemoryBroker::new();
    let runner = runner(&broker, Recorder::<FundsDeposited>::new());

    runner.stop().await.unwrap();

    assert_eq!(runner.state(), ConsumerState::Stopped);
    assert_eq!(broker.sessions_opened(), 0);
}

#[tokio::test]
async fn test_start_failure_leaves_runner_stopped() {
    let broker = InMemoryBroker::new();
    broker.fail_topic_creation("replication factor too high");
    let runner = runner(&broker, Recorder::<FundsDeposited>::new());

    let err = runner.start().await.unwrap_err();

    assert!(matches!(err, ConsumerError::Topic(TopicError::CreateFailed { .. })));
    assert_eq!(runner.state(), ConsumerState::Stopped);
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_start_with_unavailable_broker() {
    let broker = InMemoryBroker::new();
    broker.set_unavailable(true);
    let runner = runner(&broker, Recorder::<FundsDeposited>::new());

    let err = runner.start().await.unwrap_err();

    assert!(matches!(err, ConsumerError::Topic(TopicError::BrokerUnavailable { .. })));
    assert_eq!(runner.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    let broker = InMemoryBroker::new();
    let runner = runner(&broker, Recorder::<FundsDeposited>::new());
    let mut states = runner.subscribe_state();
    assert_eq!(*states.borrow_and_update(), ConsumerState::Created);

    runner.start().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConsumerState::Running);

    runner.stop().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_stop_is_bounded_by_shutdown_timeout() {
    let broker = InMemoryBroker::new();
    writer(&broker).append(&deposited("acc-1", 1)).await.unwrap();

    let started = Arc::new(Notify::new());
    let handler = Stubborn {
        started: Arc::clone(&started),
        duration: Duration::from_secs(30),
    };
    let runner: ConsumerRunner<FundsDeposited> = runner_with(
        &broker,
        config(GROUP).with_shutdown_timeout(Duration::from_millis(200)),
        SharedHandler::new(handler),
    );
    runner.start().await.unwrap();
    started.notified().await;

    let begun = Instant::now();
    runner.stop().await.unwrap();
    let elapsed = begun.elapsed();

    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(1), "stop took {elapsed:?}");
    assert_eq!(runner.state(), ConsumerState::Stopped);
    assert_eq!(broker.open_sessions(), 0);
    // The in-flight message was never completed.
    assert_eq!(committed(&broker), None);
}

#[tokio::test]
async fn test_handlers_observe_cancellation() {
    let broker = InMemoryBroker::new();
    writer(&broker).append(&deposited("acc-1", 1)).await.unwrap();

    let started = Arc::new(Notify::new());
    let cancelled = Arc::new(AtomicBool::new(false));
    let handler = Cooperative {
        started: Arc::clone(&started),
        cancelled: Arc::clone(&cancelled),
    };
    let runner: ConsumerRunner<FundsDeposited> = runner_with(
        &broker,
        config(GROUP).with_shutdown_timeout(Duration::from_secs(5)),
        SharedHandler::new(handler),
    );
    runner.start().await.unwrap();
    started.notified().await;

    let begun = Instant::now();
    runner.stop().await.unwrap();

    assert!(begun.elapsed() < Duration::from_secs(2));
    assert!(cancelled.load(Ordering::SeqCst));
    assert_eq!(committed(&broker), None);
}

#[tokio::test]
async fn test_stop_commits_completed_offsets() {
    let broker = InMemoryBroker::new();
    writer(&broker).append(&deposited("acc-1", 1)).await.unwrap();

    let recorder = Recorder::<FundsDeposited>::new();
    let runner = runner(&broker, recorder.clone());
    runner.start().await.unwrap();
    eventually("handled", || committed(&broker) == Some(1)).await;

    runner.stop().await.unwrap();

    let commits = broker.commits(GROUP);
    assert_eq!(commits.last().map(|c| c.offset), Some(1));
}

#[test]
fn test_revoked_partitions_are_forgotten() {
    let completed: CompletedOffsets = Arc::default();
    {
        let mut map = completed.lock().unwrap();
        map.insert(TopicPartition::new("bank", 0), 7);
        map.insert(TopicPartition::new("bank", 1), 3);
    }

    let remaining = retain_assigned(&completed, &[TopicPartition::new("bank", 1)]);

    assert_eq!(remaining, vec![(TopicPartition::new("bank", 1), 3)]);
    assert!(!completed
        .lock()
        .unwrap()
        .contains_key(&TopicPartition::new("bank", 0)));
    assert!(retain_assigned(&completed, &[]).is_empty());
}

#[test]
fn test_never_signal_is_not_cancelled() {
    let signal = CancellationSignal::never();
    assert!(!signal.is_cancelled());

    let mut cancelled = tokio_test::task::spawn(signal.cancelled());
    tokio_test::assert_pending!(cancelled.poll());
}

#[test]
fn test_signal_wakes_on_cancel() {
    let (tx, rx) = watch::channel(false);
    let signal = CancellationSignal::new(rx);

    let mut cancelled = tokio_test::task::spawn(signal.cancelled());
    tokio_test::assert_pending!(cancelled.poll());

    tx.send_replace(true);
    assert!(cancelled.is_woken());
    tokio_test::assert_ready!(cancelled.poll());
    assert!(signal.is_cancelled());
}

#[test]
fn test_config_from_config() {
    let mut base = Config::default();
    base.consumer.poll_interval_ms = 250;
    base.consumer.shutdown_timeout_ms = 3_000;
    base.kafka.auto_offset_reset = OffsetReset::Latest;

    let config = ConsumerConfig::from_config("bank", GROUP, &base);

    assert_eq!(config.topic, "bank");
    assert_eq!(config.group_id, GROUP);
    assert_eq!(config.poll_interval, Duration::from_millis(250));
    assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
    assert_eq!(config.auto_offset_reset, OffsetReset::Latest);
    assert_eq!(config.session_options().group_id, GROUP);
}

// ============================================================================
// Host
// ============================================================================

#[tokio::test]
async fn test_host_starts_and_stops_all() {
    let broker = InMemoryBroker::new();
    let deposits: Arc<ConsumerRunner<FundsDeposited>> =
        Arc::new(runner(&broker, Recorder::<FundsDeposited>::new()));
    let openings: Arc<ConsumerRunner<AccountOpened>> = Arc::new(runner_with(
        &broker,
        config("onboarding"),
        SharedHandler::new(Recorder::<AccountOpened>::new()),
    ));

    let host = ConsumerHost::new()
        .with(deposits.clone())
        .with(openings.clone());
    assert_eq!(host.len(), 2);

    host.start_all().await.unwrap();
    assert!(deposits.is_running());
    assert!(openings.is_running());

    host.stop_all().await;
    assert_eq!(deposits.state(), ConsumerState::Stopped);
    assert_eq!(openings.state(), ConsumerState::Stopped);
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_host_rolls_back_on_start_failure() {
    let broker = InMemoryBroker::new();
    create_bank_topic(&broker).await;
    broker.fail_topic_creation("quota exceeded");

    let first: Arc<ConsumerRunner<FundsDeposited>> =
        Arc::new(runner(&broker, Recorder::<FundsDeposited>::new()));
    let second: Arc<ConsumerRunner<FundsDeposited>> = Arc::new(runner_with(
        &broker,
        ConsumerConfig::new("audit", GROUP),
        SharedHandler::new(Recorder::<FundsDeposited>::new()),
    ));

    let host = ConsumerHost::new().with(first.clone()).with(second.clone());
    let err = host.start_all().await.unwrap_err();

    assert!(matches!(err, ConsumerError::Topic(_)));
    assert_eq!(first.state(), ConsumerState::Stopped);
    assert_eq!(second.state(), ConsumerState::Stopped);
    assert_eq!(second.name(), "audit/balance-projector");
    assert_eq!(broker.open_sessions(), 0);
}
