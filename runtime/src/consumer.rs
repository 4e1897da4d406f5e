//! Queue consumer.
//!
//! ```text
//! Stopped ──start──▶ Starting ──▶ Running ──stop/halt──▶ Stopping ──▶ Stopped
//!                       │
//!                       └── failure ──▶ Stopped (error returned, Disconnected emitted)
//! ```
//!
//! While running, a pump task pulls deliveries off the broker stream. Each
//! delivery waits for a slot of a semaphore sized to `max_concurrent_messages`
//! and is then processed on its own task: dispatch, then ack or nack according
//! to the dispatch result. Completion order (and so acknowledgement order) is
//! not delivery order once more than one slot exists.
//!
//! All in-flight work shares one [`CancellationToken`]. Stopping cancels it,
//! which makes in-flight dispatches return [`DispatchError::Cancelled`] and
//! their deliveries get requeued.
//!
//! [`DispatchError::Cancelled`]: wa_relay_core::DispatchError::Cancelled

use crate::connection_manager::{ConnectionError, ConnectionManager};
use crate::dispatcher::Dispatcher;
use crate::health::HealthCheck;
use crate::metrics::ConsumerMetrics;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use wa_relay_core::dispatch::ack_decision_for;
use wa_relay_core::{
    AckDecision, BrokerChannel, BrokerError, CancellationToken, ConnectionStateChanged,
    ConsumerConfig, Delivery, DeliveryStream, DispatchError, DispatchOutcome,
};

/// Lifecycle state of an [`EventConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not consuming.
    Stopped,
    /// Declaring the queue and subscribing.
    Starting,
    /// Consuming deliveries.
    Running,
    /// Draining in-flight work and closing the channel.
    Stopping,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Errors from starting a consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// `start` was called while the consumer was busy starting or stopping.
    #[error("Consumer cannot start while {0}")]
    InvalidState(ConsumerState),

    /// No channel could be obtained.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A broker operation needed for subscribing failed.
    #[error("Broker operation '{operation}' failed: {source}")]
    Broker {
        /// The failing operation
        operation: &'static str,
        /// The broker error
        #[source]
        source: BrokerError,
    },
}

impl ConsumerError {
    /// Whether retrying after a reconnect could help.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(ConnectionError::Connect(_)) => true,
            Self::Connection(ConnectionError::Channel(source)) | Self::Broker { source, .. } => {
                source.is_connection_error()
            }
            Self::InvalidState(_)
            | Self::Connection(ConnectionError::Disposed | ConnectionError::ReconnectExhausted { .. }) => false,
        }
    }

    fn broker(operation: &'static str) -> impl FnOnce(BrokerError) -> Self {
        move |source| Self::Broker { operation, source }
    }
}

/// One subscription, from `start` to `stop`.
struct Session {
    channel: Arc<dyn BrokerChannel>,
    consumer_tag: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    pump: JoinHandle<()>,
}

/// Consumes a queue and settles every delivery from its dispatch result.
pub struct EventConsumer {
    config: ConsumerConfig,
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    state: watch::Sender<ConsumerState>,
    session: Mutex<Option<Session>>,
    tag_counter: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

impl EventConsumer {
    /// Create a stopped consumer.
    #[must_use]
    pub fn new(
        config: ConsumerConfig,
        connection: Arc<ConnectionManager>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Stopped);
        Self {
            config,
            connection,
            dispatcher,
            state,
            session: Mutex::new(None),
            tag_counter: AtomicU64::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Deliveries currently being processed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The connection manager this consumer draws channels from.
    #[must_use]
    pub const fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// The consumer settings.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Declare the queue, set the prefetch bound and begin consuming.
    ///
    /// Starting a running consumer is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError`] if no channel can be opened or subscribing
    /// fails; a `Disconnected` notification is emitted as well.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut session = self.session.lock().await;

        match self.state() {
            ConsumerState::Stopped => {}
            ConsumerState::Running => return Ok(()),
            busy @ (ConsumerState::Starting | ConsumerState::Stopping) => {
                return Err(ConsumerError::InvalidState(busy));
            }
        }

        self.state.send_replace(ConsumerState::Starting);
        tracing::info!(queue = %self.config.queue_name, "Starting consumer");

        match self.open_session().await {
            Ok(opened) => {
                tracing::info!(
                    queue = %self.config.queue_name,
                    consumer_tag = %opened.consumer_tag,
                    prefetch = self.config.prefetch_count,
                    max_concurrent = self.config.max_concurrent_messages,
                    auto_ack = self.config.auto_ack,
                    "Consumer running"
                );
                *session = Some(opened);
                self.state.send_replace(ConsumerState::Running);
                Ok(())
            }
            Err(err) => {
                tracing::error!(queue = %self.config.queue_name, error = %err, "Consumer failed to start");
                self.state.send_replace(ConsumerState::Stopped);
                let cause = match &err {
                    ConsumerError::Connection(
                        ConnectionError::Connect(source) | ConnectionError::Channel(source),
                    )
                    | ConsumerError::Broker { source, .. } => Some(source.clone()),
                    _ => None,
                };
                self.connection.events().emit(ConnectionStateChanged::disconnected(
                    format!("consumer failed to start: {err}"),
                    cause,
                ));
                Err(err)
            }
        }
    }

    /// Stop consuming and dispose the connection.
    ///
    /// Cancels in-flight work (it is requeued), cancels the subscription,
    /// waits up to the drain timeout, closes the channel, disposes the
    /// connection manager and emits `Disconnected`. Broker errors along the
    /// way are logged and ignored. Safe to call in any state, including
    /// before `start`.
    pub async fn stop(&self) {
        self.halt().await;
        self.connection.dispose().await;
        self.connection
            .events()
            .emit(ConnectionStateChanged::disconnected("consumer stopped", None));
        tracing::info!(queue = %self.config.queue_name, "Consumer stopped");
    }

    /// Stop consuming but keep the connection manager usable, so the consumer
    /// can be started again after a reconnect.
    pub async fn halt(&self) {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.take() else {
            self.state.send_replace(ConsumerState::Stopped);
            return;
        };

        self.state.send_replace(ConsumerState::Stopping);
        session.cancel.cancel();

        if let Err(err) = session.pump.await {
            tracing::warn!(error = %err, "Delivery pump ended abnormally");
        }

        if let Err(err) = session.channel.cancel(&session.consumer_tag).await {
            tracing::debug!(
                consumer_tag = %session.consumer_tag,
                error = %err,
                "Ignoring subscription cancel failure"
            );
        }

        session.tracker.close();
        let drain_timeout = self.config.drain_timeout();
        if tokio::time::timeout(drain_timeout, session.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.in_flight(),
                timeout_ms = drain_timeout.as_millis(),
                "Drain timeout elapsed with deliveries still in flight"
            );
        }

        if let Err(err) = session.channel.close().await {
            tracing::debug!(error = %err, "Ignoring channel close failure");
        }

        self.state.send_replace(ConsumerState::Stopped);
        tracing::debug!(consumer_tag = %session.consumer_tag, "Subscription closed");
    }

    /// Health of the consumer.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        const COMPONENT: &str = "consumer";

        let check = match self.state() {
            ConsumerState::Running if self.connection.is_connected() => {
                HealthCheck::healthy(COMPONENT)
            }
            ConsumerState::Running => HealthCheck::degraded(COMPONENT, "connection lost"),
            state @ (ConsumerState::Starting | ConsumerState::Stopping) => {
                HealthCheck::degraded(COMPONENT, state.to_string())
            }
            ConsumerState::Stopped => HealthCheck::unhealthy(COMPONENT, "stopped"),
        };
        check
            .with_metadata("queue", self.config.queue_name.clone())
            .with_metadata("in_flight", self.in_flight().to_string())
    }

    fn next_consumer_tag(&self) -> String {
        let n = self.tag_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "{}-{}-{n}",
            self.config.consumer_tag_prefix, self.config.queue_name
        )
    }

    async fn open_session(&self) -> Result<Session, ConsumerError> {
        let channel = self.connection.create_channel().await?;

        let subscribed = self.subscribe(channel.as_ref()).await;
        let (consumer_tag, deliveries) = match subscribed {
            Ok(subscription) => subscription,
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    tracing::debug!(error = %close_err, "Ignoring channel close failure");
                }
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let pump = Pump {
            worker: Worker {
                dispatcher: Arc::clone(&self.dispatcher),
                connection: Arc::clone(&self.connection),
                cancel: cancel.clone(),
                auto_ack: self.config.auto_ack,
                in_flight: Arc::clone(&self.in_flight),
            },
            permits: Arc::new(Semaphore::new(self.config.max_concurrent_messages.max(1))),
            tracker: tracker.clone(),
        };

        Ok(Session {
            channel,
            consumer_tag,
            cancel,
            tracker,
            pump: tokio::spawn(pump.run(deliveries)),
        })
    }

    async fn subscribe(
        &self,
        channel: &dyn BrokerChannel,
    ) -> Result<(String, DeliveryStream), ConsumerError> {
        let queue = self.config.queue_name.as_str();

        channel
            .declare_queue(queue, true)
            .await
            .map_err(ConsumerError::broker("declare_queue"))?;
        channel
            .set_qos(self.config.prefetch_count)
            .await
            .map_err(ConsumerError::broker("set_qos"))?;

        let consumer_tag = self.next_consumer_tag();
        let deliveries = channel
            .consume(queue, &consumer_tag, self.config.auto_ack)
            .await
            .map_err(ConsumerError::broker("consume"))?;

        Ok((consumer_tag, deliveries))
    }
}

impl fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventConsumer")
            .field("queue", &self.config.queue_name)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Consecutive non-connection stream errors tolerated before the session is abandoned.
const MAX_STREAM_ERRORS: u32 = 5;
const STREAM_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Pulls deliveries off the stream and spawns one worker task per delivery.
struct Pump {
    worker: Worker,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Pump {
    async fn run(self, mut deliveries: DeliveryStream) {
        let cancel = self.worker.cancel.clone();
        let mut stream_errors = 0_u32;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) if err.is_connection_error() => {
                    self.worker
                        .connection
                        .connection_lost("delivery stream failed", Some(err));
                    break;
                }
                Some(Err(err)) => {
                    stream_errors += 1;
                    tracing::warn!(error = %err, consecutive = stream_errors, "Delivery stream error");
                    if stream_errors >= MAX_STREAM_ERRORS {
                        self.worker
                            .connection
                            .connection_lost("delivery stream keeps failing", Some(err));
                        break;
                    }
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(STREAM_ERROR_BACKOFF * stream_errors) => {}
                    }
                    continue;
                }
                None => {
                    if !cancel.is_cancelled() {
                        self.worker
                            .connection
                            .connection_lost("delivery stream closed by broker", None);
                    }
                    break;
                }
            };

            stream_errors = 0;
            ConsumerMetrics::record_received();
            tracing::trace!(
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                "Delivery received"
            );

            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.worker.settle(&delivery, AckDecision::REQUEUE).await;
                    break;
                }
                permit = Arc::clone(&self.permits).acquire_owned() => permit,
            };
            let Ok(permit) = permit else { break };

            let worker = self.worker.clone();
            self.tracker.spawn(worker.process(delivery, permit));
        }

        tracing::debug!("Delivery pump finished");
    }
}

/// Work aborted by shutdown is retried later, unless the message itself is unusable.
fn settlement_for(result: &Result<DispatchOutcome, DispatchError>, cancelled: bool) -> AckDecision {
    match result {
        Err(err) if cancelled && !err.is_terminal() => AckDecision::REQUEUE,
        _ => ack_decision_for(result),
    }
}

/// Processes one delivery; cheap to clone per task.
#[derive(Clone)]
struct Worker {
    dispatcher: Arc<Dispatcher>,
    connection: Arc<ConnectionManager>,
    cancel: CancellationToken,
    auto_ack: bool,
    in_flight: Arc<AtomicUsize>,
}

impl Worker {
    /// The permit is held until this returns, whatever the outcome.
    async fn process(self, delivery: Delivery, _permit: OwnedSemaphorePermit) {
        let _in_flight = InFlight::enter(&self.in_flight);

        let result = self.dispatcher.dispatch(&delivery.body, &self.cancel).await;

        let decision = settlement_for(&result, self.cancel.is_cancelled());

        match &result {
            Ok(outcome) => tracing::debug!(
                delivery_tag = delivery.delivery_tag,
                event_type = %outcome.event_type,
                status = ?outcome.status,
                "Delivery dispatched"
            ),
            Err(err) => tracing::warn!(
                delivery_tag = delivery.delivery_tag,
                kind = err.kind(),
                error = %err,
                decision = ?decision,
                "Delivery not processed"
            ),
        }

        self.settle(&delivery, decision).await;
    }

    async fn settle(&self, delivery: &Delivery, decision: AckDecision) {
        if self.auto_ack {
            return;
        }

        let settled = match decision {
            AckDecision::Ack => delivery.ack().await,
            AckDecision::Nack { requeue } => delivery.nack(requeue).await,
        };

        match settled {
            Ok(()) => ConsumerMetrics::record_settled(decision),
            Err(err) => {
                tracing::warn!(
                    delivery_tag = delivery.delivery_tag,
                    decision = ?decision,
                    error = %err,
                    "Failed to settle delivery"
                );
                if err.is_connection_error() {
                    self.connection
                        .connection_lost("acknowledgement failed", Some(err));
                }
            }
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        ConsumerMetrics::record_started();
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
        ConsumerMetrics::record_finished();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::scope::HandlerRegistry;
    use wa_relay_testing::InMemoryBroker;

    fn consumer(broker: &InMemoryBroker, config: ConsumerConfig) -> EventConsumer {
        let connection = Arc::new(ConnectionManager::with_policy(
            broker.connector(),
            RetryPolicy::builder().max_attempts(1).build(),
        ));
        EventConsumer::new(
            config,
            connection,
            Arc::new(Dispatcher::new(HandlerRegistry::default())),
        )
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker, ConsumerConfig::default());
        let mut changes = consumer.connection().subscribe();

        consumer.stop().await;

        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(consumer.connection().is_disposed());
        assert!(!changes.recv().await.unwrap().connected_flag());
    }

    #[tokio::test]
    async fn start_declares_and_subscribes() {
        let broker = InMemoryBroker::new();
        let config = ConsumerConfig {
            queue_name: "events".into(),
            consumer_tag_prefix: "relay".into(),
            prefetch_count: 25,
            ..ConsumerConfig::default()
        };
        let consumer = consumer(&broker, config);

        consumer.start().await.unwrap();
        consumer.start().await.unwrap();

        assert_eq!(consumer.state(), ConsumerState::Running);
        assert!(broker.is_declared("events"));
        assert_eq!(broker.prefetch(), Some(25));
        assert_eq!(broker.consumer_tags(), vec!["relay-events-1".to_string()]);
        assert!(consumer.health().status.is_healthy());

        consumer.halt().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(broker.consumer_tags().is_empty());
        assert!(consumer.connection().is_connected());

        consumer.start().await.unwrap();
        assert_eq!(broker.consumer_tags(), vec!["relay-events-2".to_string()]);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn failed_start_emits_disconnected() {
        let broker = InMemoryBroker::new();
        broker.fail_next_consume("queue locked");
        let consumer = consumer(&broker, ConsumerConfig::default());
        let mut changes = consumer.connection().subscribe();

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, ConsumerError::Broker { operation: "consume", .. }));
        assert!(!err.is_connection_error());
        assert_eq!(consumer.state(), ConsumerState::Stopped);

        // Connected (lazy connect), then Disconnected from the failed start.
        assert!(changes.recv().await.unwrap().connected_flag());
        assert!(!changes.recv().await.unwrap().connected_flag());
    }

    #[test]
    fn unusable_messages_are_rejected_even_during_shutdown() {
        let routing: Result<DispatchOutcome, DispatchError> =
            Err(DispatchError::Routing("missing 'type'".into()));
        let schema = Err(DispatchError::Deserialization {
            event_type: "Message".into(),
            reason: "invalid type".into(),
        });
        let handlers = Err(DispatchError::HandlerFailed {
            event_type: "Message".into(),
            failed: 1,
            total: 2,
        });

        assert_eq!(settlement_for(&routing, true), AckDecision::REJECT);
        assert_eq!(settlement_for(&schema, true), AckDecision::REJECT);
        assert_eq!(settlement_for(&handlers, true), AckDecision::REQUEUE);
        assert_eq!(settlement_for(&handlers, false), AckDecision::REJECT);
        assert_eq!(
            settlement_for(&Err(DispatchError::Cancelled), true),
            AckDecision::REQUEUE
        );
    }

    #[tokio::test]
    async fn repeated_stream_errors_end_the_session() {
        let broker = InMemoryBroker::new();
        let connection = Arc::new(ConnectionManager::with_policy(
            broker.connector(),
            RetryPolicy::builder().max_attempts(1).build(),
        ));
        connection.create_channel().await.unwrap();
        let mut changes = connection.subscribe();

        let pump = Pump {
            worker: Worker {
                dispatcher: Arc::new(Dispatcher::new(HandlerRegistry::default())),
                connection: Arc::clone(&connection),
                cancel: CancellationToken::new(),
                auto_ack: false,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
            permits: Arc::new(Semaphore::new(1)),
            tracker: TaskTracker::new(),
        };
        let failing: DeliveryStream = Box::pin(futures::stream::repeat_with(|| {
            Err::<Delivery, _>(BrokerError::Channel("consumer stalled".into()))
        }));

        tokio::time::timeout(Duration::from_secs(5), pump.run(failing))
            .await
            .unwrap();

        assert!(!connection.is_connected());
        let change = changes.recv().await.unwrap();
        assert!(!change.connected_flag());
        assert_eq!(change.reason.as_deref(), Some("delivery stream keeps failing"));
    }

    #[test]
    fn connection_errors_are_retryable() {
        let err = ConsumerError::Connection(ConnectionError::Connect(
            BrokerError::ConnectionFailed("refused".into()),
        ));
        assert!(err.is_connection_error());
        assert!(!ConsumerError::Connection(ConnectionError::Disposed).is_connection_error());
        assert!(!ConsumerError::InvalidState(ConsumerState::Stopping).is_connection_error());
    }
}
