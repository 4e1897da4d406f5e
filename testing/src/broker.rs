//! In-memory broker.
//!
//! Behaves like a single RabbitMQ node as far as the relay can tell:
//! queues with a ready backlog, per-channel unacknowledged deliveries that
//! return to the queue when their channel closes, and connections whose
//! shutdown callbacks fire when a test kills them. Prefetch is recorded but
//! not enforced.

use async_stream::stream;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use wa_relay_core::{
    AckDecision, Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError,
    BrokerFuture, Delivery, DeliveryStream, ShutdownCallback,
};

/// How a delivery was settled by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// The settled delivery.
    pub delivery_tag: u64,
    /// Its body.
    pub body: Vec<u8>,
    /// Ack, reject, or requeue.
    pub decision: AckDecision,
}

struct Ready {
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    channel: u64,
    queue: String,
    body: Vec<u8>,
}

struct ConnectionEntry {
    open: bool,
    callbacks: Vec<ShutdownCallback>,
}

struct ChannelEntry {
    connection: u64,
    open: bool,
}

struct Subscription {
    channel: u64,
    queue: String,
    auto_ack: bool,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

#[derive(Default)]
struct State {
    declared: HashSet<String>,
    ready: HashMap<String, VecDeque<Ready>>,
    prefetch: Option<u16>,
    connections_opened: usize,
    next_id: u64,
    next_tag: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    subscriptions: HashMap<String, Subscription>,
    unacked: HashMap<u64, Unacked>,
    settlements: Vec<Settlement>,
    fail_next_consume: Option<String>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_usable(&self, channel: u64) -> Result<(), BrokerError> {
        let entry = self
            .channels
            .get(&channel)
            .ok_or_else(|| BrokerError::Channel("unknown channel".into()))?;
        let connection_open = self
            .connections
            .get(&entry.connection)
            .is_some_and(|c| c.open);
        if !connection_open {
            return Err(BrokerError::ConnectionClosed("connection is closed".into()));
        }
        if !entry.open {
            return Err(BrokerError::Channel("channel is closed".into()));
        }
        Ok(())
    }

    /// Push ready messages of `queue` to a live subscription.
    fn pump(&mut self, queue: &str, broker: &Weak<Inner>) {
        loop {
            self.subscriptions.retain(|_, sub| !sub.sender.is_closed());
            let Some((tag, target)) = self
                .subscriptions
                .iter()
                .find(|(_, sub)| sub.queue == queue)
                .map(|(tag, sub)| (tag.clone(), (sub.channel, sub.auto_ack)))
            else {
                return;
            };
            let Some(message) = self.ready.get_mut(queue).and_then(VecDeque::pop_front) else {
                return;
            };

            let (channel, auto_ack) = target;
            self.next_tag += 1;
            let delivery_tag = self.next_tag;
            if !auto_ack {
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        channel,
                        queue: queue.to_owned(),
                        body: message.body.clone(),
                    },
                );
            }

            let acknowledger = Arc::new(MemoryAcknowledger {
                broker: Weak::clone(broker),
                channel,
            });
            let delivery = Delivery::new(delivery_tag, message.body, message.redelivered, acknowledger);
            if let Some(sub) = self.subscriptions.get(&tag) {
                if sub.sender.send(Ok(delivery)).is_err() {
                    self.subscriptions.remove(&tag);
                }
            }
        }
    }

    fn requeue(&mut self, queue: &str, body: Vec<u8>) {
        self.ready.entry(queue.to_owned()).or_default().push_front(Ready {
            body,
            redelivered: true,
        });
    }

    /// Close a channel: drop its subscriptions and return its unacked deliveries.
    fn close_channel(&mut self, channel: u64, broker: &Weak<Inner>) {
        if let Some(entry) = self.channels.get_mut(&channel) {
            entry.open = false;
        }
        self.subscriptions.retain(|_, sub| sub.channel != channel);

        let mut returned: Vec<(u64, Unacked)> = Vec::new();
        self.unacked.retain(|tag, unacked| {
            if unacked.channel == channel {
                returned.push((*tag, Unacked {
                    channel,
                    queue: std::mem::take(&mut unacked.queue),
                    body: std::mem::take(&mut unacked.body),
                }));
                false
            } else {
                true
            }
        });
        returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

        let mut queues = HashSet::new();
        for (_, unacked) in returned {
            queues.insert(unacked.queue.clone());
            self.requeue(&unacked.queue, unacked.body);
        }
        for queue in queues {
            self.pump(&queue, broker);
        }
    }

    fn close_connection(&mut self, connection: u64, broker: &Weak<Inner>) -> Vec<ShutdownCallback> {
        let callbacks = match self.connections.get_mut(&connection) {
            Some(entry) if entry.open => {
                entry.open = false;
                std::mem::take(&mut entry.callbacks)
            }
            _ => return Vec::new(),
        };
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel, broker);
        }
        callbacks
    }
}

struct Inner {
    state: Mutex<State>,
    settled: watch::Sender<usize>,
    refuse_connections: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A broker living in process memory.
///
/// Clones share the same broker.
///
/// # Example
///
/// ```
/// use wa_relay_testing::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// broker.publish("events", br#"{"type":"Connected"}"#.to_vec());
/// assert_eq!(broker.ready_count("events"), 1);
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                settled,
                refuse_connections: AtomicBool::new(false),
            }),
        }
    }

    /// A connector opening connections to this broker.
    #[must_use]
    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(MemoryConnector {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Enqueue a message. Delivered right away if the queue has a consumer.
    pub fn publish(&self, queue: &str, body: Vec<u8>) {
        let mut state = self.inner.lock();
        state.ready.entry(queue.to_owned()).or_default().push_back(Ready {
            body,
            redelivered: false,
        });
        state.pump(queue, &Arc::downgrade(&self.inner));
    }

    /// Enqueue a JSON message.
    pub fn publish_json(&self, queue: &str, body: &serde_json::Value) {
        self.publish(queue, body.to_string().into_bytes());
    }

    /// Messages waiting in `queue` (not delivered, or returned after a requeue).
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner.lock().ready.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries sent to consumers and not yet settled.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    /// Every settlement so far, in order.
    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.lock().settlements.clone()
    }

    /// Wait until at least `count` settlements happened.
    ///
    /// Returns `None` if `timeout` elapses first.
    pub async fn wait_for_settlements(&self, count: usize, timeout: Duration) -> Option<Vec<Settlement>> {
        let mut settled = self.inner.settled.subscribe();
        let reached = tokio::time::timeout(timeout, settled.wait_for(|n| *n >= count))
            .await
            .is_ok_and(|waited| waited.is_ok());
        reached.then(|| self.settlements())
    }

    /// Whether `queue` was declared.
    #[must_use]
    pub fn is_declared(&self, queue: &str) -> bool {
        self.inner.lock().declared.contains(queue)
    }

    /// The last prefetch count set on any channel.
    #[must_use]
    pub fn prefetch(&self) -> Option<u16> {
        self.inner.lock().prefetch
    }

    /// Tags of the active subscriptions, sorted.
    #[must_use]
    pub fn consumer_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.inner.lock().subscriptions.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Connections opened so far.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.inner.lock().connections_opened
    }

    /// Connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner.lock().connections.values().filter(|c| c.open).count()
    }

    /// Make the next `consume` call fail with a channel error.
    pub fn fail_next_consume(&self, reason: impl Into<String>) {
        self.inner.lock().fail_next_consume = Some(reason.into());
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Drop every open connection as if the network failed.
    ///
    /// Unacknowledged deliveries return to their queues, subscriptions end
    /// and shutdown callbacks fire.
    pub fn kill_connections(&self) {
        let callbacks: Vec<ShutdownCallback> = {
            let mut state = self.inner.lock();
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();
            let broker = Arc::downgrade(&self.inner);
            open.into_iter()
                .flat_map(|id| state.close_connection(id, &broker))
                .collect()
        };

        for callback in callbacks {
            callback(BrokerError::ConnectionClosed("connection reset".into()));
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("InMemoryBroker")
            .field("declared", &state.declared)
            .field("subscriptions", &state.subscriptions.len())
            .field("unacked", &state.unacked.len())
            .field("settlements", &state.settlements.len())
            .finish_non_exhaustive()
    }
}

struct MemoryConnector {
    inner: Arc<Inner>,
}

impl BrokerConnector for MemoryConnector {
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn BrokerConnection>> {
        let result = if self.inner.refuse_connections.load(Ordering::SeqCst) {
            Err(BrokerError::ConnectionFailed("connection refused".into()))
        } else {
            let mut state = self.inner.lock();
            let id = state.next_id();
            state.connections_opened += 1;
            state.connections.insert(
                id,
                ConnectionEntry {
                    open: true,
                    callbacks: Vec::new(),
                },
            );
            Ok(Arc::new(MemoryConnection {
                inner: Arc::clone(&self.inner),
                id,
            }) as Arc<dyn BrokerConnection>)
        };
        Box::pin(futures::future::ready(result))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    id: u64,
}

impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.inner
            .lock()
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn on_shutdown(&self, callback: ShutdownCallback) {
        let mut state = self.inner.lock();
        match state.connections.get_mut(&self.id) {
            Some(entry) if entry.open => entry.callbacks.push(callback),
            _ => {
                drop(state);
                callback(BrokerError::ConnectionClosed("connection already closed".into()));
            }
        }
    }

    fn open_channel(&self) -> BrokerFuture<'_, Arc<dyn BrokerChannel>> {
        let mut state = self.inner.lock();
        let result = if state.connections.get(&self.id).is_some_and(|c| c.open) {
            let id = state.next_id();
            state.channels.insert(
                id,
                ChannelEntry {
                    connection: self.id,
                    open: true,
                },
            );
            Ok(Arc::new(MemoryChannel {
                inner: Arc::clone(&self.inner),
                id,
            }) as Arc<dyn BrokerChannel>)
        } else {
            Err(BrokerError::ConnectionClosed("connection is closed".into()))
        };
        Box::pin(futures::future::ready(result))
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        let mut state = self.inner.lock();
        // Graceful close never fires shutdown callbacks.
        drop(state.close_connection(self.id, &Arc::downgrade(&self.inner)));
        Box::pin(futures::future::ready(Ok(())))
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
    id: u64,
}

impl BrokerChannel for MemoryChannel {
    fn declare_queue<'a>(&'a self, queue: &'a str, _durable: bool) -> BrokerFuture<'a, ()> {
        let mut state = self.inner.lock();
        let result = state.channel_usable(self.id).map(|()| {
            state.declared.insert(queue.to_owned());
            state.ready.entry(queue.to_owned()).or_default();
        });
        Box::pin(futures::future::ready(result))
    }

    fn set_qos(&self, prefetch_count: u16) -> BrokerFuture<'_, ()> {
        let mut state = self.inner.lock();
        let result = state.channel_usable(self.id).map(|()| {
            state.prefetch = Some(prefetch_count);
        });
        Box::pin(futures::future::ready(result))
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
        auto_ack: bool,
    ) -> BrokerFuture<'a, DeliveryStream> {
        let result = self.subscribe(queue, consumer_tag, auto_ack);
        Box::pin(futures::future::ready(result))
    }

    fn cancel<'a>(&'a self, consumer_tag: &'a str) -> BrokerFuture<'a, ()> {
        let mut state = self.inner.lock();
        let result = state.channel_usable(self.id).map(|()| {
            state.subscriptions.remove(consumer_tag);
        });
        Box::pin(futures::future::ready(result))
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        let mut state = self.inner.lock();
        state.close_channel(self.id, &Arc::downgrade(&self.inner));
        Box::pin(futures::future::ready(Ok(())))
    }
}

impl MemoryChannel {
    fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.inner.lock();
        state.channel_usable(self.id)?;

        if let Some(reason) = state.fail_next_consume.take() {
            return Err(BrokerError::Channel(reason));
        }
        if !state.declared.contains(queue) {
            return Err(BrokerError::Channel(format!("NOT_FOUND - no queue '{queue}'")));
        }
        if state.subscriptions.contains_key(consumer_tag) {
            return Err(BrokerError::Channel(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
            )));
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        state.subscriptions.insert(
            consumer_tag.to_owned(),
            Subscription {
                channel: self.id,
                queue: queue.to_owned(),
                auto_ack,
                sender,
            },
        );
        state.pump(queue, &Arc::downgrade(&self.inner));

        let deliveries: DeliveryStream = Box::pin(stream! {
            while let Some(delivery) = receiver.recv().await {
                yield delivery;
            }
        });
        Ok(deliveries)
    }
}

struct MemoryAcknowledger {
    broker: Weak<Inner>,
    channel: u64,
}

impl MemoryAcknowledger {
    fn settle(&self, delivery_tag: u64, decision: AckDecision) -> Result<(), BrokerError> {
        let failure = |reason: &str, connection_lost: bool| BrokerError::Acknowledgement {
            delivery_tag,
            reason: reason.to_owned(),
            connection_lost,
        };

        let inner = self
            .broker
            .upgrade()
            .ok_or_else(|| failure("broker is gone", true))?;
        let mut state = inner.lock();

        if let Err(err) = state.channel_usable(self.channel) {
            return Err(failure(&err.to_string(), err.is_connection_error()));
        }
        let Some(unacked) = state
            .unacked
            .remove(&delivery_tag)
            .filter(|u| u.channel == self.channel)
        else {
            return Err(failure("PRECONDITION_FAILED - unknown delivery tag", false));
        };

        if decision == AckDecision::REQUEUE {
            state.requeue(&unacked.queue, unacked.body.clone());
        }
        state.settlements.push(Settlement {
            delivery_tag,
            body: unacked.body,
            decision,
        });
        if decision == AckDecision::REQUEUE {
            state.pump(&unacked.queue, &self.broker);
        }
        drop(state);

        inner.settled.send_modify(|count| *count += 1);
        Ok(())
    }
}

impl Acknowledger for MemoryAcknowledger {
    fn ack(&self, delivery_tag: u64) -> BrokerFuture<'_, ()> {
        Box::pin(futures::future::ready(self.settle(delivery_tag, AckDecision::Ack)))
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerFuture<'_, ()> {
        Box::pin(futures::future::ready(
            self.settle(delivery_tag, AckDecision::Nack { requeue }),
        ))
    }
}

/// Connector that fails a scripted number of times.
///
/// # Example
///
/// ```
/// use wa_relay_testing::ScriptedConnector;
///
/// let connector = ScriptedConnector::always_failing();
/// assert_eq!(connector.attempts(), 0);
/// ```
pub struct ScriptedConnector {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    target: Option<Arc<dyn BrokerConnector>>,
}

impl ScriptedConnector {
    /// A connector whose every attempt fails.
    #[must_use]
    pub const fn always_failing() -> Self {
        Self {
            failures_left: AtomicU32::new(u32::MAX),
            attempts: AtomicU32::new(0),
            target: None,
        }
    }

    /// Fail `failures` attempts, then delegate to `target`.
    #[must_use]
    pub const fn failing_first(failures: u32, target: Arc<dyn BrokerConnector>) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            target: Some(target),
        }
    }

    /// Connection attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl BrokerConnector for ScriptedConnector {
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn BrokerConnection>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let scripted_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();

        match &self.target {
            Some(target) if !scripted_failure => target.connect(),
            _ => Box::pin(futures::future::ready(Err(BrokerError::ConnectionFailed(
                format!("scripted failure on attempt {attempt}"),
            )))),
        }
    }
}

impl std::fmt::Debug for ScriptedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedConnector")
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}
