//! Broker connection lifecycle.
//!
//! [`ConnectionManager`] owns the single broker connection of a process. The
//! connection is opened lazily by the first [`ConnectionManager::create_channel`]
//! call, replaced by [`ConnectionManager::try_reconnect`] after it is lost, and
//! closed by [`ConnectionManager::dispose`]. Every mutation is serialized behind
//! one async lock; [`ConnectionManager::is_connected`] never takes it.
//!
//! State transitions are published as [`ConnectionStateChanged`] notifications
//! through [`ConnectionEvents`].

use crate::health::HealthCheck;
use crate::metrics::ConnectionMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use wa_relay_core::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, ConnectionConfig,
    ConnectionStateChanged,
};

const EVENT_CAPACITY: usize = 64;

/// Errors surfaced by the connection manager.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The broker could not be reached.
    #[error("Failed to connect to broker: {0}")]
    Connect(#[source] BrokerError),

    /// The connection is up but a channel could not be opened.
    #[error("Failed to open channel: {0}")]
    Channel(#[source] BrokerError),

    /// The manager was disposed.
    #[error("Connection manager has been disposed")]
    Disposed,

    /// A reconnect cycle used all of its attempts.
    #[error("Broker still unreachable after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Attempts made by the last cycle
        attempts: u32,
    },
}

/// Publishes connection state changes to any number of observers.
///
/// Observers that fall behind lose the oldest notifications.
#[derive(Clone, Debug)]
pub struct ConnectionEvents {
    sender: broadcast::Sender<ConnectionStateChanged>,
}

impl ConnectionEvents {
    /// Create a notification hub.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Receive every notification published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStateChanged> {
        self.sender.subscribe()
    }

    /// Publish a notification. Publishing without observers is a no-op.
    pub fn emit(&self, change: ConnectionStateChanged) {
        tracing::debug!(
            state = %change.state,
            reason = change.reason.as_deref().unwrap_or(""),
            "Connection state changed"
        );
        let _ = self.sender.send(change);
    }
}

impl Default for ConnectionEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// State reachable from broker shutdown callbacks.
struct Shared {
    connected: AtomicBool,
    reconnecting: AtomicBool,
    disposed: AtomicBool,
    generation: AtomicU64,
    events: ConnectionEvents,
}

impl Shared {
    fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
        ConnectionMetrics::record_connected(true);
        self.events.emit(ConnectionStateChanged::connected());
    }

    /// Flip to disconnected, notifying only on the first report of an outage.
    fn mark_lost(&self, reason: &str, cause: Option<BrokerError>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::warn!(
                reason,
                error = %cause.as_ref().map(ToString::to_string).unwrap_or_default(),
                "Broker connection lost"
            );
            ConnectionMetrics::record_connected(false);
            self.events
                .emit(ConnectionStateChanged::disconnected(reason, cause));
        }
    }
}

/// Owns the broker connection.
///
/// # Example
///
/// ```rust,ignore
/// let manager = Arc::new(ConnectionManager::new(connector, &config.connection));
/// let mut changes = manager.subscribe();
///
/// let channel = manager.create_channel().await?;
/// ```
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    policy: RetryPolicy,
    /// Serializes connect, reconnect and dispose.
    gate: Mutex<()>,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager that reconnects according to `config`.
    #[must_use]
    pub fn new(connector: Arc<dyn BrokerConnector>, config: &ConnectionConfig) -> Self {
        Self::with_policy(connector, RetryPolicy::from_connection_config(config))
    }

    /// Create a manager with an explicit reconnect policy.
    #[must_use]
    pub fn with_policy(connector: Arc<dyn BrokerConnector>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            gate: Mutex::new(()),
            current: RwLock::new(None),
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                events: ConnectionEvents::new(),
            }),
        }
    }

    /// Whether a usable connection is believed to exist.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Whether [`ConnectionManager::dispose`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// The notification hub for connection state changes.
    #[must_use]
    pub fn events(&self) -> &ConnectionEvents {
        &self.shared.events
    }

    /// Shorthand for `events().subscribe()`.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStateChanged> {
        self.shared.events.subscribe()
    }

    /// The reconnect policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open a channel on the current connection, connecting first if needed.
    ///
    /// Concurrent callers racing on a disconnected manager open exactly one
    /// connection.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Disposed`] after [`ConnectionManager::dispose`]
    /// - [`ConnectionError::Connect`] if the connection cannot be opened
    /// - [`ConnectionError::Channel`] if the channel cannot be opened
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        self.ensure_not_disposed()?;

        let connection = match self.open_connection() {
            Some(connection) if self.is_connected() => connection,
            _ => {
                let _gate = self.gate.lock().await;
                self.ensure_not_disposed()?;

                match self.open_connection() {
                    Some(connection) if self.is_connected() => connection,
                    _ => {
                        self.close_stale().await;
                        tracing::info!("Opening broker connection");
                        let connection = self
                            .connector
                            .connect()
                            .await
                            .map_err(ConnectionError::Connect)?;
                        self.install(Arc::clone(&connection));
                        connection
                    }
                }
            }
        };

        connection.open_channel().await.map_err(|err| {
            if err.is_connection_error() {
                self.shared.mark_lost("channel open failed", Some(err.clone()));
            }
            ConnectionError::Channel(err)
        })
    }

    /// Replace a lost connection, retrying with bounded exponential backoff.
    ///
    /// Returns `Ok(true)` immediately when already connected, `Ok(true)` once a
    /// new connection is open, and `Ok(false)` when every attempt failed.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Disposed`] after [`ConnectionManager::dispose`].
    pub async fn try_reconnect(&self) -> Result<bool, ConnectionError> {
        self.ensure_not_disposed()?;
        let _gate = self.gate.lock().await;
        self.ensure_not_disposed()?;

        if self.is_connected() && self.open_connection().is_some() {
            return Ok(true);
        }

        self.close_stale().await;
        self.shared.reconnecting.store(true, Ordering::Release);
        self.shared
            .events
            .emit(ConnectionStateChanged::reconnecting("reconnecting to broker"));

        let result = retry_with_backoff(&self.policy, |attempt| {
            ConnectionMetrics::record_reconnect_attempt();
            tracing::info!(attempt = attempt + 1, "Reconnecting to broker");
            self.connector.connect()
        })
        .await;
        self.shared.reconnecting.store(false, Ordering::Release);

        match result {
            Ok(connection) => {
                self.install(connection);
                tracing::info!("Reconnected to broker");
                Ok(true)
            }
            Err(err) => {
                tracing::error!(
                    attempts = self.policy.max_attempts.max(1),
                    error = %err,
                    "Giving up on broker reconnect"
                );
                self.shared.events.emit(ConnectionStateChanged::disconnected(
                    "reconnect attempts exhausted",
                    Some(err),
                ));
                Ok(false)
            }
        }
    }

    /// Report that a connection-level failure was observed elsewhere
    /// (delivery stream, acknowledgement).
    pub fn connection_lost(&self, reason: &str, cause: Option<BrokerError>) {
        self.shared.mark_lost(reason, cause);
    }

    /// Close the connection and refuse further use.
    ///
    /// Calling it again is a no-op. Close errors are logged and swallowed.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _gate = self.gate.lock().await;
        self.shared.connected.store(false, Ordering::Release);
        ConnectionMetrics::record_connected(false);

        if let Some(connection) = self.take_connection() {
            if let Err(err) = connection.close().await {
                tracing::debug!(error = %err, "Ignoring error while closing connection");
            }
        }
        tracing::info!("Connection manager disposed");
    }

    /// Health of the broker connection.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        const COMPONENT: &str = "broker-connection";

        if self.is_disposed() {
            HealthCheck::unhealthy(COMPONENT, "disposed")
        } else if self.is_connected() {
            HealthCheck::healthy(COMPONENT)
        } else if self.shared.reconnecting.load(Ordering::Acquire) {
            HealthCheck::degraded(COMPONENT, "reconnecting")
        } else {
            HealthCheck::unhealthy(COMPONENT, "disconnected")
        }
    }

    fn ensure_not_disposed(&self) -> Result<(), ConnectionError> {
        if self.is_disposed() {
            Err(ConnectionError::Disposed)
        } else {
            Ok(())
        }
    }

    fn open_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|connection| connection.is_open())
            .map(Arc::clone)
    }

    fn take_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Drop whatever connection is held before opening a new one. Caller holds the gate.
    async fn close_stale(&self) {
        if let Some(stale) = self.take_connection() {
            if let Err(err) = stale.close().await {
                tracing::debug!(error = %err, "Ignoring error while closing stale connection");
            }
        }
        self.shared.connected.store(false, Ordering::Release);
    }

    /// Store a fresh connection and watch it for shutdown. Caller holds the gate.
    fn install(&self, connection: Arc<dyn BrokerConnection>) {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let shared = Arc::clone(&self.shared);
        connection.on_shutdown(Box::new(move |error| {
            // A late callback from a replaced connection must not mark the new one lost.
            if shared.generation.load(Ordering::Acquire) == generation {
                shared.mark_lost("connection shut down", Some(error));
            }
        }));

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(connection);
        self.shared.mark_connected();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connected", &self.is_connected())
            .field("disposed", &self.is_disposed())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
