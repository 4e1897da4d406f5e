//! Keeps a consumer running across broker outages.
//!
//! The consumer itself never reconnects: it reports a lost connection through
//! the connection manager's notifications. The supervisor listens for those,
//! halts the consumer, asks the connection manager to reconnect and starts the
//! consumer again.

use crate::connection_manager::ConnectionError;
use crate::consumer::{ConsumerError, EventConsumer};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use wa_relay_core::{CancellationToken, ConnectionState};

/// Restarts an [`EventConsumer`] after unexpected disconnects.
///
/// # Example
///
/// ```rust,ignore
/// let shutdown = CancellationToken::new();
/// let supervisor = ConsumerSupervisor::new(Arc::clone(&consumer));
///
/// tokio::spawn({
///     let shutdown = shutdown.clone();
///     async move {
///         tokio::signal::ctrl_c().await.ok();
///         shutdown.cancel();
///     }
/// });
///
/// supervisor.run(shutdown).await?;
/// ```
#[derive(Debug)]
pub struct ConsumerSupervisor {
    consumer: Arc<EventConsumer>,
}

impl ConsumerSupervisor {
    /// Supervise `consumer`.
    #[must_use]
    pub const fn new(consumer: Arc<EventConsumer>) -> Self {
        Self { consumer }
    }

    /// The supervised consumer.
    #[must_use]
    pub const fn consumer(&self) -> &Arc<EventConsumer> {
        &self.consumer
    }

    /// Run until `shutdown` is cancelled, then stop the consumer.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::Connection`] with [`ConnectionError::ReconnectExhausted`]
    ///   when a reconnect cycle fails
    /// - any non-connection error from starting the consumer
    ///
    /// The consumer is stopped in every case.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        let result = self.supervise(&shutdown).await;
        self.consumer.stop().await;
        result
    }

    async fn supervise(&self, shutdown: &CancellationToken) -> Result<(), ConsumerError> {
        let connection = self.consumer.connection();

        loop {
            // A fresh receiver per session drops notifications about earlier outages.
            let mut changes = connection.subscribe();

            let started = tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(()),
                started = self.consumer.start() => started,
            };
            if let Err(err) = started {
                if !err.is_connection_error() {
                    return Err(err);
                }
                tracing::warn!(error = %err, "Consumer could not start, reconnecting");
                self.reconnect(shutdown).await?;
                continue;
            }

            let lost = loop {
                let change = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => return Ok(()),
                    change = changes.recv() => change,
                };
                match change {
                    Ok(change) if change.state == ConnectionState::Disconnected => break change,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Missed connection notifications");
                    }
                    Err(RecvError::Closed) => return Ok(()),
                }
            };

            tracing::warn!(
                reason = lost.reason.as_deref().unwrap_or("unknown"),
                "Broker connection lost, restarting consumer"
            );
            self.consumer.halt().await;
            self.reconnect(shutdown).await?;
        }
    }

    /// Returns `Ok` when reconnected or when shutdown interrupted the attempt.
    async fn reconnect(&self, shutdown: &CancellationToken) -> Result<(), ConsumerError> {
        let connection = self.consumer.connection();

        let reconnected = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            reconnected = connection.try_reconnect() => reconnected?,
        };

        if reconnected {
            Ok(())
        } else {
            Err(ConnectionError::ReconnectExhausted {
                attempts: connection.retry_policy().max_attempts.max(1),
            }
            .into())
        }
    }
}
