//! Message broker abstraction.
//!
//! The consumer never talks to a concrete client library. It drives these
//! traits, which map one-to-one onto the AMQP operations it needs:
//!
//! ```text
//! BrokerConnector ──connect──▶ BrokerConnection ──open_channel──▶ BrokerChannel
//!                                   │                                 │
//!                              on_shutdown                 declare_queue / set_qos
//!                                                          consume ──▶ DeliveryStream
//!                                                                          │
//!                                                                      Delivery
//!                                                                   ack / nack(requeue)
//! ```
//!
//! # Implementations
//!
//! - `LapinConnector` in `wa-relay-amqp` for RabbitMQ
//! - `InMemoryBroker` in `wa-relay-testing` for tests
//!
//! # Dyn Compatibility
//!
//! Like every async seam in this workspace, the traits return
//! `Pin<Box<dyn Future>>` so they can be used as `Arc<dyn BrokerConnector>`.

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by broker operations.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Could not open a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection was closed or lost.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A channel-level operation failed (declare, qos, consume, ...).
    #[error("Channel error: {0}")]
    Channel(String),

    /// Acknowledging or rejecting a delivery failed.
    #[error("Acknowledgement failed for delivery {delivery_tag}: {reason}")]
    Acknowledgement {
        /// The delivery that could not be settled
        delivery_tag: u64,
        /// The reason for failure
        reason: String,
        /// Whether the failure was caused by the connection going away
        connection_lost: bool,
    },
}

impl BrokerError {
    /// Whether this error means the underlying connection is gone.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::ConnectionClosed(_) => true,
            Self::Acknowledgement {
                connection_lost, ..
            } => *connection_lost,
            Self::Channel(_) => false,
        }
    }
}

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Callback invoked once when a connection shuts down unexpectedly.
pub type ShutdownCallback = Box<dyn FnOnce(BrokerError) + Send + 'static>;

/// Opens broker connections.
pub trait BrokerConnector: Send + Sync {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the broker cannot be reached
    /// or refuses the connection.
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn BrokerConnection>>;
}

/// An open broker connection.
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection is currently usable.
    fn is_open(&self) -> bool;

    /// Register a callback for unexpected connection shutdown.
    ///
    /// The callback fires at most once. Closing the connection through
    /// [`BrokerConnection::close`] does not fire it.
    fn on_shutdown(&self, callback: ShutdownCallback);

    /// Open a channel on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Channel`] or [`BrokerError::ConnectionClosed`].
    fn open_channel(&self) -> BrokerFuture<'_, Arc<dyn BrokerChannel>>;

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails; callers usually ignore it.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// A channel on an open connection.
///
/// A channel is owned by a single consumer.
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue. Declaring an existing queue with the same settings is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Channel`] on failure.
    fn declare_queue<'a>(&'a self, queue: &'a str, durable: bool) -> BrokerFuture<'a, ()>;

    /// Bound the number of unacknowledged deliveries pushed to this channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Channel`] on failure.
    fn set_qos(&self, prefetch_count: u16) -> BrokerFuture<'_, ()>;

    /// Start consuming a queue.
    ///
    /// With `auto_ack` the broker considers deliveries settled on send and the
    /// caller must not ack or nack them.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Channel`] on failure.
    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
        auto_ack: bool,
    ) -> BrokerFuture<'a, DeliveryStream>;

    /// Cancel a subscription started with [`BrokerChannel::consume`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Channel`] on failure.
    fn cancel<'a>(&'a self, consumer_tag: &'a str) -> BrokerFuture<'a, ()>;

    /// Close the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails; callers usually ignore it.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// Settles a single delivery.
pub trait Acknowledger: Send + Sync {
    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgement`] on failure.
    fn ack(&self, delivery_tag: u64) -> BrokerFuture<'_, ()>;

    /// Reject the delivery, optionally asking the broker to requeue it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgement`] on failure.
    fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerFuture<'_, ()>;
}

/// One message pushed by the broker.
pub struct Delivery {
    /// Broker-assigned id for this delivery.
    pub delivery_tag: u64,
    /// Raw body bytes.
    pub body: Vec<u8>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    acknowledger: Arc<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery settled through `acknowledger`.
    #[must_use]
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        redelivered: bool,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            body,
            redelivered,
            acknowledger,
        }
    }

    /// Acknowledge this delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgement`] on failure.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acknowledger.ack(self.delivery_tag).await
    }

    /// Reject this delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgement`] on failure.
    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acknowledger.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_errors() {
        assert!(BrokerError::ConnectionFailed("refused".into()).is_connection_error());
        assert!(BrokerError::ConnectionClosed("reset".into()).is_connection_error());
        assert!(!BrokerError::Channel("precondition failed".into()).is_connection_error());
        assert!(
            BrokerError::Acknowledgement {
                delivery_tag: 1,
                reason: "io".into(),
                connection_lost: true,
            }
            .is_connection_error()
        );
    }

    #[test]
    fn traits_are_dyn_compatible() {
        fn assert_dyn(
            _: Option<&dyn BrokerConnector>,
            _: Option<&dyn BrokerConnection>,
            _: Option<&dyn BrokerChannel>,
            _: Option<&dyn Acknowledger>,
        ) {
        }
        assert_dyn(None, None, None, None);
    }
}
