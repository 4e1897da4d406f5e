//! # wa-relay core
//!
//! Core types and traits for consuming WhatsApp gateway events from a message
//! broker and fanning them out to typed handlers.
//!
//! ## Concepts
//!
//! - **Envelope**: the outer wire message, `{type, userID, instanceName, event}`
//! - **Gateway event**: a closed catalog of event kinds, each a Rust type bound
//!   to its wire tag
//! - **Handler**: external code invoked once per matching event
//! - **Broker**: connection / channel / delivery traits the consumer drives
//! - **Dispatch result**: success, failure, or cancellation, mapped onto an
//!   ack / nack / requeue decision
//!
//! ## Data flow
//!
//! ```text
//! broker bytes ─▶ consumer (concurrency gate) ─▶ dispatcher (parse + route)
//!              ─▶ registry (lookup) ─▶ typed strategy (deserialize + fan-out)
//!              ─▶ handlers ─▶ ack / nack decision back to the consumer
//! ```
//!
//! The runtime pieces (connection manager, consumer, dispatcher) live in
//! `wa-relay-runtime`; this crate only defines the vocabulary they share.

pub use serde_json::Value;
pub use tokio_util::sync::CancellationToken;

/// Broker connection, channel and delivery traits.
pub mod broker;

/// Configuration sections and loaders.
pub mod config;

/// Connection state notifications.
pub mod connection;

/// Dispatch results and acknowledgement decisions.
pub mod dispatch;

/// Wire envelope parsing.
pub mod envelope;

/// Gateway event catalog.
pub mod event;

/// Event handler trait.
pub mod handler;

pub use broker::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, BrokerFuture,
    Delivery, DeliveryStream, ShutdownCallback,
};
pub use config::{
    ConfigError, ConnectionConfig, ConsumerConfig, DeserializationFailurePolicy, DispatchPolicy,
    EventFilter, HandlerFailurePolicy, RelayConfig,
};
pub use connection::{ConnectionState, ConnectionStateChanged};
pub use dispatch::{AckDecision, DispatchError, DispatchOutcome, DispatchStatus};
pub use envelope::{Envelope, EnvelopeError, RoutingFields};
pub use event::{GatewayEvent, TypedEnvelope};
pub use handler::{EventHandler, HandlerError};
