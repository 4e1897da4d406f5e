//! # wa-relay runtime
//!
//! The moving parts of the relay: connection management, queue consumption,
//! and dispatch of gateway events to typed handlers.
//!
//! ## Core Components
//!
//! - **[`ConnectionManager`]**: lazy, single-flight broker connection with
//!   bounded exponential reconnect
//! - **[`EventConsumer`]**: subscribes to the queue, bounds concurrent
//!   processing, acks or nacks each delivery
//! - **[`Dispatcher`]**: parses a delivery once and routes it to a strategy
//! - **[`DispatcherRegistry`]**: immutable `type` → strategy table with a
//!   shared fallback
//! - **[`TypedStrategy`]**: deserializes the payload and fans it out to the
//!   handlers registered in the [`HandlerRegistry`]
//! - **[`ConsumerSupervisor`]**: restarts the consumer after connection loss
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wa_relay_runtime::{
//!     ConnectionManager, ConsumerSupervisor, Dispatcher, EventConsumer, HandlerRegistry,
//! };
//!
//! let handlers = HandlerRegistry::builder()
//!     .handler::<Message, _>(StoreMessages::new(pool))
//!     .build();
//!
//! let connection = Arc::new(ConnectionManager::new(connector, &config.connection));
//! let dispatcher = Arc::new(Dispatcher::from_config(handlers, &config));
//! let consumer = Arc::new(EventConsumer::new(config.consumer.clone(), connection, dispatcher));
//!
//! ConsumerSupervisor::new(consumer).run(shutdown).await?;
//! ```

/// Broker connection lifecycle and state notifications.
pub mod connection_manager;

/// Queue consumer.
pub mod consumer;

/// Envelope parsing and routing.
pub mod dispatcher;

/// Health checks.
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// `type` tag → strategy table.
pub mod registry;

/// Retry logic with exponential backoff
pub mod retry;

/// Handler registration and per-dispatch scopes.
pub mod scope;

/// Typed and fallback dispatch strategies.
pub mod strategy;

/// Consumer restarts across connection loss.
pub mod supervisor;

pub use connection_manager::{ConnectionError, ConnectionEvents, ConnectionManager};
pub use consumer::{ConsumerError, ConsumerState, EventConsumer};
pub use dispatcher::Dispatcher;
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use registry::DispatcherRegistry;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use scope::{DispatchScope, HandlerFactory, HandlerRegistry, HandlerRegistryBuilder};
pub use strategy::{DispatchRequest, DispatchStrategy, FallbackStrategy, TypedStrategy};
pub use supervisor::ConsumerSupervisor;
