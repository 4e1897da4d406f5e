//! Event handler abstraction.
//!
//! Handlers are the external collaborators the dispatcher fans events out to.
//! Zero or more handlers may be registered per event kind; they run
//! sequentially in registration order and one handler's failure never prevents
//! its siblings from running.
//!
//! # Example
//!
//! ```
//! use futures::future::BoxFuture;
//! use tokio_util::sync::CancellationToken;
//! use wa_relay_core::event::{Message, TypedEnvelope};
//! use wa_relay_core::handler::{EventHandler, HandlerError};
//!
//! struct PrintMessages;
//!
//! impl EventHandler<Message> for PrintMessages {
//!     fn handle<'a>(
//!         &'a self,
//!         envelope: &'a TypedEnvelope<Message>,
//!         _cancel: &'a CancellationToken,
//!     ) -> BoxFuture<'a, Result<(), HandlerError>> {
//!         Box::pin(async move {
//!             println!("{} -> {}", envelope.instance_name, envelope.event.info.id);
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::event::{GatewayEvent, TypedEnvelope};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors a handler may report.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler failed with a message.
    #[error("{0}")]
    Failed(String),

    /// The handler failed with an underlying error.
    #[error(transparent)]
    Source(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// The handler observed cancellation and stopped.
    #[error("Handler cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Handles one kind of gateway event.
///
/// Uses an explicit boxed future so handlers can be stored as
/// `Arc<dyn EventHandler<E>>`.
pub trait EventHandler<E: GatewayEvent>: Send + Sync {
    /// Identity used in logs when this handler fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle one event.
    ///
    /// Long-running handlers should watch `cancel` and return
    /// [`HandlerError::Cancelled`] when it fires; the dispatcher also stops
    /// waiting on the handler as soon as cancellation is requested.
    ///
    /// # Errors
    ///
    /// Any error is logged with the handler's [`name`](EventHandler::name) and
    /// the event type; sibling handlers still run.
    fn handle<'a>(
        &'a self,
        envelope: &'a TypedEnvelope<E>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}
