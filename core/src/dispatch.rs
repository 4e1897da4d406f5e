//! Dispatch results and the acknowledgement decision derived from them.
//!
//! Every dispatch ends in exactly one of:
//!
//! | result | decision |
//! |---|---|
//! | `Ok(DispatchOutcome)` | ack |
//! | `Err(DispatchError::Cancelled)` | nack, requeue |
//! | any other `Err` | nack, no requeue (poison message) |

use crate::envelope::EnvelopeError;
use thiserror::Error;

/// What the consumer tells the broker about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processing succeeded.
    Ack,
    /// Processing did not succeed.
    Nack {
        /// Whether the broker should redeliver the message later.
        requeue: bool,
    },
}

impl AckDecision {
    /// Reject without redelivery.
    pub const REJECT: Self = Self::Nack { requeue: false };
    /// Reject and redeliver later.
    pub const REQUEUE: Self = Self::Nack { requeue: true };
}

/// How a successful dispatch concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// At least one handler ran.
    Handled,
    /// The event kind is known but has no handlers registered.
    NoHandlers,
    /// The event kind is not in the catalog; the fallback strategy took it.
    Unrouted,
    /// The routing fields did not pass the tenant/instance filter.
    Filtered,
    /// The payload did not match its schema and the policy acknowledges such messages.
    PayloadSkipped,
}

/// Summary of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// The envelope's routing key.
    pub event_type: String,
    /// How the dispatch concluded.
    pub status: DispatchStatus,
    /// Handlers that ran to completion without error.
    pub handlers_succeeded: usize,
    /// Handlers that failed (only non-zero under the isolating handler policy).
    pub handlers_failed: usize,
}

impl DispatchOutcome {
    /// An outcome with no handler activity.
    #[must_use]
    pub fn new(event_type: impl Into<String>, status: DispatchStatus) -> Self {
        Self {
            event_type: event_type.into(),
            status,
            handlers_succeeded: 0,
            handlers_failed: 0,
        }
    }

    /// An outcome after handlers ran.
    #[must_use]
    pub fn handled(event_type: impl Into<String>, succeeded: usize, failed: usize) -> Self {
        Self {
            event_type: event_type.into(),
            status: DispatchStatus::Handled,
            handlers_succeeded: succeeded,
            handlers_failed: failed,
        }
    }
}

/// Why a dispatch failed.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The body could not be read as an envelope.
    #[error("Malformed envelope: {0}")]
    Parse(#[source] EnvelopeError),

    /// The envelope has no routable `type`.
    #[error("Unroutable envelope: {0}")]
    Routing(String),

    /// The payload does not match the typed shape and the policy rejects such messages.
    #[error("Payload for '{event_type}' does not match its schema: {reason}")]
    Deserialization {
        /// The event kind
        event_type: String,
        /// The deserializer's message
        reason: String,
    },

    /// One or more handlers failed.
    #[error("{failed} of {total} handlers failed for '{event_type}'")]
    HandlerFailed {
        /// The event kind
        event_type: String,
        /// Number of failed handlers
        failed: usize,
        /// Number of handlers resolved
        total: usize,
    },

    /// Cancellation was requested while dispatching.
    #[error("Dispatch cancelled")]
    Cancelled,

    /// Something unexpected happened (e.g. a strategy panicked).
    #[error("Dispatch aborted unexpectedly: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Whether the dispatch was cancelled rather than failed.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the message itself is unusable, so redelivery cannot help.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Routing(_) | Self::Deserialization { .. }
        )
    }

    /// The acknowledgement decision for a delivery that failed with this error.
    #[must_use]
    pub const fn ack_decision(&self) -> AckDecision {
        if self.is_cancelled() {
            AckDecision::REQUEUE
        } else {
            AckDecision::REJECT
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Routing(_) => "routing",
            Self::Deserialization { .. } => "deserialization",
            Self::HandlerFailed { .. } => "handler",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<EnvelopeError> for DispatchError {
    fn from(err: EnvelopeError) -> Self {
        if err.is_routing_failure() {
            Self::Routing(err.to_string())
        } else {
            Self::Parse(err)
        }
    }
}

/// The acknowledgement decision for any dispatch result.
#[must_use]
pub const fn ack_decision_for(result: &Result<DispatchOutcome, DispatchError>) -> AckDecision {
    match result {
        Ok(_) => AckDecision::Ack,
        Err(err) => err.ack_decision(),
    }
}
