//! Dispatch strategies.
//!
//! One [`TypedStrategy`] exists per event kind in the catalog; it turns the
//! envelope's `event` sub-tree into the strongly typed payload and fans it out
//! to the handlers registered for that kind. Unknown kinds go to the
//! [`FallbackStrategy`], which acknowledges them without doing anything.

use crate::metrics::DispatchMetrics;
use crate::scope::{DispatchScope, HandlerRegistry};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use wa_relay_core::{
    CancellationToken, DeserializationFailurePolicy, DispatchError, DispatchOutcome,
    DispatchPolicy, DispatchStatus, Envelope, GatewayEvent, HandlerError, HandlerFailurePolicy,
    TypedEnvelope,
};

/// Everything a strategy needs for one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    /// The envelope's `event` sub-tree, absent for signal-only kinds.
    pub event: Option<&'a Value>,
    /// The parsed envelope (full tree and routing fields).
    pub envelope: &'a Envelope,
    /// Scope for handler resolution.
    pub scope: &'a DispatchScope,
    /// Registered handlers.
    pub handlers: &'a HandlerRegistry,
    /// Shared cancellation of the consumer.
    pub cancel: &'a CancellationToken,
    /// Failure policies.
    pub policy: DispatchPolicy,
}

/// Invocation strategy for one event kind.
pub trait DispatchStrategy: Send + Sync {
    /// The kind this strategy serves, `None` for the fallback.
    fn event_type(&self) -> Option<&'static str>;

    /// Dispatch one envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] describing why the message should not be
    /// acknowledged.
    fn dispatch<'a>(
        &'a self,
        request: DispatchRequest<'a>,
    ) -> BoxFuture<'a, Result<DispatchOutcome, DispatchError>>;
}

/// Strategy for an event kind with a typed payload.
pub struct TypedStrategy<E> {
    _event: PhantomData<fn() -> E>,
}

impl<E: GatewayEvent> TypedStrategy<E> {
    /// Create the strategy for `E`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _event: PhantomData,
        }
    }
}

impl<E: GatewayEvent> Default for TypedStrategy<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: GatewayEvent> DispatchStrategy for TypedStrategy<E> {
    fn event_type(&self) -> Option<&'static str> {
        Some(E::EVENT_TYPE)
    }

    fn dispatch<'a>(
        &'a self,
        request: DispatchRequest<'a>,
    ) -> BoxFuture<'a, Result<DispatchOutcome, DispatchError>> {
        Box::pin(dispatch_typed::<E>(request))
    }
}

fn deserialize_payload<E: GatewayEvent>(event: Option<&Value>) -> Result<E, serde_json::Error> {
    match event {
        Some(tree) => E::deserialize(tree),
        None => E::deserialize(&Value::Object(Map::new())),
    }
}

async fn dispatch_typed<E: GatewayEvent>(
    request: DispatchRequest<'_>,
) -> Result<DispatchOutcome, DispatchError> {
    let DispatchRequest {
        event,
        envelope,
        scope,
        handlers,
        cancel,
        policy,
    } = request;

    let payload = match deserialize_payload::<E>(event) {
        Ok(payload) => payload,
        Err(err) => {
            let raw = event.map_or_else(|| "null".to_owned(), Value::to_string);
            tracing::warn!(
                event_type = E::EVENT_TYPE,
                error = %err,
                raw = %raw,
                "Event payload does not match its schema"
            );
            return match policy.on_deserialization_failure {
                DeserializationFailurePolicy::Acknowledge => Ok(DispatchOutcome::new(
                    E::EVENT_TYPE,
                    DispatchStatus::PayloadSkipped,
                )),
                DeserializationFailurePolicy::Reject => Err(DispatchError::Deserialization {
                    event_type: E::EVENT_TYPE.to_owned(),
                    reason: err.to_string(),
                }),
            };
        }
    };

    let resolved = handlers.resolve::<E>(scope);
    if resolved.is_empty() {
        tracing::debug!(event_type = E::EVENT_TYPE, "No handlers registered");
        return Ok(DispatchOutcome::new(E::EVENT_TYPE, DispatchStatus::NoHandlers));
    }

    let typed = TypedEnvelope {
        user_id: envelope.user_id().to_owned(),
        instance_name: envelope.instance_name().to_owned(),
        event: payload,
        raw: envelope.shared_tree(),
    };

    let total = resolved.len();
    let mut failed = 0;

    for handler in &resolved {
        if cancel.is_cancelled() {
            tracing::debug!(
                event_type = E::EVENT_TYPE,
                handler = handler.name(),
                "Cancellation requested, skipping remaining handlers"
            );
            return Err(DispatchError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DispatchError::Cancelled),
            outcome = AssertUnwindSafe(async { handler.handle(&typed, cancel).await }).catch_unwind() => outcome,
        };

        match outcome {
            Ok(Ok(())) => {
                tracing::trace!(event_type = E::EVENT_TYPE, handler = handler.name(), "Handler succeeded");
            }
            Ok(Err(HandlerError::Cancelled)) if cancel.is_cancelled() => {
                return Err(DispatchError::Cancelled);
            }
            Ok(Err(err)) => {
                failed += 1;
                DispatchMetrics::record_handler_failure(E::EVENT_TYPE);
                tracing::error!(
                    event_type = E::EVENT_TYPE,
                    handler = handler.name(),
                    error = %err,
                    "Event handler failed"
                );
            }
            Err(panic) => {
                failed += 1;
                DispatchMetrics::record_handler_failure(E::EVENT_TYPE);
                tracing::error!(
                    event_type = E::EVENT_TYPE,
                    handler = handler.name(),
                    panic = %panic_message(panic.as_ref()),
                    "Event handler panicked"
                );
            }
        }
    }

    if failed == 0 {
        return Ok(DispatchOutcome::handled(E::EVENT_TYPE, total, 0));
    }

    match policy.on_handler_failure {
        HandlerFailurePolicy::FailMessage => Err(DispatchError::HandlerFailed {
            event_type: E::EVENT_TYPE.to_owned(),
            failed,
            total,
        }),
        HandlerFailurePolicy::Isolate => {
            tracing::warn!(
                event_type = E::EVENT_TYPE,
                failed,
                total,
                "Acknowledging despite handler failures"
            );
            Ok(DispatchOutcome::handled(E::EVENT_TYPE, total - failed, failed))
        }
    }
}

/// Strategy for event kinds outside the catalog.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackStrategy;

impl DispatchStrategy for FallbackStrategy {
    fn event_type(&self) -> Option<&'static str> {
        None
    }

    fn dispatch<'a>(
        &'a self,
        request: DispatchRequest<'a>,
    ) -> BoxFuture<'a, Result<DispatchOutcome, DispatchError>> {
        let event_type = request.envelope.event_type();
        tracing::debug!(event_type, "No strategy for event type, acknowledging");
        Box::pin(futures::future::ready(Ok(DispatchOutcome::new(
            event_type,
            DispatchStatus::Unrouted,
        ))))
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wa_relay_core::event::{Connected, Message};
    use wa_relay_core::{AckDecision, EventHandler, RoutingFields};

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl EventHandler<Message> for Counting {
        fn handle<'a>(
            &'a self,
            _envelope: &'a TypedEnvelope<Message>,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<(), HandlerError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err(HandlerError::failed("boom"))
                } else {
                    Ok(())
                }
            })
        }
    }

    struct Panicking;

    impl EventHandler<Message> for Panicking {
        fn handle<'a>(
            &'a self,
            _envelope: &'a TypedEnvelope<Message>,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<(), HandlerError>> {
            panic!("handler exploded")
        }
    }

    struct SelfCancelling;

    impl EventHandler<Message> for SelfCancelling {
        fn handle<'a>(
            &'a self,
            _envelope: &'a TypedEnvelope<Message>,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<(), HandlerError>> {
            Box::pin(async { Err(HandlerError::Cancelled) })
        }
    }

    fn message_envelope() -> Envelope {
        Envelope::from_value(json!({
            "type": "Message",
            "userID": "u1",
            "instanceName": "i1",
            "event": {"Info": {"Id": "m1"}}
        }))
        .unwrap()
    }

    async fn run<S: DispatchStrategy>(
        strategy: &S,
        envelope: &Envelope,
        handlers: &HandlerRegistry,
        policy: DispatchPolicy,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let scope = DispatchScope::new(1, RoutingFields::default());
        strategy
            .dispatch(DispatchRequest {
                event: envelope.event(),
                envelope,
                scope: &scope,
                handlers,
                cancel,
                policy,
            })
            .await
    }

    fn counting(calls: &Arc<AtomicUsize>, fail: bool) -> Counting {
        Counting {
            calls: Arc::clone(calls),
            fail,
        }
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = HandlerRegistry::builder()
            .handler::<Message, _>(counting(&calls, false))
            .handler::<Message, _>(Panicking)
            .handler::<Message, _>(counting(&calls, false))
            .build();

        let result = run(
            &TypedStrategy::<Message>::new(),
            &message_envelope(),
            &handlers,
            DispatchPolicy::default(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result,
            Err(DispatchError::HandlerFailed { failed: 1, total: 3, .. })
        ));
    }

    #[tokio::test]
    async fn isolate_policy_acknowledges_partial_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = HandlerRegistry::builder()
            .handler::<Message, _>(counting(&calls, true))
            .handler::<Message, _>(counting(&calls, false))
            .build();
        let policy = DispatchPolicy {
            on_handler_failure: HandlerFailurePolicy::Isolate,
            ..DispatchPolicy::default()
        };

        let outcome = run(
            &TypedStrategy::<Message>::new(),
            &message_envelope(),
            &handlers,
            policy,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.handlers_succeeded, 1);
        assert_eq!(outcome.handlers_failed, 1);
    }

    #[tokio::test]
    async fn schema_mismatch_follows_policy() {
        let envelope =
            Envelope::from_value(json!({"type": "Message", "event": {"Info": 42}})).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = HandlerRegistry::builder()
            .handler::<Message, _>(counting(&calls, false))
            .build();
        let strategy = TypedStrategy::<Message>::new();
        let cancel = CancellationToken::new();

        let skipped = run(&strategy, &envelope, &handlers, DispatchPolicy::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(skipped.status, DispatchStatus::PayloadSkipped);

        let reject = DispatchPolicy {
            on_deserialization_failure: DeserializationFailurePolicy::Reject,
            ..DispatchPolicy::default()
        };
        let rejected = run(&strategy, &envelope, &handlers, reject, &cancel).await;
        assert!(matches!(rejected, Err(DispatchError::Deserialization { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_skips_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = HandlerRegistry::builder()
            .handler::<Message, _>(counting(&calls, false))
            .build();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run(
            &TypedStrategy::<Message>::new(),
            &message_envelope(),
            &handlers,
            DispatchPolicy::default(),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(DispatchError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_cancelled_without_shutdown_counts_as_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = HandlerRegistry::builder()
            .handler::<Message, _>(counting(&calls, false))
            .handler::<Message, _>(SelfCancelling)
            .handler::<Message, _>(counting(&calls, false))
            .build();
        let cancel = CancellationToken::new();

        let result = run(
            &TypedStrategy::<Message>::new(),
            &message_envelope(),
            &handlers,
            DispatchPolicy::default(),
            &cancel,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cancel.is_cancelled());
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::HandlerFailed { failed: 1, total: 3, .. }
        ));
        assert_eq!(err.ack_decision(), AckDecision::REJECT);
    }

    #[tokio::test]
    async fn signal_only_kind_without_event_tree() {
        let envelope = Envelope::from_value(json!({"type": "Connected"})).unwrap();
        let outcome = run(
            &TypedStrategy::<Connected>::new(),
            &envelope,
            &HandlerRegistry::default(),
            DispatchPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.status, DispatchStatus::NoHandlers);
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let text: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(text.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
