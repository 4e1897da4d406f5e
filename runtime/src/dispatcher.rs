//! Routes raw delivery bodies to typed strategies.

use crate::metrics::DispatchMetrics;
use crate::registry::DispatcherRegistry;
use crate::scope::{DispatchScope, HandlerRegistry};
use crate::strategy::{DispatchRequest, panic_message};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use wa_relay_core::{
    CancellationToken, DispatchError, DispatchOutcome, DispatchPolicy, DispatchStatus, Envelope,
    EventFilter, RelayConfig,
};

/// Parses each delivery once and hands it to the strategy for its `type`.
///
/// A dispatch always concludes with a `Result`: parse and routing failures,
/// handler failures and even panics inside a strategy come back as
/// [`DispatchError`], never as an unwinding task.
#[derive(Debug)]
pub struct Dispatcher {
    registry: DispatcherRegistry,
    handlers: HandlerRegistry,
    policy: DispatchPolicy,
    filter: EventFilter,
    next_scope: AtomicU64,
}

impl Dispatcher {
    /// A dispatcher with default policies and no filter.
    #[must_use]
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            registry: DispatcherRegistry::new(),
            handlers,
            policy: DispatchPolicy::default(),
            filter: EventFilter::default(),
            next_scope: AtomicU64::new(1),
        }
    }

    /// A dispatcher using the policies and filter of `config`.
    #[must_use]
    pub fn from_config(handlers: HandlerRegistry, config: &RelayConfig) -> Self {
        Self::new(handlers)
            .with_policy(config.dispatch)
            .with_filter(config.filter.clone())
    }

    /// Replace the failure policies.
    #[must_use]
    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the tenant / instance filter.
    #[must_use]
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    /// The strategy table.
    #[must_use]
    pub const fn registry(&self) -> &DispatcherRegistry {
        &self.registry
    }

    /// The failure policies in effect.
    #[must_use]
    pub const fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Dispatch one delivery body.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Parse`] when the body is not a JSON object
    /// - [`DispatchError::Routing`] when `type` is missing or empty
    /// - whatever the resolved strategy reports
    /// - [`DispatchError::Internal`] when the strategy panicked
    pub async fn dispatch(
        &self,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();

        let envelope = match Envelope::parse(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                let err = DispatchError::from(err);
                tracing::warn!(
                    kind = err.kind(),
                    error = %err,
                    body_len = body.len(),
                    "Rejecting unreadable delivery"
                );
                DispatchMetrics::record_failure(err.kind());
                return Err(err);
            }
        };

        let result = self.dispatch_envelope(&envelope, cancel).await;

        DispatchMetrics::record_dispatch(envelope.event_type(), started.elapsed());
        if let Err(err) = &result {
            DispatchMetrics::record_failure(err.kind());
        }
        result
    }

    /// Dispatch an already parsed envelope.
    ///
    /// # Errors
    ///
    /// Same as [`Dispatcher::dispatch`] minus the parse failures.
    pub async fn dispatch_envelope(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        if !self.filter.allows(envelope.routing()) {
            tracing::debug!(
                event_type = envelope.event_type(),
                user_id = envelope.user_id(),
                instance_name = envelope.instance_name(),
                "Envelope filtered out"
            );
            return Ok(DispatchOutcome::new(
                envelope.event_type(),
                DispatchStatus::Filtered,
            ));
        }

        let strategy = self.registry.strategy_for(envelope.event_type());
        let scope = DispatchScope::new(
            self.next_scope.fetch_add(1, Ordering::Relaxed),
            envelope.routing().clone(),
        );
        let request = DispatchRequest {
            event: envelope.event(),
            envelope,
            scope: &scope,
            handlers: &self.handlers,
            cancel,
            policy: self.policy,
        };

        tracing::trace!(
            event_type = envelope.event_type(),
            scope = scope.id(),
            "Dispatching envelope"
        );

        match AssertUnwindSafe(async { strategy.dispatch(request).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    event_type = envelope.event_type(),
                    panic = %message,
                    "Dispatch strategy panicked"
                );
                Err(DispatchError::Internal(message))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use wa_relay_core::event::Message;
    use wa_relay_testing::RecordingHandler;

    #[tokio::test]
    async fn missing_or_empty_type_is_a_routing_failure() {
        let recorder = RecordingHandler::<Message>::new();
        let dispatcher = Dispatcher::new(
            HandlerRegistry::builder()
                .shared::<Message>(recorder.handler())
                .build(),
        );
        let cancel = CancellationToken::new();

        for body in [
            br#"{"event":{}}"#.as_slice(),
            br#"{"type":"","event":{}}"#,
            br#"{"type":7}"#,
        ] {
            let result = dispatcher.dispatch(body, &cancel).await;
            assert!(matches!(result, Err(DispatchError::Routing(_))), "{result:?}");
        }
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test]
    async fn non_object_bodies_are_parse_failures() {
        let dispatcher = Dispatcher::new(HandlerRegistry::default());
        let cancel = CancellationToken::new();

        for body in [b"null".as_slice(), b"[]", b"\xff\xfe", br#"{"bogus":"json""#] {
            let result = dispatcher.dispatch(body, &cancel).await;
            assert!(matches!(result, Err(DispatchError::Parse(_))), "{result:?}");
        }
    }

    #[tokio::test]
    async fn filter_skips_other_tenants() {
        let recorder = RecordingHandler::<Message>::new();
        let filter = EventFilter {
            user_ids: Some(BTreeSet::from(["u1".to_string()])),
            instance_names: None,
        };
        let dispatcher = Dispatcher::new(
            HandlerRegistry::builder()
                .shared::<Message>(recorder.handler())
                .build(),
        )
        .with_filter(filter);
        let cancel = CancellationToken::new();

        let other = br#"{"type":"Message","userID":"u2","event":{"Info":{"Id":"m1"}}}"#;
        let outcome = dispatcher.dispatch(other, &cancel).await.unwrap();
        assert_eq!(outcome.status, DispatchStatus::Filtered);
        assert_eq!(recorder.count(), 0);

        let mine = br#"{"type":"Message","userID":"u1","event":{"Info":{"Id":"m1"}}}"#;
        let outcome = dispatcher.dispatch(mine, &cancel).await.unwrap();
        assert_eq!(outcome.status, DispatchStatus::Handled);
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn scopes_are_fresh_per_dispatch() {
        let dispatcher = Dispatcher::new(HandlerRegistry::default());
        let cancel = CancellationToken::new();
        let body = br#"{"type":"Connected","event":{}}"#;

        dispatcher.dispatch(body, &cancel).await.unwrap();
        dispatcher.dispatch(body, &cancel).await.unwrap();

        assert_eq!(dispatcher.next_scope.load(Ordering::Relaxed), 3);
    }
}
