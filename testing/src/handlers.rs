//! Handlers for exercising dispatch.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use wa_relay_core::{CancellationToken, EventHandler, GatewayEvent, HandlerError, TypedEnvelope};

/// Records every envelope it handles.
///
/// Clones share the same record, so a test can keep one clone and register
/// another.
pub struct RecordingHandler<E> {
    name: String,
    seen: Arc<Mutex<Vec<TypedEnvelope<E>>>>,
}

impl<E: GatewayEvent + Clone> RecordingHandler<E> {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::named("recording")
    }

    /// Create an empty recorder with a name used in logs.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A registrable handle sharing this recorder.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn EventHandler<E>> {
        Arc::new(self.clone())
    }

    /// Envelopes handled so far.
    #[must_use]
    pub fn events(&self) -> Vec<TypedEnvelope<E>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of envelopes handled so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<E: GatewayEvent + Clone> Default for RecordingHandler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for RecordingHandler<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            seen: Arc::clone(&self.seen),
        }
    }
}

impl<E: GatewayEvent + Clone> EventHandler<E> for RecordingHandler<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(
        &'a self,
        envelope: &'a TypedEnvelope<E>,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope.clone());
        Box::pin(futures::future::ready(Ok(())))
    }
}

/// Always fails, counting its calls.
#[derive(Clone)]
pub struct FailingHandler {
    name: String,
    calls: Arc<AtomicUsize>,
}

impl FailingHandler {
    /// Create a failing handler.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Times the handler was invoked.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<E: GatewayEvent> EventHandler<E> for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(
        &'a self,
        _envelope: &'a TypedEnvelope<E>,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(futures::future::ready(Err(HandlerError::failed(format!(
            "{} always fails",
            self.name
        )))))
    }
}

/// Sleeps for a fixed time and tracks how many calls overlap.
///
/// The sleep ignores the cancellation token, so cancellation only takes
/// effect by the dispatcher dropping the call.
#[derive(Clone)]
pub struct SlowHandler {
    delay: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    started: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl SlowHandler {
    /// Create a handler taking `delay` per call.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Highest number of calls running at the same time.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Calls currently running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Calls started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Calls that ran to completion.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

/// Decrements the active count even when the call is dropped mid-sleep.
struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<E: GatewayEvent> EventHandler<E> for SlowHandler {
    fn name(&self) -> &str {
        "slow"
    }

    fn handle<'a>(
        &'a self,
        _envelope: &'a TypedEnvelope<E>,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            let _active = Active(&self.active);
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
