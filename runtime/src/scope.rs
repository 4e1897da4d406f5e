//! Handler registration and per-dispatch scopes.
//!
//! A [`HandlerRegistry`] is built once at startup and never changes. For every
//! dispatch the dispatcher opens a fresh [`DispatchScope`]; handler factories
//! run against that scope, so scoped collaborators live for exactly one message
//! and are dropped with the scope.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use wa_relay_core::{EventHandler, GatewayEvent, RoutingFields};

/// Builds a handler for one dispatch.
pub type HandlerFactory<E> =
    Arc<dyn Fn(&DispatchScope) -> Arc<dyn EventHandler<E>> + Send + Sync + 'static>;

/// Per-message context handed to handler factories.
pub struct DispatchScope {
    id: u64,
    routing: RoutingFields,
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DispatchScope {
    /// Open a scope for one dispatch.
    #[must_use]
    pub fn new(id: u64, routing: RoutingFields) -> Self {
        Self {
            id,
            routing,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Process-unique id of this dispatch.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Routing fields of the envelope being dispatched.
    #[must_use]
    pub const fn routing(&self) -> &RoutingFields {
        &self.routing
    }

    /// The scope's instance of `T`, created by `init` on first use.
    ///
    /// All handlers resolved for the same dispatch share the instance. `init`
    /// runs under the scope's lock and must not call back into the scope.
    pub fn get_or_insert_with<T, F>(&self, init: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = services
            .get(&TypeId::of::<T>())
            .and_then(|service| Arc::clone(service).downcast::<T>().ok())
        {
            return existing;
        }

        let service = Arc::new(init());
        services.insert(
            TypeId::of::<T>(),
            Arc::clone(&service) as Arc<dyn Any + Send + Sync>,
        );
        service
    }

    /// The scope's instance of `T`, if one was created.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
            .and_then(|service| Arc::clone(service).downcast::<T>().ok())
    }
}

impl fmt::Debug for DispatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchScope")
            .field("id", &self.id)
            .field("routing", &self.routing)
            .finish_non_exhaustive()
    }
}

/// Immutable map from event kind to handler factories.
///
/// # Example
///
/// ```rust,ignore
/// let handlers = HandlerRegistry::builder()
///     .handler::<Message, _>(StoreMessage::new(pool))
///     .scoped::<Message, _, _>(|scope| AuditMessage::new(scope.routing().clone()))
///     .build();
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    // TypeId::of::<E>() -> Vec<HandlerFactory<E>>
    factories: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl HandlerRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder {
            factories: HashMap::new(),
        }
    }

    /// Resolve every handler for `E` against `scope`, in registration order.
    #[must_use]
    pub fn resolve<E: GatewayEvent>(&self, scope: &DispatchScope) -> Vec<Arc<dyn EventHandler<E>>> {
        self.factories_for::<E>()
            .map(|factories| factories.iter().map(|factory| factory(scope)).collect())
            .unwrap_or_default()
    }

    /// Number of handlers registered for `E`.
    #[must_use]
    pub fn handler_count<E: GatewayEvent>(&self) -> usize {
        self.factories_for::<E>().map_or(0, Vec::len)
    }

    /// Whether no handler is registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn factories_for<E: GatewayEvent>(&self) -> Option<&Vec<HandlerFactory<E>>> {
        self.factories
            .get(&TypeId::of::<E>())
            .and_then(|entry| entry.downcast_ref::<Vec<HandlerFactory<E>>>())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_kinds", &self.factories.len())
            .finish()
    }
}

/// Builder for [`HandlerRegistry`].
pub struct HandlerRegistryBuilder {
    factories: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl HandlerRegistryBuilder {
    /// Register a handler instance shared by every dispatch.
    #[must_use]
    pub fn handler<E, H>(self, handler: H) -> Self
    where
        E: GatewayEvent,
        H: EventHandler<E> + 'static,
    {
        self.shared::<E>(Arc::new(handler))
    }

    /// Register an already shared handler instance.
    #[must_use]
    pub fn shared<E: GatewayEvent>(self, handler: Arc<dyn EventHandler<E>>) -> Self {
        self.factory::<E>(Arc::new(move |_: &DispatchScope| Arc::clone(&handler)))
    }

    /// Register a factory that builds a fresh handler for every dispatch.
    #[must_use]
    pub fn scoped<E, H, F>(self, factory: F) -> Self
    where
        E: GatewayEvent,
        H: EventHandler<E> + 'static,
        F: Fn(&DispatchScope) -> H + Send + Sync + 'static,
    {
        self.factory::<E>(Arc::new(
            move |scope: &DispatchScope| -> Arc<dyn EventHandler<E>> { Arc::new(factory(scope)) },
        ))
    }

    /// Register a raw handler factory.
    #[must_use]
    pub fn factory<E: GatewayEvent>(mut self, factory: HandlerFactory<E>) -> Self {
        let entry = self
            .factories
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<HandlerFactory<E>>::new()) as Box<dyn Any + Send + Sync>);
        if let Some(factories) = entry.downcast_mut::<Vec<HandlerFactory<E>>>() {
            factories.push(factory);
        }
        self
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            factories: self.factories,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wa_relay_core::event::{Connected, Message};
    use wa_relay_core::{CancellationToken, HandlerError, TypedEnvelope};

    struct Noop;

    impl<E: GatewayEvent> EventHandler<E> for Noop {
        fn handle<'a>(
            &'a self,
            _envelope: &'a TypedEnvelope<E>,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<(), HandlerError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn scope(id: u64) -> DispatchScope {
        DispatchScope::new(id, RoutingFields::default())
    }

    #[test]
    fn resolves_per_event_kind() {
        let registry = HandlerRegistry::builder()
            .handler::<Message, _>(Noop)
            .handler::<Message, _>(Noop)
            .handler::<Connected, _>(Noop)
            .build();

        assert_eq!(registry.handler_count::<Message>(), 2);
        assert_eq!(registry.resolve::<Message>(&scope(1)).len(), 2);
        assert_eq!(registry.resolve::<Connected>(&scope(1)).len(), 1);
        assert!(registry.resolve::<wa_relay_core::event::Qr>(&scope(1)).is_empty());
    }

    #[test]
    fn scoped_factories_run_per_dispatch() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let registry = HandlerRegistry::builder()
            .scoped::<Message, _, _>(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Noop
            })
            .build();

        assert_eq!(registry.resolve::<Message>(&scope(1)).len(), 1);
        assert_eq!(registry.resolve::<Message>(&scope(2)).len(), 1);
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn scope_services_are_shared_within_a_dispatch() {
        let scope = scope(7);
        let first = scope.get_or_insert_with(|| AtomicUsize::new(1));
        let second = scope.get_or_insert_with(|| AtomicUsize::new(99));
        first.fetch_add(1, Ordering::SeqCst);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert!(scope.get::<String>().is_none());

        let other = DispatchScope::new(8, RoutingFields::default());
        assert_eq!(other.get_or_insert_with(|| AtomicUsize::new(5)).load(Ordering::SeqCst), 5);
    }
}
