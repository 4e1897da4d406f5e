//! Event type → strategy table.
//!
//! The table is built once from the event catalog and is read-only afterwards,
//! so lookups need no synchronization. Lookups never fail: anything outside the
//! catalog, including the empty string, resolves to the shared fallback.

use crate::strategy::{DispatchStrategy, FallbackStrategy, TypedStrategy};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use wa_relay_core::GatewayEvent;
use wa_relay_core::event::{self, ALL_EVENT_TYPES};

macro_rules! register_events {
    ($registry:ident: $($event:ident),* $(,)?) => {
        $( $registry.register::<event::$event>(); )*
    };
}

/// Immutable map from wire-level `type` tag to dispatch strategy.
pub struct DispatcherRegistry {
    strategies: HashMap<&'static str, Arc<dyn DispatchStrategy>>,
    fallback: Arc<dyn DispatchStrategy>,
}

impl DispatcherRegistry {
    /// Build the table for the whole event catalog.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            strategies: HashMap::with_capacity(ALL_EVENT_TYPES.len()),
            fallback: Arc::new(FallbackStrategy),
        };

        register_events!(registry:
            Message, ReadReceipt, Presence, ChatPresence, Connected, Qr, PairSuccess, LoggedOut,
            UndecryptableMessage, HistorySync, OfflineSyncPreview, OfflineSyncCompleted,
            AppStateSyncComplete, Disconnected, ConnectFailure, StreamReplaced, StreamError,
            KeepAliveTimeout, KeepAliveRestored, ClientOutdated, TemporaryBan, PairError,
            QrScannedWithoutMultidevice, CallOffer, CallAccept, CallTerminate, CallOfferNotice,
            CallRelayLatency, GroupInfo, JoinedGroup, Picture, IdentityChange, PrivacySettings,
            PushNameSetting, BlocklistChange, Blocklist, UserAbout, NewsletterJoin,
            NewsletterLeave, NewsletterMuteChange, NewsletterLiveUpdate, Archive, Pin, Mute, Star,
            DeleteForMe, MarkChatAsRead, LabelEdit,
        );

        registry
    }

    fn register<E: GatewayEvent>(&mut self) {
        self.strategies
            .insert(E::EVENT_TYPE, Arc::new(TypedStrategy::<E>::new()));
    }

    /// The strategy for `event_type`, or the fallback. Matching is exact and case-sensitive.
    #[must_use]
    pub fn strategy_for(&self, event_type: &str) -> &Arc<dyn DispatchStrategy> {
        self.strategies.get(event_type).unwrap_or(&self.fallback)
    }

    /// The shared fallback strategy.
    #[must_use]
    pub const fn fallback(&self) -> &Arc<dyn DispatchStrategy> {
        &self.fallback
    }

    /// Whether `event_type` has its own strategy.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.strategies.contains_key(event_type)
    }

    /// Number of typed strategies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Whether the table has no typed strategies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl Default for DispatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DispatcherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherRegistry")
            .field("strategies", &self.strategies.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn every_catalog_tag_has_its_own_strategy() {
        let registry = DispatcherRegistry::new();
        assert_eq!(registry.len(), ALL_EVENT_TYPES.len());

        for tag in ALL_EVENT_TYPES {
            let strategy = registry.strategy_for(tag);
            assert!(!Arc::ptr_eq(strategy, registry.fallback()), "{tag} fell back");
            assert_eq!(strategy.event_type(), Some(*tag));
        }
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let registry = DispatcherRegistry::new();
        assert!(registry.contains("Message"));
        assert!(Arc::ptr_eq(registry.strategy_for("message"), registry.fallback()));
        assert!(Arc::ptr_eq(registry.strategy_for(""), registry.fallback()));
        assert!(Arc::ptr_eq(registry.strategy_for("Message "), registry.fallback()));
    }

    proptest! {
        #[test]
        fn unknown_tags_share_the_fallback(tag in "\\PC*") {
            prop_assume!(!ALL_EVENT_TYPES.contains(&tag.as_str()));
            let registry = DispatcherRegistry::new();
            let strategy = registry.strategy_for(&tag);
            prop_assert!(Arc::ptr_eq(strategy, registry.fallback()));
            prop_assert_eq!(strategy.event_type(), None);
        }
    }
}
