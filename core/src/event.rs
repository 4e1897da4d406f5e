//! The closed catalog of gateway events.
//!
//! Each event kind is a Rust type implementing [`GatewayEvent`], which ties the
//! wire-level `type` tag to the payload shape the `event` sub-tree deserializes
//! into. Adding a kind is a code change: define the payload, implement the
//! trait, and list the tag in [`ALL_EVENT_TYPES`].
//!
//! Only a handful of payloads carry strongly typed fields. The rest are opaque
//! JSON objects: their shapes are owned by the gateway and handlers that care
//! can pick fields out with [`OpaquePayload::get`]-style accessors.
//!
//! Payload field names follow the gateway's PascalCase JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// A gateway event kind.
///
/// The associated tag is matched ordinally against the envelope's `type` field.
///
/// # Example
///
/// ```
/// use wa_relay_core::event::{GatewayEvent, Message};
///
/// assert_eq!(Message::EVENT_TYPE, "Message");
/// ```
pub trait GatewayEvent: DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Wire-level `type` tag for this kind.
    const EVENT_TYPE: &'static str;
}

/// A strongly typed event together with the routing fields of its envelope.
///
/// This is what handlers receive.
#[derive(Debug, Clone)]
pub struct TypedEnvelope<E> {
    /// Gateway user (tenant) id.
    pub user_id: String,
    /// Gateway instance name.
    pub instance_name: String,
    /// The deserialized payload.
    pub event: E,
    /// The full envelope tree as received.
    pub raw: Arc<Value>,
}

impl<E: GatewayEvent> TypedEnvelope<E> {
    /// The wire-level tag of the event.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        E::EVENT_TYPE
    }
}

macro_rules! gateway_event {
    ($name:ident => $tag:literal) => {
        impl GatewayEvent for $name {
            const EVENT_TYPE: &'static str = $tag;
        }
    };
}

/// Declares opaque payloads: a transparent JSON object per tag.
macro_rules! opaque_events {
    ($($(#[$meta:meta])* $name:ident => $tag:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub Map<String, Value>);

            impl OpaquePayload for $name {
                fn fields(&self) -> &Map<String, Value> {
                    &self.0
                }
            }

            gateway_event!($name => $tag);
        )*
    };
}

/// Field access for payloads whose shape is not modelled.
pub trait OpaquePayload {
    /// All fields of the payload object.
    fn fields(&self) -> &Map<String, Value>;

    /// A single field by its wire name.
    fn get(&self, key: &str) -> Option<&Value> {
        self.fields().get(key)
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// Metadata of a received message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MessageInfo {
    /// Message id.
    #[serde(alias = "ID")]
    pub id: String,
    /// Chat JID the message belongs to.
    pub chat: String,
    /// Sender JID.
    pub sender: String,
    /// Whether the message was sent by the paired account.
    pub is_from_me: bool,
    /// Whether the chat is a group.
    pub is_group: bool,
    /// Sender's push name.
    pub push_name: String,
    /// RFC 3339 timestamp as sent by the gateway.
    pub timestamp: Option<String>,
    /// Message kind (`text`, `media`, ...).
    #[serde(rename = "Type")]
    pub kind: String,
}

/// A message was received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Message {
    /// Message metadata.
    pub info: MessageInfo,
    /// The protocol message body, left opaque.
    pub message: Value,
    /// Whether the message was ephemeral.
    pub is_ephemeral: bool,
    /// Whether the message was view-once.
    pub is_view_once: bool,
    /// Whether the message was edited.
    pub is_edit: bool,
}
gateway_event!(Message => "Message");

/// A delivery or read receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ReadReceipt {
    /// Ids of the acknowledged messages.
    #[serde(rename = "MessageIDs", alias = "MessageIds")]
    pub message_ids: Vec<String>,
    /// Chat JID.
    pub chat: String,
    /// Receipt author JID.
    pub sender: String,
    /// Receipt kind (`read`, `delivered`, `played`, ...).
    #[serde(rename = "Type")]
    pub kind: String,
    /// RFC 3339 timestamp.
    pub timestamp: Option<String>,
}
gateway_event!(ReadReceipt => "ReadReceipt");

/// A contact came online or went offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Presence {
    /// Contact JID.
    pub from: String,
    /// Whether the contact is now unavailable.
    pub unavailable: bool,
    /// RFC 3339 last-seen timestamp, when shared.
    pub last_seen: Option<String>,
}
gateway_event!(Presence => "Presence");

/// Typing / recording indicator inside a chat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ChatPresence {
    /// Chat JID.
    pub chat: String,
    /// Participant JID.
    pub sender: String,
    /// `composing` or `paused`.
    pub state: String,
    /// `audio` when recording, empty otherwise.
    pub media: String,
}
gateway_event!(ChatPresence => "ChatPresence");

/// The session is connected to the WhatsApp servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {}
gateway_event!(Connected => "Connected");

/// A pairing QR code is available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Qr {
    /// QR code payloads, in rotation order.
    pub codes: Vec<String>,
}
gateway_event!(Qr => "QR");

/// A device was paired successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct PairSuccess {
    /// Paired JID.
    #[serde(rename = "ID", alias = "Id")]
    pub id: String,
    /// Business name, empty for personal accounts.
    pub business_name: String,
    /// Platform reported by the phone.
    pub platform: String,
}
gateway_event!(PairSuccess => "PairSuccess");

/// The session was logged out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LoggedOut {
    /// Whether the logout happened while connecting.
    pub on_connect: bool,
    /// Gateway-specific reason code.
    pub reason: Value,
}
gateway_event!(LoggedOut => "LoggedOut");

// ---------------------------------------------------------------------------
// Opaque payloads
// ---------------------------------------------------------------------------

opaque_events! {
    /// A message could not be decrypted.
    UndecryptableMessage => "UndecryptableMessage",
    /// History sync blob.
    HistorySync => "HistorySync",
    /// Preview of the offline sync backlog.
    OfflineSyncPreview => "OfflineSyncPreview",
    /// Offline sync finished.
    OfflineSyncCompleted => "OfflineSyncCompleted",
    /// App-state sync finished.
    AppStateSyncComplete => "AppStateSyncComplete",
    /// The socket was disconnected.
    Disconnected => "Disconnected",
    /// Connecting failed.
    ConnectFailure => "ConnectFailure",
    /// Another client took over the session.
    StreamReplaced => "StreamReplaced",
    /// Stream-level protocol error.
    StreamError => "StreamError",
    /// Keep-alive pings stopped being answered.
    KeepAliveTimeout => "KeepAliveTimeout",
    /// Keep-alive pings are answered again.
    KeepAliveRestored => "KeepAliveRestored",
    /// The client version is too old.
    ClientOutdated => "ClientOutdated",
    /// The account is temporarily banned.
    TemporaryBan => "TemporaryBan",
    /// Pairing failed.
    PairError => "PairError",
    /// A QR code was scanned by a phone without multi-device support.
    QrScannedWithoutMultidevice => "QRScannedWithoutMultidevice",
    /// Incoming call offer.
    CallOffer => "CallOffer",
    /// A call was accepted.
    CallAccept => "CallAccept",
    /// A call ended.
    CallTerminate => "CallTerminate",
    /// Group call offer notice.
    CallOfferNotice => "CallOfferNotice",
    /// Call relay latency report.
    CallRelayLatency => "CallRelayLatency",
    /// Group metadata changed.
    GroupInfo => "GroupInfo",
    /// The account joined a group.
    JoinedGroup => "JoinedGroup",
    /// A profile or group picture changed.
    Picture => "Picture",
    /// A contact's identity key changed.
    IdentityChange => "IdentityChange",
    /// Privacy settings changed.
    PrivacySettings => "PrivacySettings",
    /// The account's push name changed.
    PushNameSetting => "PushNameSetting",
    /// The block list changed.
    BlocklistChange => "BlocklistChange",
    /// Full block list snapshot.
    Blocklist => "Blocklist",
    /// A contact's about text changed.
    UserAbout => "UserAbout",
    /// Joined a newsletter.
    NewsletterJoin => "NewsletterJoin",
    /// Left a newsletter.
    NewsletterLeave => "NewsletterLeave",
    /// Newsletter mute state changed.
    NewsletterMuteChange => "NewsletterMuteChange",
    /// Live newsletter update.
    NewsletterLiveUpdate => "NewsletterLiveUpdate",
    /// A chat was archived or unarchived.
    Archive => "Archive",
    /// A chat was pinned or unpinned.
    Pin => "Pin",
    /// A chat was muted or unmuted.
    Mute => "Mute",
    /// A message was starred or unstarred.
    Star => "Star",
    /// A message was deleted for the account only.
    DeleteForMe => "DeleteForMe",
    /// A chat was marked as read.
    MarkChatAsRead => "MarkChatAsRead",
    /// A label was created or edited.
    LabelEdit => "LabelEdit",
}

/// Every tag in the catalog, in declaration order.
pub const ALL_EVENT_TYPES: &[&str] = &[
    Message::EVENT_TYPE,
    ReadReceipt::EVENT_TYPE,
    Presence::EVENT_TYPE,
    ChatPresence::EVENT_TYPE,
    Connected::EVENT_TYPE,
    Qr::EVENT_TYPE,
    PairSuccess::EVENT_TYPE,
    LoggedOut::EVENT_TYPE,
    UndecryptableMessage::EVENT_TYPE,
    HistorySync::EVENT_TYPE,
    OfflineSyncPreview::EVENT_TYPE,
    OfflineSyncCompleted::EVENT_TYPE,
    AppStateSyncComplete::EVENT_TYPE,
    Disconnected::EVENT_TYPE,
    ConnectFailure::EVENT_TYPE,
    StreamReplaced::EVENT_TYPE,
    StreamError::EVENT_TYPE,
    KeepAliveTimeout::EVENT_TYPE,
    KeepAliveRestored::EVENT_TYPE,
    ClientOutdated::EVENT_TYPE,
    TemporaryBan::EVENT_TYPE,
    PairError::EVENT_TYPE,
    QrScannedWithoutMultidevice::EVENT_TYPE,
    CallOffer::EVENT_TYPE,
    CallAccept::EVENT_TYPE,
    CallTerminate::EVENT_TYPE,
    CallOfferNotice::EVENT_TYPE,
    CallRelayLatency::EVENT_TYPE,
    GroupInfo::EVENT_TYPE,
    JoinedGroup::EVENT_TYPE,
    Picture::EVENT_TYPE,
    IdentityChange::EVENT_TYPE,
    PrivacySettings::EVENT_TYPE,
    PushNameSetting::EVENT_TYPE,
    BlocklistChange::EVENT_TYPE,
    Blocklist::EVENT_TYPE,
    UserAbout::EVENT_TYPE,
    NewsletterJoin::EVENT_TYPE,
    NewsletterLeave::EVENT_TYPE,
    NewsletterMuteChange::EVENT_TYPE,
    NewsletterLiveUpdate::EVENT_TYPE,
    Archive::EVENT_TYPE,
    Pin::EVENT_TYPE,
    Mute::EVENT_TYPE,
    Star::EVENT_TYPE,
    DeleteForMe::EVENT_TYPE,
    MarkChatAsRead::EVENT_TYPE,
    LabelEdit::EVENT_TYPE,
];

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn tags_are_unique_and_non_empty() {
        let unique: HashSet<_> = ALL_EVENT_TYPES.iter().collect();
        assert_eq!(unique.len(), ALL_EVENT_TYPES.len());
        assert!(ALL_EVENT_TYPES.iter().all(|t| !t.is_empty()));
    }

    #[test]
    fn message_reads_pascal_case_info() {
        let message: Message =
            serde_json::from_value(json!({"Info": {"Id": "m1", "Chat": "c@s.whatsapp.net"}}))
                .unwrap();
        assert_eq!(message.info.id, "m1");
        assert_eq!(message.info.chat, "c@s.whatsapp.net");

        let upper: Message = serde_json::from_value(json!({"Info": {"ID": "m2"}})).unwrap();
        assert_eq!(upper.info.id, "m2");
    }

    #[test]
    fn message_rejects_mistyped_info() {
        assert!(serde_json::from_value::<Message>(json!({"Info": 5})).is_err());
    }

    #[test]
    fn connected_accepts_any_object() {
        serde_json::from_value::<Connected>(json!({})).unwrap();
        serde_json::from_value::<Connected>(json!({"extra": true})).unwrap();
    }

    #[test]
    fn opaque_payload_exposes_fields() {
        let info: GroupInfo = serde_json::from_value(json!({"JID": "g@g.us"})).unwrap();
        assert_eq!(info.get("JID"), Some(&json!("g@g.us")));
        assert!(serde_json::from_value::<GroupInfo>(json!([1, 2])).is_err());
    }
}
