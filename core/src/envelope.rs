//! The outer wire envelope published by the WhatsApp gateway.
//!
//! Every delivery body is a UTF-8 JSON object of the shape:
//!
//! ```text
//! {
//!   "type": "Message",          // required routing key
//!   "userID": "u1",             // optional, defaults to ""
//!   "instanceName": "i1",       // optional, defaults to ""
//!   "event": { ... }            // optional, type-specific payload
//! }
//! ```
//!
//! The body is parsed exactly once into a generic [`serde_json::Value`] tree.
//! Routing fields are read from the tree and the `event` sub-tree is handed to
//! the typed strategy without re-parsing.
//!
//! # Example
//!
//! ```
//! use wa_relay_core::envelope::Envelope;
//!
//! let envelope = Envelope::parse(br#"{"type":"Connected","userID":"u1"}"#).unwrap();
//! assert_eq!(envelope.event_type(), "Connected");
//! assert_eq!(envelope.user_id(), "u1");
//! assert_eq!(envelope.instance_name(), "");
//! assert!(envelope.event().is_none());
//! ```

use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Field carrying the routing key.
pub const TYPE_FIELD: &str = "type";
/// Field carrying the tenant (gateway user) id.
pub const USER_ID_FIELD: &str = "userID";
/// Field carrying the gateway instance name.
pub const INSTANCE_NAME_FIELD: &str = "instanceName";
/// Field carrying the type-specific payload.
pub const EVENT_FIELD: &str = "event";

/// Errors produced while reading an envelope from a delivery body.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The body is not valid UTF-8.
    #[error("Body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The body is not valid JSON.
    #[error("Body is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The body is valid JSON but not an object (e.g. `null` or an array).
    #[error("Envelope must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// The `type` field is missing, empty, or not a string.
    #[error("Envelope has no routable 'type' field")]
    MissingType,
}

impl EnvelopeError {
    /// Whether this error is a routing failure (the body parsed but cannot be routed).
    #[must_use]
    pub const fn is_routing_failure(&self) -> bool {
        matches!(self, Self::MissingType)
    }
}

/// Tenant and instance identifiers carried next to the routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RoutingFields {
    /// Gateway user (tenant) id, `""` when absent.
    pub user_id: String,
    /// Gateway instance name, `""` when absent.
    pub instance_name: String,
}

/// A parsed gateway envelope.
///
/// Cheap to clone: the parsed tree is shared behind an [`Arc`].
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    event_type: String,
    routing: RoutingFields,
    tree: Arc<Value>,
}

impl Envelope {
    /// Parse a delivery body.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::InvalidUtf8`] / [`EnvelopeError::Malformed`] /
    ///   [`EnvelopeError::NotAnObject`] when the body cannot be read (parse error)
    /// - [`EnvelopeError::MissingType`] when `type` is missing or empty (routing failure)
    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeError> {
        let text = std::str::from_utf8(body)?;
        let tree: Value = serde_json::from_str(text).map_err(EnvelopeError::Malformed)?;
        Self::from_value(tree)
    }

    /// Build an envelope from an already parsed tree.
    ///
    /// # Errors
    ///
    /// Same as [`Envelope::parse`] minus the UTF-8 and JSON syntax cases.
    pub fn from_value(tree: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(fields) = &tree else {
            return Err(EnvelopeError::NotAnObject(json_kind(&tree)));
        };

        let event_type = fields
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or(EnvelopeError::MissingType)?
            .to_owned();

        let routing = RoutingFields {
            user_id: string_field(fields, USER_ID_FIELD),
            instance_name: string_field(fields, INSTANCE_NAME_FIELD),
        };

        Ok(Self {
            event_type,
            routing,
            tree: Arc::new(tree),
        })
    }

    /// The routing key.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Tenant and instance identifiers.
    #[must_use]
    pub const fn routing(&self) -> &RoutingFields {
        &self.routing
    }

    /// Gateway user (tenant) id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.routing.user_id
    }

    /// Gateway instance name.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.routing.instance_name
    }

    /// The `event` sub-tree, `None` for signal-only envelopes or an explicit `null`.
    #[must_use]
    pub fn event(&self) -> Option<&Value> {
        self.tree.get(EVENT_FIELD).filter(|v| !v.is_null())
    }

    /// The full parsed tree.
    #[must_use]
    pub fn tree(&self) -> &Value {
        &self.tree
    }

    /// The full parsed tree, shared.
    #[must_use]
    pub fn shared_tree(&self) -> Arc<Value> {
        Arc::clone(&self.tree)
    }
}

fn string_field(fields: &Map<String, Value>, key: &str) -> String {
    fields
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
