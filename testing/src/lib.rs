//! # wa-relay testing
//!
//! Test doubles for the relay:
//!
//! - [`InMemoryBroker`]: queues, deliveries, ack/nack bookkeeping and
//!   connection kills, without a RabbitMQ node
//! - [`ScriptedConnector`]: a connector that fails on demand
//! - [`RecordingHandler`], [`FailingHandler`], [`SlowHandler`]: handlers for
//!   asserting on dispatch
//!
//! ## Example
//!
//! ```ignore
//! use wa_relay_testing::{InMemoryBroker, RecordingHandler, message_envelope};
//!
//! #[tokio::test]
//! async fn message_reaches_handler() {
//!     let broker = InMemoryBroker::new();
//!     let recorder = RecordingHandler::<Message>::new();
//!     // ... build and start a consumer on broker.connector() ...
//!
//!     broker.publish_json("whatsapp-events", &message_envelope("m1", "u1", "i1"));
//!     broker.wait_for_settlements(1, Duration::from_secs(1)).await.unwrap();
//!     assert_eq!(recorder.count(), 1);
//! }
//! ```

use serde_json::{Value, json};

/// In-memory broker and scripted connector.
pub mod broker;

/// Recording, failing and slow handlers.
pub mod handlers;

pub use broker::{InMemoryBroker, ScriptedConnector, Settlement};
pub use handlers::{FailingHandler, RecordingHandler, SlowHandler};

/// An envelope with the given `type` and `event` sub-tree.
#[must_use]
pub fn envelope(event_type: &str, event: Value) -> Value {
    json!({
        "type": event_type,
        "userID": "",
        "instanceName": "",
        "event": event,
    })
}

/// A `Message` envelope carrying `Info.Id`.
#[must_use]
pub fn message_envelope(message_id: &str, user_id: &str, instance_name: &str) -> Value {
    json!({
        "type": "Message",
        "userID": user_id,
        "instanceName": instance_name,
        "event": {"Info": {"Id": message_id}},
    })
}

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
