//! Supervisor behaviour across broker outages.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;
use wa_relay_core::event::Message;
use wa_relay_core::{AckDecision, CancellationToken, ConsumerConfig};
use wa_relay_runtime::{
    ConnectionError, ConnectionManager, ConsumerError, ConsumerState, ConsumerSupervisor,
    Dispatcher, EventConsumer, HandlerRegistry, RetryPolicy,
};
use wa_relay_testing::{InMemoryBroker, RecordingHandler, ScriptedConnector, message_envelope};

const QUEUE: &str = "whatsapp-events";
const WAIT: Duration = Duration::from_secs(5);

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .initial_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(20))
        .build()
}

fn consumer(
    connection: ConnectionManager,
    handlers: HandlerRegistry,
) -> Arc<EventConsumer> {
    let config = ConsumerConfig {
        queue_name: QUEUE.to_string(),
        ..ConsumerConfig::default()
    };
    Arc::new(EventConsumer::new(
        config,
        Arc::new(connection),
        Arc::new(Dispatcher::new(handlers)),
    ))
}

async fn wait_for_tags(broker: &InMemoryBroker, expected: &[&str]) {
    tokio::time::timeout(WAIT, async {
        while broker.consumer_tags() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumer tags did not settle");
}

#[tokio::test]
async fn restarts_the_consumer_after_the_connection_dies() {
    let broker = InMemoryBroker::new();
    let recorder = RecordingHandler::<Message>::new();
    let handlers = HandlerRegistry::builder()
        .shared::<Message>(recorder.handler())
        .build();
    let consumer = consumer(
        ConnectionManager::with_policy(broker.connector(), policy(5)),
        handlers,
    );

    let shutdown = CancellationToken::new();
    let supervisor = ConsumerSupervisor::new(Arc::clone(&consumer));
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { supervisor.run(shutdown).await }
    });

    wait_for_tags(&broker, &["wa-relay-whatsapp-events-1"]).await;
    broker.publish_json(QUEUE, &message_envelope("before", "u1", "i1"));
    broker.wait_for_settlements(1, WAIT).await.unwrap();

    broker.kill_connections();

    wait_for_tags(&broker, &["wa-relay-whatsapp-events-2"]).await;
    assert_eq!(broker.connections_opened(), 2);
    broker.publish_json(QUEUE, &message_envelope("after", "u1", "i1"));
    let settlements = broker.wait_for_settlements(2, WAIT).await.unwrap();
    assert!(settlements.iter().all(|s| s.decision == AckDecision::Ack));

    let ids: Vec<String> = recorder.events().into_iter().map(|e| e.event.info.id).collect();
    assert_eq!(ids, vec!["before".to_string(), "after".to_string()]);

    shutdown.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert!(consumer.connection().is_disposed());
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn gives_up_when_reconnect_attempts_are_exhausted() {
    let connector = Arc::new(ScriptedConnector::always_failing());
    let consumer = consumer(
        ConnectionManager::with_policy(connector.clone(), policy(2)),
        HandlerRegistry::default(),
    );
    let mut changes = consumer.connection().subscribe();

    let err = ConsumerSupervisor::new(Arc::clone(&consumer))
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::Connection(ConnectionError::ReconnectExhausted { attempts: 2 })
    ));
    // One attempt from the failed start, then one bounded reconnect cycle.
    assert_eq!(connector.attempts(), 3);
    assert!(consumer.connection().is_disposed());

    let mut reasons = Vec::new();
    while let Ok(change) = changes.try_recv() {
        reasons.push((change.state, change.reason));
    }
    assert!(reasons.iter().any(|(_, reason)| {
        reason.as_deref() == Some("reconnect attempts exhausted")
    }));
    assert_eq!(
        reasons.last().and_then(|(_, reason)| reason.clone()).as_deref(),
        Some("consumer stopped")
    );
}

#[tokio::test]
async fn shutdown_before_the_first_start_is_clean() {
    let broker = InMemoryBroker::new();
    let consumer = consumer(
        ConnectionManager::with_policy(broker.connector(), policy(1)),
        HandlerRegistry::default(),
    );
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    ConsumerSupervisor::new(Arc::clone(&consumer))
        .run(shutdown)
        .await
        .unwrap();

    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(broker.connections_opened(), 0);
}
