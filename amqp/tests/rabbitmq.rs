//! Integration tests against a real RabbitMQ node.
//!
//! Marked `#[ignore]` because they need Docker (testcontainers) and take a few
//! seconds to boot the broker. Run them with:
//!
//! ```bash
//! cargo test -p wa-relay-amqp --test rabbitmq -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::rabbitmq::RabbitMq;
use wa_relay_amqp::LapinConnector;
use wa_relay_core::event::Message;
use wa_relay_core::{BrokerConnector, ConsumerConfig};
use wa_relay_runtime::{ConnectionManager, Dispatcher, EventConsumer, HandlerRegistry, RetryPolicy};
use wa_relay_testing::{RecordingHandler, message_envelope};

const QUEUE: &str = "wa-relay-it";

async fn rabbit() -> (ContainerAsync<RabbitMq>, String) {
    let container = RabbitMq::default()
        .start()
        .await
        .expect("failed to start RabbitMQ container");
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("mapped AMQP port");
    (container, format!("amqp://guest:guest@{host}:{port}/%2f"))
}

async fn publish(uri: &str, bodies: &[Vec<u8>]) {
    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .expect("publisher connection");
    let channel = connection.create_channel().await.expect("publisher channel");
    channel
        .queue_declare(
            QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .expect("declare queue");

    for body in bodies {
        channel
            .basic_publish(
                "",
                QUEUE,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await
            .expect("publish")
            .await
            .expect("publisher confirm");
    }
    connection.close(200, "done").await.expect("close publisher");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn consumes_and_acknowledges_from_rabbitmq() {
    let (_container, uri) = rabbit().await;
    publish(
        &uri,
        &[
            message_envelope("m1", "u1", "i1").to_string().into_bytes(),
            b"{not json".to_vec(),
            message_envelope("m2", "u1", "i1").to_string().into_bytes(),
        ],
    )
    .await;

    let recorder = RecordingHandler::<Message>::new();
    let handlers = HandlerRegistry::builder()
        .shared::<Message>(recorder.handler())
        .build();
    let connector = Arc::new(LapinConnector::new(&uri).unwrap());
    let connection = Arc::new(ConnectionManager::with_policy(
        connector,
        RetryPolicy::builder().max_attempts(3).build(),
    ));
    let consumer = EventConsumer::new(
        ConsumerConfig {
            queue_name: QUEUE.to_string(),
            ..ConsumerConfig::default()
        },
        connection,
        Arc::new(Dispatcher::new(handlers)),
    );

    consumer.start().await.expect("consumer start");
    tokio::time::timeout(Duration::from_secs(10), async {
        while recorder.count() < 2 || consumer.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("messages were not consumed");
    consumer.stop().await;

    let ids: Vec<String> = recorder.events().into_iter().map(|e| e.event.info.id).collect();
    assert_eq!(ids, vec!["m1".to_string(), "m2".to_string()]);

    // Everything was settled: acked or rejected without requeue.
    let check = Connection::connect(&uri, ConnectionProperties::default())
        .await
        .unwrap();
    let queue = check
        .create_channel()
        .await
        .unwrap()
        .queue_declare(
            QUEUE,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();
    assert_eq!(queue.message_count(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn connection_reports_open_and_closes_cleanly() {
    let (_container, uri) = rabbit().await;
    let connector = LapinConnector::builder()
        .uri(uri)
        .connection_name("wa-relay-it")
        .build()
        .unwrap();

    let connection = connector.connect().await.unwrap();
    assert!(connection.is_open());

    let channel = connection.open_channel().await.unwrap();
    channel.declare_queue(QUEUE, true).await.unwrap();
    channel.set_qos(5).await.unwrap();
    channel.close().await.unwrap();

    connection.close().await.unwrap();
    assert!(!connection.is_open());
}
