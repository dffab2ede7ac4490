//! Integration tests for [`RedpandaEventBus`] against a real Kafka-protocol broker.
//!
//! # Running These Tests
//!
//! Marked `#[ignore]` because they need Docker and take a while to start a broker:
//! ```bash
//! cargo test -p matchup-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use matchup_core::event::{MatchSearchEvent, SerializedEvent};
use matchup_core::event_bus::{EventBus, EventStream};
use matchup_redpanda::RedpandaEventBus;
use matchup_testing::fixtures::MatchBuilder;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

const WARMUP: &str = "warmup";

fn warmup_event() -> SerializedEvent {
    SerializedEvent::new(WARMUP.to_string(), WARMUP.to_string(), vec![255])
}

async fn start_broker() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    wait_for_broker(&brokers).await;
    (kafka, brokers)
}

async fn wait_for_broker(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(bus) = RedpandaEventBus::new(brokers) {
            if bus.publish("warmup-topic", &warmup_event()).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != max_attempts, "Broker not ready after {max_attempts} attempts");
    }
}

/// Publish a warmup record so the topic is auto-created and its metadata propagates.
async fn ensure_topic_exists(bus: &RedpandaEventBus, topic: &str) {
    for attempt in 1..=30 {
        if bus.publish(topic, &warmup_event()).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(attempt != 30, "Failed to create topic {topic}");
    }
}

async fn receive(stream: &mut EventStream, count: usize) -> Vec<SerializedEvent> {
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), async {
        while received.len() < count {
            match stream.next().await {
                Some(Ok(event)) if event.event_type != WARMUP => received.push(event),
                Some(Ok(_)) => {},
                Some(Err(e)) => panic!("Failed to receive event: {e}"),
                None => panic!("Stream ended early"),
            }
        }
    })
    .await
    .expect("Timeout waiting for events");
    received
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_search_events_round_trip() {
    let (_kafka, brokers) = start_broker().await;
    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("round-trip")
        .build()
        .expect("Failed to create event bus");
    ensure_topic_exists(&bus, "search-round-trip").await;

    let mut stream = bus
        .subscribe(&["search-round-trip"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let m = MatchBuilder::new().build();
    let added = MatchSearchEvent::became_searchable(&m);
    let removed = MatchSearchEvent::left_search_index(m.id);
    for event in [&added, &removed] {
        bus.publish("search-round-trip", &SerializedEvent::from_event(event).expect("encode"))
            .await
            .expect("Failed to publish");
    }

    let received = receive(&mut stream, 2).await;
    assert_eq!(received[0].key, m.id.to_string());
    assert_eq!(MatchSearchEvent::decode(&received[0]).expect("decode"), added);
    assert_eq!(MatchSearchEvent::decode(&received[1]).expect("decode"), removed);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_new_group_reads_events_published_before_it_subscribed() {
    let (_kafka, brokers) = start_broker().await;
    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("late-subscriber")
        .build()
        .expect("Failed to create event bus");

    let m = MatchBuilder::new().build();
    let event = SerializedEvent::from_event(&MatchSearchEvent::left_search_index(m.id)).expect("encode");
    bus.publish("search-backlog", &event).await.expect("Failed to publish");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut stream = bus.subscribe(&["search-backlog"]).await.expect("Failed to subscribe");
    let received = receive(&mut stream, 1).await;
    assert_eq!(received[0], event);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_events_for_one_match_keep_their_order() {
    let (_kafka, brokers) = start_broker().await;
    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("ordering")
        .build()
        .expect("Failed to create event bus");
    ensure_topic_exists(&bus, "search-ordering").await;

    let mut stream = bus.subscribe(&["search-ordering"]).await.expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let m = MatchBuilder::new().build();
    let sequence: Vec<MatchSearchEvent> = (0..6)
        .map(|i| {
            if i % 2 == 0 {
                MatchSearchEvent::became_searchable(&m)
            } else {
                MatchSearchEvent::left_search_index(m.id)
            }
        })
        .collect();
    for event in &sequence {
        bus.publish("search-ordering", &SerializedEvent::from_event(event).expect("encode"))
            .await
            .expect("Failed to publish");
    }

    let received: Vec<MatchSearchEvent> = receive(&mut stream, sequence.len())
        .await
        .iter()
        .map(|e| MatchSearchEvent::decode(e).expect("decode"))
        .collect();
    assert_eq!(received, sequence);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_custom_producer_configuration() {
    let (_kafka, brokers) = start_broker().await;
    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .producer_acks("1")
        .compression("lz4")
        .timeout(Duration::from_secs(10))
        .buffer_size(16)
        .auto_offset_reset("latest")
        .build()
        .expect("Failed to create event bus");

    bus.publish("search-config", &warmup_event())
        .await
        .expect("Failed to publish with custom config");
    assert_eq!(bus.brokers(), brokers);
}
