//! # Delivery Integration Tests
//!
//! End-to-end publish → consume scenarios over the in-memory transport:
//! round-trip fidelity, per-publisher ordering, fan-out to every handler on a
//! channel, handler isolation, capped-stream eviction and cooperative shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coherence_bus::{
    handler_fn, BusConfig, BusError, ChannelConfig, ChannelRegistry, CoherenceBus, ConsumerConfig,
    ContextMutation, FragmentUpdate, HandlerError, InMemoryStreamTransport, MessageEnvelope,
    MessageType, MutationType, Payload, StreamTransport, FRAGMENT_UPDATES,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn fast_config() -> BusConfig {
    BusConfig {
        consumer: ConsumerConfig {
            batch_size: 10,
            poll_block: Duration::from_millis(50),
            open_backoff: Duration::from_millis(50),
            error_backoff: Duration::from_millis(50),
        },
        ..BusConfig::default()
    }
}

async fn connected_bus() -> (Arc<CoherenceBus>, Arc<InMemoryStreamTransport>) {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let bus = Arc::new(CoherenceBus::with_standard_channels(
        fast_config(),
        transport.clone(),
    ));
    bus.connect().await.expect("connect");
    (bus, transport)
}

fn fragment(id: &str) -> FragmentUpdate {
    FragmentUpdate {
        fragment_id: id.to_string(),
        content: format!("Fragment {id}: answer with citations."),
        priority: 0.75,
        context_domain: "research".to_string(),
        validation_score: Some(0.92),
        usage_count: 12,
        success_rate: 0.83,
        last_updated: "2024-03-01T09:30:00Z".to_string(),
    }
}

/// A payload published to a channel comes back deep-equal to what was sent.
#[tokio::test]
async fn test_mutation_round_trip() {
    // Arrange
    let (bus, _) = connected_bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_to_mutations(move |mutation: ContextMutation| {
        let tx = tx.clone();
        async move {
            tx.send(mutation)
                .map_err(|e| HandlerError::failed(e.to_string()))
        }
    })
    .await
    .unwrap();

    let sent = ContextMutation {
        mutation_id: "mut-42".to_string(),
        mutation_type: MutationType::AddInsight,
        target_domain: "PAIN_POINTS.current_issues".to_string(),
        new_value: json!({"issue": "slow onboarding", "weight": 0.3}),
        previous_value: None,
        confidence: 0.87,
        requires_downstream_validation: true,
        source: "conversation_turn_17".to_string(),
        timestamp: Utc::now(),
    };

    // Act
    bus.publish_context_mutation(sent.clone()).await.unwrap();

    // Assert
    let received = timeout(WAIT, rx.recv())
        .await
        .expect("Should receive within timeout")
        .expect("Should have mutation");
    assert_eq!(received, sent);

    bus.disconnect().await.unwrap();
}

/// Messages from one publisher are observed in publish order.
#[tokio::test]
async fn test_publish_order_preserved() {
    let (bus, _) = connected_bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_to_fragments(move |f: FragmentUpdate| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(f.fragment_id);
            Ok(())
        }
    })
    .await
    .unwrap();

    for id in ["m1", "m2", "m3"] {
        bus.publish_fragment_update(fragment(id)).await.unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let id = timeout(WAIT, rx.recv()).await.expect("timeout").unwrap();
        seen.push(id);
    }
    assert_eq!(seen, vec!["m1", "m2", "m3"]);

    bus.disconnect().await.unwrap();
}

/// Two handlers on `fragment_updates` each see the entry exactly once.
#[tokio::test]
async fn test_fan_out_to_every_handler() {
    let (bus, _) = connected_bus().await;
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();

    for tx in [tx_a, tx_b] {
        bus.subscribe_to_fragments(move |f: FragmentUpdate| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(f);
                Ok(())
            }
        })
        .await
        .unwrap();
    }

    let sent = fragment("shared");
    bus.publish_fragment_update(sent.clone()).await.unwrap();

    let a = timeout(WAIT, rx_a.recv()).await.expect("timeout").unwrap();
    let b = timeout(WAIT, rx_b.recv()).await.expect("timeout").unwrap();
    assert_eq!(a, sent);
    assert_eq!(b, sent);

    // No duplicate deliveries
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());

    bus.disconnect().await.unwrap();
}

/// A failing or panicking handler affects neither its siblings nor the loop.
#[tokio::test]
async fn test_handler_isolation() {
    let (bus, transport) = connected_bus().await;
    let failures = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let counter = Arc::clone(&failures);
    bus.subscribe_to_fragments(move |_f: FragmentUpdate| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::failed("validator rejected fragment"))
        }
    })
    .await
    .unwrap();

    bus.subscribe(
        FRAGMENT_UPDATES,
        Arc::new(handler_fn(|envelope: MessageEnvelope| async move {
            if envelope.priority() >= 0 {
                panic!("dashboard crashed");
            }
            Ok(())
        })),
    )
    .await
    .unwrap();

    bus.subscribe_to_fragments(move |f: FragmentUpdate| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(f.fragment_id);
            Ok(())
        }
    })
    .await
    .unwrap();

    bus.publish_fragment_update(fragment("first")).await.unwrap();
    bus.publish_fragment_update(fragment("second")).await.unwrap();

    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "first");
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "second");
    assert_eq!(failures.load(Ordering::SeqCst), 2);

    // Acked despite the failures
    timeout(WAIT, async {
        while transport.pending_count(FRAGMENT_UPDATES, "coherence_group") > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("entries should be acknowledged");
    assert_eq!(bus.performance_metrics().messages_received, 2);

    bus.disconnect().await.unwrap();
}

/// Publishing `max_length + 1` entries evicts exactly the oldest one.
#[tokio::test]
async fn test_capped_channel_evicts_oldest() {
    const BOUND: usize = 5;
    let registry = ChannelRegistry::new(vec![ChannelConfig::new(
        "small_fragments",
        BOUND,
        Duration::from_secs(86_400),
        MessageType::FragmentUpdate,
    )])
    .unwrap();
    let transport = Arc::new(InMemoryStreamTransport::new());
    let bus = CoherenceBus::new(fast_config(), registry, transport.clone());
    bus.connect().await.unwrap();

    for n in 0..=BOUND {
        bus.publish(
            "small_fragments",
            Payload::FragmentUpdate(fragment(&format!("f{n}"))),
            "fragment_manager",
            0,
        )
        .await
        .unwrap();
    }

    let entries = transport.range("small_fragments").await.unwrap();
    assert_eq!(entries.len(), BOUND);
    let ids: Vec<String> = entries
        .iter()
        .map(|e| {
            MessageEnvelope::from_fields(&e.fields)
                .unwrap()
                .into_payload()
                .into_fragment_update()
                .unwrap()
                .fragment_id
        })
        .collect();
    assert_eq!(ids, vec!["f1", "f2", "f3", "f4", "f5"]);
}

/// Disconnect stops consumer loops promptly and the bus refuses new work.
#[tokio::test]
async fn test_cooperative_shutdown() {
    let (bus, _) = connected_bus().await;
    bus.subscribe_to_fragments(|_f: FragmentUpdate| async { Ok(()) })
        .await
        .unwrap();
    bus.subscribe_to_alerts(|_a| async { Ok(()) }).await.unwrap();
    assert_eq!(bus.subscribed_channels().len(), 2);

    timeout(Duration::from_secs(1), bus.disconnect())
        .await
        .expect("loops should stop within one poll window")
        .unwrap();

    assert!(!bus.is_connected());
    assert!(bus.subscribed_channels().is_empty());
    assert!(bus.publish_fragment_update(fragment("late")).await.is_err());
}

/// Entries published before anyone subscribed are still delivered.
#[tokio::test]
async fn test_backlog_delivered_to_late_subscriber() {
    let (bus, _) = connected_bus().await;
    bus.publish_fragment_update(fragment("early")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_to_fragments(move |f: FragmentUpdate| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(f.fragment_id);
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "early");
    bus.disconnect().await.unwrap();
}

/// Numbers JSON cannot carry are refused at publish time instead of being
/// written as `null` and dropped by the consumer.
#[tokio::test]
async fn test_non_finite_fragment_refused_before_append() {
    // Arrange
    let (bus, transport) = connected_bus().await;
    let mut bad = fragment("nan");
    bad.priority = f64::NAN;

    // Act
    let err = bus.publish_fragment_update(bad).await.unwrap_err();

    // Assert
    assert!(matches!(err, BusError::InvalidPayload { .. }), "got {err:?}");
    assert_eq!(transport.append_calls(), 0);
    assert!(transport.range(FRAGMENT_UPDATES).await.unwrap().is_empty());
    assert_eq!(bus.circuit_breaker().failure_count(), 0);
}

/// An update's previous value is delivered as sent; an explicit null, which
/// the wire cannot tell apart from "absent", is refused.
#[tokio::test]
async fn test_update_previous_value_round_trip() {
    let (bus, transport) = connected_bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_to_mutations(move |mutation: ContextMutation| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(mutation);
            Ok(())
        }
    })
    .await
    .unwrap();

    let sent = ContextMutation {
        mutation_id: "mut-upd".to_string(),
        mutation_type: MutationType::UpdateField,
        target_domain: "GOALS.primary".to_string(),
        new_value: json!("ship v2"),
        previous_value: Some(json!("ship v1")),
        confidence: 0.6,
        requires_downstream_validation: false,
        source: "conversation_turn_3".to_string(),
        timestamp: Utc::now(),
    };
    let mut null_previous = sent.clone();
    null_previous.mutation_id = "mut-null".to_string();
    null_previous.previous_value = Some(serde_json::Value::Null);

    let err = bus
        .publish_context_mutation(null_previous)
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(transport.append_calls(), 0);

    bus.publish_context_mutation(sent.clone()).await.unwrap();
    let received = timeout(WAIT, rx.recv()).await.expect("timeout").unwrap();
    assert_eq!(received, sent);
    assert!(received.validate().is_ok());

    bus.disconnect().await.unwrap();
}
