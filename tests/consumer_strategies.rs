//! Consumer strategies observed through a running subscription.

mod common;

use common::{append, beginning, received, Harness};
use persistent_subscriptions::{
    ConsumerStrategyKind, EventLog, EventSource, ExpectedVersion, InMemoryLog, NewEvent, ResolvedEvent,
    SubscriberHandle,
};
use std::collections::HashMap;
use std::sync::Arc;

fn on_all(kind: ConsumerStrategyKind) -> Harness {
    Harness::new(
        Arc::new(InMemoryLog::new()),
        EventSource::all(),
        beginning().consumer_strategy(kind),
    )
}

/// Streams seen by each handle, draining them.
fn streams_by_client(handles: &[&SubscriberHandle]) -> Vec<Vec<String>> {
    handles
        .iter()
        .map(|h| received(h).into_iter().map(|(s, _, _)| s).collect())
        .collect()
}

#[test]
fn test_round_robin_alternates() {
    let log = Arc::new(InMemoryLog::new());
    append(&log, "orders", 4);
    let mut h = Harness::on_stream(log, beginning());
    let a = h.connect(10);
    let b = h.connect(10);

    // everything was buffered before b joined
    assert_eq!(received(&a).len(), 4);
    assert!(received(&b).is_empty());

    h.append_live("orders", 4);
    assert_eq!(received(&a).len(), 2);
    assert_eq!(received(&b).len(), 2);
}

#[test]
fn test_dispatch_to_single_fills_first_client() {
    let log = Arc::new(InMemoryLog::new());
    let mut h = Harness::on_stream(
        log,
        beginning().consumer_strategy(ConsumerStrategyKind::DispatchToSingle),
    );
    let a = h.connect(3);
    let b = h.connect(3);

    h.append_live("orders", 5);
    assert_eq!(received(&a).len(), 3);
    assert_eq!(received(&b).len(), 2);
}

#[test]
fn test_pinned_keeps_streams_on_one_client() {
    let mut h = on_all(ConsumerStrategyKind::Pinned);
    let a = h.connect(100);
    let b = h.connect(100);

    for _ in 0..3 {
        for stream in ["orders-1", "orders-2", "orders-3", "orders-4"] {
            h.append_live(stream, 1);
        }
    }

    let mut owner: HashMap<String, usize> = HashMap::new();
    for (index, streams) in streams_by_client(&[&a, &b]).into_iter().enumerate() {
        for stream in streams {
            let previous = owner.insert(stream.clone(), index);
            assert!(previous.map_or(true, |p| p == index), "{} moved between clients", stream);
        }
    }
    assert_eq!(owner.len(), 4);
}

#[test]
fn test_pinned_reassigns_after_disconnect() {
    let mut h = on_all(ConsumerStrategyKind::Pinned);
    let a = h.connect(10);
    let b = h.connect(10);

    h.append_live("orders-1", 1);
    let first = streams_by_client(&[&a, &b]);
    let (owner, survivor) = if first[0].is_empty() { (&b, &a) } else { (&a, &b) };

    assert!(h
        .subscription
        .remove_client_by_correlation_id(owner.correlation_id, false));
    h.pump();

    // the in-flight message and new ones follow the stream to the survivor
    h.append_live("orders-1", 1);
    let delivered = received(survivor);
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].2, 1);
    assert_eq!(delivered[1].2, 0);
    assert!(delivered.iter().all(|(s, _, _)| s == "orders-1"));
}

#[test]
fn test_pinned_by_correlation_groups_streams() {
    let mut h = on_all(ConsumerStrategyKind::from_name("PinnedByCorrelation"));
    let a = h.connect(100);
    let b = h.connect(100);

    for (i, stream) in ["cart-1", "payment-7", "shipping-3", "cart-9"].iter().enumerate() {
        let metadata = if i < 3 {
            br#"{"$correlationId":"order-42"}"#.to_vec()
        } else {
            b"not json".to_vec()
        };
        let records = h
            .log
            .append(
                stream,
                ExpectedVersion::Any,
                vec![NewEvent::new("Step", "{}").with_metadata(metadata)],
            )
            .unwrap();
        for record in records {
            h.subscription.notify_live_event(ResolvedEvent::from_event(record));
        }
    }
    h.pump();

    let seen = streams_by_client(&[&a, &b]);
    let correlated = ["cart-1", "payment-7", "shipping-3"];
    let together = seen
        .iter()
        .any(|streams| correlated.iter().all(|s| streams.iter().any(|x| x == s)));
    assert!(together, "{:?}", seen);
    assert_eq!(seen[0].len() + seen[1].len(), 4);
}
