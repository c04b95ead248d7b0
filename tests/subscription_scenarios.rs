//! End-to-end behavior of a single subscription driven synchronously.

mod common;

use common::{append, beginning, numbers, received, received_ids, Harness};
use persistent_subscriptions::{
    DropReason, EventFilter, EventLog, EventSource, ExpectedVersion, InMemoryLog, NakAction, NewEvent,
    ParkedMetadata, ResolvedEvent, StorageError, StreamPosition, SubscriberMessage, SubscriptionPhase,
    SubscriptionSettings, LINK_EVENT_TYPE,
};
use std::sync::Arc;
use std::time::Duration;

fn log_with(count: usize) -> Arc<InMemoryLog> {
    let log = Arc::new(InMemoryLog::new());
    append(&log, "orders", count);
    log
}

// --- Delivery ---

#[test]
fn test_capacity_one_client_gets_next_after_ack() {
    let mut h = Harness::on_stream(log_with(3), beginning());
    let client = h.connect(1);

    let ids = received_ids(&client);
    assert_eq!(ids.len(), 1);
    assert!(client.try_recv().is_err());

    h.ack(&client, &ids);
    let next = received(&client);
    assert_eq!(numbers(&next), vec![1]);
}

#[test]
fn test_history_then_live() {
    let mut h = Harness::on_stream(log_with(2), beginning());
    let client = h.connect(10);
    assert_eq!(numbers(&received(&client)), vec![0, 1]);

    h.append_live("orders", 2);
    assert_eq!(numbers(&received(&client)), vec![2, 3]);
    assert_eq!(h.subscription.phase(), SubscriptionPhase::Push);
}

#[test]
fn test_live_duplicate_of_history_not_redelivered() {
    let log = log_with(3);
    let mut h = Harness::on_stream(log.clone(), beginning());
    let last = log.stream_events("orders").pop().unwrap();
    h.subscription.notify_live_event(ResolvedEvent::from_event(last));
    h.pump();

    let client = h.connect(10);
    assert_eq!(numbers(&received(&client)), vec![0, 1, 2]);
}

#[test]
fn test_start_from_current_skips_history() {
    let mut h = Harness::on_stream(log_with(5), SubscriptionSettings::default());
    let client = h.connect(10);
    assert!(received(&client).is_empty());

    h.append_live("orders", 1);
    assert_eq!(numbers(&received(&client)), vec![5]);
}

#[test]
fn test_saturated_group_holds_live_events() {
    let mut h = Harness::on_stream(Arc::new(InMemoryLog::new()), SubscriptionSettings::default());
    let client = h.connect(1);
    h.append_live("orders", 3);

    let ids = received_ids(&client);
    assert_eq!(ids.len(), 1);
    assert_eq!(h.subscription.phase(), SubscriptionPhase::Pull);

    h.ack(&client, &ids);
    let ids = received_ids(&client);
    h.ack(&client, &ids);
    let last = received(&client);
    assert_eq!(numbers(&last), vec![2]);
}

#[test]
fn test_all_stream_with_filter() {
    let log = Arc::new(InMemoryLog::new());
    append(&log, "orders-1", 2);
    append(&log, "users-1", 1);
    append(&log, "orders-2", 1);

    let source = EventSource::All {
        filter: Some(EventFilter::stream_prefix("orders-")),
    };
    let mut h = Harness::new(log, source, beginning());
    let client = h.connect(10);

    let streams: Vec<String> = received(&client).into_iter().map(|(s, _, _)| s).collect();
    assert_eq!(streams, vec!["orders-1", "orders-1", "orders-2"]);
}

#[test]
fn test_resolved_links_carry_target() {
    let log = Arc::new(InMemoryLog::new());
    let target = append(&log, "orders-1", 1).remove(0);
    log.append(
        "$ce-orders",
        ExpectedVersion::Any,
        vec![NewEvent::new(LINK_EVENT_TYPE, "0@orders-1")],
    )
    .unwrap();

    let settings = beginning().resolve_link_tos(true);
    let mut h = Harness::new(log, EventSource::stream("$ce-orders"), settings);
    let client = h.connect(10);

    match client.try_recv().unwrap() {
        SubscriberMessage::EventAppeared { event, .. } => {
            assert_eq!(event.event.event_id, target.event_id);
            assert_eq!(event.original_stream_id(), "$ce-orders");
        }
        other => panic!("unexpected {:?}", other),
    }
}

// --- Retries and parking ---

#[test]
fn test_nak_retry_redelivers_before_later_events() {
    let mut h = Harness::on_stream(log_with(3), beginning());
    let client = h.connect(1);
    let ids = received_ids(&client);

    h.subscription
        .not_acknowledge_messages_processed(client.correlation_id, &ids, NakAction::Retry, "busy");
    h.pump();
    assert_eq!(received(&client), vec![("orders".to_string(), 0, 1)]);
}

#[test]
fn test_timeout_with_zero_retries_parks() {
    let mut h = Harness::on_stream(log_with(1), beginning().max_retry_count(0));
    let client = h.connect(10);
    assert_eq!(received(&client).len(), 1);

    h.tick_after(Duration::from_secs(60));
    assert!(received(&client).is_empty());
    assert_eq!(h.subscription.outstanding_count(), 0);

    let parked = h.parked_events();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].data, b"0@orders");
    assert_eq!(h.subscription.parked_stats().count, 1);
}

#[test]
fn test_timeout_retries_until_limit() {
    let mut h = Harness::on_stream(log_with(1), beginning().max_retry_count(2));
    let client = h.connect(10);
    let mut retries = Vec::new();
    retries.extend(received(&client).into_iter().map(|(_, _, r)| r));
    for _ in 0..3 {
        h.tick_after(Duration::from_secs(60 * (retries.len() as u64 + 1)));
        retries.extend(received(&client).into_iter().map(|(_, _, r)| r));
    }
    assert_eq!(retries, vec![0, 1, 2]);
    assert_eq!(h.parked_events().len(), 1);
}

#[test]
fn test_nak_skip_neither_parks_nor_redelivers() {
    let mut h = Harness::on_stream(log_with(1), beginning().checkpoint_counts(1, 1));
    let client = h.connect(10);
    let ids = received_ids(&client);

    h.subscription
        .not_acknowledge_messages_processed(client.correlation_id, &ids, NakAction::Skip, "ignore");
    h.pump();

    assert!(h.parked_events().is_empty());
    assert!(received(&client).is_empty());
    assert_eq!(h.subscription.outstanding_count(), 0);
    assert_eq!(h.checkpoint_events(), vec![StreamPosition::Event(0)]);
}

#[test]
fn test_nak_park_records_reason() {
    let mut h = Harness::on_stream(log_with(1), beginning());
    let client = h.connect(10);
    let ids = received_ids(&client);

    h.subscription
        .not_acknowledge_messages_processed(client.correlation_id, &ids, NakAction::Park, "poison");
    h.pump();

    let parked = h.parked_events();
    assert_eq!(parked.len(), 1);
    let metadata: ParkedMetadata = serde_json::from_slice(&parked[0].metadata).unwrap();
    assert_eq!(metadata.reason, "poison");
}

#[test]
fn test_replay_parked_messages() {
    let mut h = Harness::on_stream(log_with(2), beginning());
    let client = h.connect(10);
    let ids = received_ids(&client);
    h.subscription
        .not_acknowledge_messages_processed(client.correlation_id, &ids[..1], NakAction::Park, "later");
    h.pump();
    assert_eq!(h.subscription.parked_stats().count, 1);

    assert!(h.subscription.retry_parked_messages(None));
    h.pump();

    assert_eq!(received(&client), vec![("orders".to_string(), 0, 0)]);
    assert_eq!(h.subscription.parked_stats().count, 0);
    assert!(h.parked_events().is_empty());

    // parking again after a replay is counted from the cursor
    h.subscription
        .not_acknowledge_messages_processed(client.correlation_id, &ids_of(&h, 0), NakAction::Park, "again");
    h.pump();
    assert_eq!(h.subscription.parked_stats().count, 1);
}

fn ids_of(h: &Harness, number: i64) -> Vec<persistent_subscriptions::EventId> {
    h.log
        .stream_events("orders")
        .into_iter()
        .filter(|r| r.event_number == number)
        .map(|r| r.event_id)
        .collect()
}

#[test]
fn test_transient_load_failure_recovers_on_tick() {
    let log = log_with(1);
    log.inject_failures(StorageError::Timeout("checkpoint read".into()), 1);
    let mut h = Harness::on_stream(log, beginning());
    assert_eq!(h.subscription.phase(), SubscriptionPhase::Idle);
    assert!(h.subscription.info().load_error.is_some());

    h.tick_after(Duration::ZERO);
    let client = h.connect(10);
    assert_eq!(numbers(&received(&client)), vec![0]);
}

#[test]
fn test_transient_read_failure_recovers_on_tick() {
    let log = log_with(5);
    let settings = beginning().read_batch_size(2).history_buffer_size(3);
    let mut h = Harness::on_stream(log.clone(), settings);
    assert_eq!(h.subscription.info().read_buffer_count, 2);

    log.inject_failures(StorageError::Unavailable("disk".into()), 1);
    let client = h.connect(10);
    assert_eq!(numbers(&received(&client)), vec![0, 1]);

    h.tick_after(Duration::ZERO);
    assert_eq!(numbers(&received(&client)), vec![2, 3, 4]);
}

// --- Clients ---

#[test]
fn test_removed_client_messages_redelivered() {
    let mut h = Harness::on_stream(log_with(3), beginning());
    let first = h.connect(1);
    let second = h.connect(1);
    assert_eq!(numbers(&received(&first)), vec![0]);
    let second_ids = received_ids(&second);
    assert_eq!(second_ids.len(), 1);

    assert!(h.subscription.remove_client_by_correlation_id(first.correlation_id, true));
    h.pump();
    assert!(matches!(
        first.try_recv(),
        Ok(SubscriberMessage::Dropped {
            reason: DropReason::Unsubscribed
        })
    ));

    h.ack(&second, &second_ids);
    assert_eq!(received(&second), vec![("orders".to_string(), 0, 1)]);
}

#[test]
fn test_connection_close_removes_all_its_clients() {
    let mut h = Harness::on_stream(log_with(2), beginning());
    let first = h.connect(1);
    assert_eq!(received(&first).len(), 1);

    assert_eq!(h.subscription.remove_client_by_connection_id(first.connection_id), 1);
    h.pump();
    assert!(first.try_recv().is_err());

    let next = h.connect(5);
    assert_eq!(received(&next), vec![("orders".to_string(), 0, 1), ("orders".to_string(), 1, 0)]);
}

#[test]
fn test_nak_stop_drops_client_and_redelivers() {
    let mut h = Harness::on_stream(log_with(1), beginning());
    let first = h.connect(1);
    let ids = received_ids(&first);
    let second = h.connect(1);

    h.subscription
        .not_acknowledge_messages_processed(first.correlation_id, &ids, NakAction::Stop, "stopping");
    h.pump();

    assert!(matches!(
        first.try_recv(),
        Ok(SubscriberMessage::Dropped {
            reason: DropReason::Unsubscribed
        })
    ));
    assert_eq!(received(&second), vec![("orders".to_string(), 0, 1)]);
    assert_eq!(h.subscription.client_count(), 1);
}

#[test]
fn test_dropped_reply_channel_keeps_message_outstanding() {
    let mut h = Harness::on_stream(log_with(1), beginning());
    let gone = h.connect(1);
    drop(gone);
    assert_eq!(h.subscription.outstanding_count(), 1);

    let client = h.connect(1);
    h.tick_after(Duration::from_secs(60));
    assert_eq!(received(&client), vec![("orders".to_string(), 0, 1)]);
}

// --- Checkpoints ---

#[test]
fn test_checkpoint_written_at_max_and_resumed() {
    let log = log_with(4);
    let mut h = Harness::on_stream(log.clone(), beginning().checkpoint_counts(1, 2));
    let client = h.connect(10);
    let ids = received_ids(&client);
    assert_eq!(ids.len(), 4);

    h.ack(&client, &ids[..2]);
    h.ack(&client, &ids[2..3]);
    assert_eq!(h.checkpoint_events(), vec![StreamPosition::Event(1)]);
    assert_eq!(h.subscription.last_checkpoint(), Some(StreamPosition::Event(1)));

    let mut restarted = Harness::on_stream(log, beginning());
    let client = restarted.connect(10);
    assert_eq!(numbers(&received(&client)), vec![2, 3]);
}

#[test]
fn test_gap_blocks_checkpoint() {
    let mut h = Harness::on_stream(log_with(4), beginning().checkpoint_counts(1, 1));
    let client = h.connect(10);
    let ids = received_ids(&client);

    h.ack(&client, &ids[1..3]);
    assert!(h.checkpoint_events().is_empty());

    h.ack(&client, &ids[..1]);
    assert_eq!(h.checkpoint_events(), vec![StreamPosition::Event(2)]);
}

#[test]
fn test_min_count_blocks_time_checkpoint() {
    let mut h = Harness::on_stream(log_with(2), beginning().checkpoint_counts(2, 10));
    let client = h.connect(10);
    let ids = received_ids(&client);

    h.ack(&client, &ids[..1]);
    h.tick_after(Duration::from_secs(5));
    assert!(h.checkpoint_events().is_empty());

    h.ack(&client, &ids[1..]);
    assert!(h.checkpoint_events().is_empty());
    h.tick_after(Duration::from_secs(5));
    assert_eq!(h.checkpoint_events(), vec![StreamPosition::Event(1)]);
}

#[test]
fn test_delete_removes_durable_state() {
    let mut h = Harness::on_stream(log_with(2), beginning().checkpoint_counts(1, 1));
    let client = h.connect(10);
    let ids = received_ids(&client);
    h.ack(&client, &ids[..1]);
    h.subscription
        .not_acknowledge_messages_processed(client.correlation_id, &ids[1..], NakAction::Park, "x");
    h.pump();
    assert!(!h.checkpoint_events().is_empty());
    assert_eq!(h.parked_events().len(), 1);

    h.subscription.delete();
    h.pump();
    assert!(h.checkpoint_events().is_empty());
    assert!(h.parked_events().is_empty());
    assert_eq!(h.subscription.phase(), SubscriptionPhase::Stopped);
}
