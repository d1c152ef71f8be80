//! Threshold-driven emission scenarios for the event streams.

use remora::comm::{RawSink, StreamManager};
use remora::events::EventManager;
use remora::scheduler::Scheduler;
use remora_proto::{
    ClientBody, ClientMessage, EventSubscriptionWire, ServerBody, WriteEventWire,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CaptureSink {
    sent: Mutex<Vec<ClientMessage>>,
}

impl RawSink for CaptureSink {
    fn dispatch(&self, msg: &ClientMessage) {
        self.sent.lock().unwrap().push(msg.clone());
    }
}

impl CaptureSink {
    fn write_events(&self) -> Vec<WriteEventWire> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|msg| match &msg.body {
                ClientBody::WriteEvent(wire) => Some(wire.clone()),
                _ => None,
            })
            .collect()
    }
}

fn setup() -> (Arc<CaptureSink>, Arc<StreamManager>, EventManager) {
    let sink = Arc::new(CaptureSink::default());
    let streams = Arc::new(StreamManager::new(
        Arc::clone(&sink) as Arc<dyn RawSink>
    ));
    let events = EventManager::new(&Scheduler::new(), &streams);
    (sink, streams, events)
}

fn write_subscription(
    id: i64,
    counter: Option<u64>,
    time_ms: Option<u64>,
    size: Option<u64>,
) -> ServerBody {
    ServerBody::WriteEventSubscription(EventSubscriptionWire {
        id,
        counter_threshold: counter,
        time_threshold_ms: time_ms,
        size_threshold: size,
    })
}

#[tokio::test(start_paused = true)]
async fn counter_threshold_triggers_one_aggregated_emission() {
    let (sink, _streams, events) = setup();
    assert!(events.on_server_message(&write_subscription(1, Some(3), None, None)));

    events.emit_write("f", 0, 10, 100);
    events.emit_write("f", 10, 10, 100);
    assert!(sink.write_events().is_empty());

    events.emit_write("f", 20, 5, 100);
    let emitted = sink.write_events();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].counter, 3);
    assert_eq!(emitted[0].size, 25);
    assert_eq!(emitted[0].file_size, 100);
    assert_eq!(emitted[0].blocks.len(), 1);
    assert_eq!(emitted[0].blocks[0].offset, 0);
    assert_eq!(emitted[0].blocks[0].size, 25);
}

#[tokio::test(start_paused = true)]
async fn size_threshold_triggers_emission() {
    let (sink, _streams, events) = setup();
    events.on_server_message(&write_subscription(2, None, None, Some(100)));

    events.emit_write("f", 0, 40, 1000);
    assert!(sink.write_events().is_empty());

    events.emit_write("f", 40, 70, 1000);
    let emitted = sink.write_events();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].size, 110);
    assert_eq!(emitted[0].blocks.len(), 1);
    assert_eq!(emitted[0].blocks[0].offset, 0);
    assert_eq!(emitted[0].blocks[0].size, 110);
}

#[tokio::test(start_paused = true)]
async fn time_threshold_force_emits_periodically() {
    let (sink, _streams, events) = setup();
    events.on_server_message(&write_subscription(3, None, Some(50), None));

    events.emit_write("f", 0, 1, 100);
    assert!(sink.write_events().is_empty());

    tokio::time::advance(Duration::from_millis(60)).await;
    tokio::task::yield_now().await;

    let emitted = sink.write_events();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].counter, 1);
}

#[tokio::test(start_paused = true)]
async fn truncate_shrinks_aggregated_blocks() {
    let (sink, _streams, events) = setup();
    events.on_server_message(&write_subscription(4, Some(2), None, None));

    events.emit_write("f", 0, 100, 100);
    events.emit_truncate("f", 50);

    let emitted = sink.write_events();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].counter, 2);
    assert_eq!(emitted[0].file_size, 50);
    assert_eq!(emitted[0].blocks.len(), 1);
    assert_eq!(emitted[0].blocks[0].offset, 0);
    assert_eq!(emitted[0].blocks[0].size, 50);
}

#[tokio::test(start_paused = true)]
async fn cancelled_subscription_stops_emissions() {
    let (sink, _streams, events) = setup();
    events.on_server_message(&write_subscription(1, Some(3), None, None));
    events.emit_write("f", 0, 10, 100);

    events.on_server_message(&ServerBody::EventSubscriptionCancellation { id: 1 });

    for i in 0..10 {
        events.emit_write("f", i * 10, 10, 200);
    }
    tokio::time::advance(Duration::from_secs(60)).await;
    tokio::task::yield_now().await;
    assert!(sink.write_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn no_event_is_lost_or_duplicated_across_emissions() {
    let (sink, _streams, events) = setup();
    events.on_server_message(&write_subscription(5, Some(3), None, None));

    for i in 0..7 {
        events.emit_write("f", i * 10, 10, 1000);
    }
    // 7 pushes at threshold 3: two emissions so far, one push pending.
    events.flush();

    let total: u64 = sink.write_events().iter().map(|w| w.counter).sum();
    assert_eq!(total, 7);
    let emitted = sink.write_events();
    assert_eq!(emitted.len(), 3);
    assert_eq!(emitted[0].counter, 3);
    assert_eq!(emitted[1].counter, 3);
    assert_eq!(emitted[2].counter, 1);
}

#[tokio::test(start_paused = true)]
async fn second_subscription_aggregates_per_file() {
    let (sink, _streams, events) = setup();
    events.on_server_message(&write_subscription(1, Some(10), None, None));
    events.on_server_message(&write_subscription(2, Some(4), None, None));

    events.emit_write("a", 0, 10, 100);
    events.emit_write("b", 0, 10, 100);
    events.emit_write("a", 10, 10, 100);
    events.emit_write("b", 10, 10, 100);

    // Four operations total crossed the tighter threshold; emission holds
    // one aggregated event per file.
    let emitted = sink.write_events();
    assert_eq!(emitted.len(), 2);
    let mut uuids: Vec<&str> = emitted.iter().map(|w| w.file_uuid.as_str()).collect();
    uuids.sort_unstable();
    assert_eq!(uuids, vec!["a", "b"]);
    assert!(emitted.iter().all(|w| w.counter == 2));
}

#[tokio::test(start_paused = true)]
async fn read_subscription_routes_to_read_stream() {
    let (sink, _streams, events) = setup();
    events.on_server_message(&ServerBody::ReadEventSubscription(EventSubscriptionWire {
        id: 9,
        counter_threshold: Some(1),
        time_threshold_ms: None,
        size_threshold: None,
    }));

    events.emit_read("f", 0, 64);
    let reads: Vec<_> = sink
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter(|m| matches!(m.body, ClientBody::ReadEvent(_)))
        .cloned()
        .collect();
    assert_eq!(reads.len(), 1);
    // Emissions travel on the events transport stream.
    assert!(reads[0].message_stream.is_some());
}
