//! End-to-end event flow: server-directed subscription, emission over the
//! transport stream, replay on request, pruning on acknowledgement.

use remora::comm::pool::{HandshakeBuilder, HandshakeResponder, HandshakeVerdict, PoolConfig};
use remora::comm::{Communicator, ErrorPolicy, RawSink, StreamManager};
use remora::events::EventManager;
use remora::scheduler::Scheduler;
use remora_proto::{
    ClientBody, ClientMessage, ConfiguredSubscription, EventSubscriptionWire, HandshakeAuth,
    HandshakeRequest, ServerBody, ServerMessage,
};
use remora_test_utils::MockProviderServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn builder() -> HandshakeBuilder {
    Arc::new(|ctx| HandshakeRequest {
        hostname: "client-host".to_owned(),
        session_id: ctx.session_id.clone(),
        env_vars: Default::default(),
        auth: HandshakeAuth::Token {
            token_hash: "aGFzaA==".to_owned(),
        },
    })
}

fn proceed() -> HandshakeResponder {
    Arc::new(|_| HandshakeVerdict::Proceed)
}

struct Harness {
    server: MockProviderServer,
    streams: Arc<StreamManager>,
    events: Arc<EventManager>,
    _router: tokio::task::JoinHandle<()>,
}

/// Wire a communicator, stream manager, event manager, and a minimal
/// router, the way the context does.
async fn connect() -> Harness {
    let server = MockProviderServer::start().await.unwrap();
    let (server_tx, mut server_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let cfg = PoolConfig {
        url: server.ws_url(),
        pool_size: 1,
        handshake_retry: Duration::from_millis(50),
        error_policy: ErrorPolicy::Fail,
    };
    let communicator = Communicator::connect(cfg, builder(), proceed(), server_tx)
        .await
        .unwrap();

    let streams = Arc::new(StreamManager::new(
        Arc::clone(&communicator) as Arc<dyn RawSink>
    ));
    let events = Arc::new(EventManager::new(&Scheduler::new(), &streams));

    let router_streams = Arc::clone(&streams);
    let router_events = Arc::clone(&events);
    let router = tokio::spawn(async move {
        while let Some(msg) = server_rx.recv().await {
            match msg.body {
                ServerBody::MessageRequest {
                    stream_id,
                    lower_sequence_number,
                    upper_sequence_number,
                } => router_streams.handle_request(
                    stream_id,
                    lower_sequence_number,
                    upper_sequence_number,
                ),
                ServerBody::MessageAcknowledgement {
                    stream_id,
                    sequence_number,
                } => router_streams.handle_ack(stream_id, sequence_number),
                ref body => {
                    let _ = router_events.on_server_message(body);
                }
            }
        }
    });

    Harness {
        server,
        streams,
        events,
        _router: router,
    }
}

fn is_write_event(msg: &ClientMessage) -> bool {
    matches!(msg.body, ClientBody::WriteEvent(_))
}

#[tokio::test]
async fn pushed_subscription_drives_emission_over_the_stream() {
    let harness = connect().await;

    harness
        .server
        .push(ServerBody::WriteEventSubscription(EventSubscriptionWire {
            id: 1,
            counter_threshold: Some(2),
            time_threshold_ms: None,
            size_threshold: None,
        }));

    // The subscription install races the pushes; retry until it lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        harness.events.emit_write("f", 0, 10, 100);
        if harness
            .server
            .wait_for(is_write_event, Duration::from_millis(100))
            .await
            .is_some()
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no emission observed"
        );
    }

    let emitted = harness
        .server
        .wait_for(is_write_event, Duration::from_secs(1))
        .await
        .unwrap();
    let header = emitted.message_stream.expect("emissions carry the stream header");
    assert_eq!(header.sequence_number, 0);
}

#[tokio::test]
async fn configuration_installs_initial_subscriptions() {
    let harness = connect().await;

    harness.server.push(ServerBody::Configuration {
        subscriptions: vec![ConfiguredSubscription::WriteEventSubscription(
            EventSubscriptionWire {
                id: 7,
                counter_threshold: Some(1),
                time_threshold_ms: None,
                size_threshold: None,
            },
        )],
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        harness.events.emit_write("f", 0, 1, 10);
        if harness
            .server
            .wait_for(is_write_event, Duration::from_millis(100))
            .await
            .is_some()
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "configuration subscription never applied"
        );
    }
}

#[tokio::test]
async fn server_request_replays_buffered_stream_messages() {
    let harness = connect().await;

    // Emit five messages directly on a transport stream.
    let stream = harness.streams.create();
    for n in 0..5u64 {
        stream.send(ClientBody::TruncateEvent(remora_proto::TruncateEventWire {
            file_uuid: format!("f{n}"),
            counter: 1,
            file_size: n,
        }));
    }
    // Wait until all five arrived once.
    harness
        .server
        .wait_for(
            |m| {
                m.message_stream
                    .map(|h| h.sequence_number == 4)
                    .unwrap_or(false)
            },
            Duration::from_secs(2),
        )
        .await
        .expect("initial sends observed");
    let before = harness
        .server
        .received()
        .iter()
        .filter(|m| m.message_stream.is_some())
        .count();
    assert_eq!(before, 5);

    // Ask for 2..=4 again.
    harness.server.push(ServerBody::MessageRequest {
        stream_id: stream.stream_id(),
        lower_sequence_number: 2,
        upper_sequence_number: 4,
    });
    harness
        .server
        .wait_for(
            |m| {
                m.message_stream
                    .map(|h| h.sequence_number == 4)
                    .unwrap_or(false)
            },
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    // Give the replay a moment to finish, then check exactly 2,3,4 were
    // resent in order.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let replayed: Vec<u64> = harness
        .server
        .received()
        .iter()
        .filter_map(|m| m.message_stream.map(|h| h.sequence_number))
        .skip(5)
        .collect();
    assert_eq!(replayed, vec![2, 3, 4]);

    // Acknowledge everything; a further request resends nothing.
    harness.server.push(ServerBody::MessageAcknowledgement {
        stream_id: stream.stream_id(),
        sequence_number: 4,
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.server.push(ServerBody::MessageRequest {
        stream_id: stream.stream_id(),
        lower_sequence_number: 0,
        upper_sequence_number: 4,
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    let total = harness
        .server
        .received()
        .iter()
        .filter(|m| m.message_stream.is_some())
        .count();
    assert_eq!(total, 8, "acknowledged messages must not be resent");
}
