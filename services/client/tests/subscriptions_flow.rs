//! Subscription manager behavior over the wire: one subscribe per
//! installed registration, best-effort cancellation, reference counting.

use remora::comm::pool::{HandshakeBuilder, HandshakeResponder, HandshakeVerdict, PoolConfig};
use remora::comm::{Communicator, ErrorPolicy};
use remora::scheduler::Scheduler;
use remora::subscriptions::FsSubscriptions;
use remora_proto::{ClientBody, HandshakeAuth, HandshakeRequest, SubscribeRequest};
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

async fn connect() -> (MockProviderServer, Arc<FsSubscriptions>) {
    let server = MockProviderServer::start().await.unwrap();
    let (server_tx, _server_rx) = mpsc::unbounded_channel();
    let cfg = PoolConfig {
        url: server.ws_url(),
        pool_size: 1,
        handshake_retry: Duration::from_millis(50),
        error_policy: ErrorPolicy::Fail,
    };
    let communicator = Communicator::connect(cfg, builder(), proceed(), server_tx)
        .await
        .unwrap();
    let subscriptions = FsSubscriptions::new(communicator, Scheduler::new());
    (server, subscriptions)
}

fn count_subscribes(server: &MockProviderServer) -> usize {
    server
        .received()
        .iter()
        .filter(|m| matches!(m.body, ClientBody::Subscribe(_)))
        .count()
}

fn cancel_ids(server: &MockProviderServer) -> Vec<i64> {
    server
        .received()
        .iter()
        .filter_map(|m| match m.body {
            ClientBody::SubscribeCancel { id } => Some(id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn attr_subscription_subscribes_once_and_cancels_on_remove() {
    let (server, subscriptions) = connect().await;

    subscriptions
        .add_file_attr_subscription("uuid-1")
        .await
        .unwrap();
    // Second add for the same file is idempotent.
    subscriptions
        .add_file_attr_subscription("uuid-1")
        .await
        .unwrap();
    assert_eq!(count_subscribes(&server), 1);

    subscriptions.remove_file_attr_subscription("uuid-1").await;
    server
        .wait_for(
            |m| matches!(m.body, ClientBody::SubscribeCancel { .. }),
            Duration::from_secs(2),
        )
        .await
        .expect("cancellation sent");
    assert_eq!(cancel_ids(&server).len(), 1);
}

#[tokio::test]
async fn attr_subscription_carries_time_bound() {
    let (server, subscriptions) = connect().await;
    subscriptions
        .add_file_attr_subscription("uuid-2")
        .await
        .unwrap();

    let subscribe = server
        .wait_for(
            |m| matches!(m.body, ClientBody::Subscribe(_)),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    match subscribe.body {
        ClientBody::Subscribe(SubscribeRequest::FileAttr {
            file_uuid,
            time_threshold_ms,
        }) => {
            assert_eq!(file_uuid, "uuid-2");
            assert_eq!(time_threshold_ms, Some(30_000));
        }
        other => panic!("expected file_attr subscribe, got {other:?}"),
    }
}

#[tokio::test]
async fn location_subscription_is_reference_counted() {
    let (server, subscriptions) = connect().await;

    subscriptions
        .add_file_location_subscription("uuid-3")
        .await
        .unwrap();
    subscriptions
        .add_file_location_subscription("uuid-3")
        .await
        .unwrap();
    assert_eq!(count_subscribes(&server), 1);

    // First release keeps the registration.
    subscriptions
        .remove_file_location_subscription("uuid-3")
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cancel_ids(&server).is_empty());

    // Last release cancels.
    subscriptions
        .remove_file_location_subscription("uuid-3")
        .await;
    server
        .wait_for(
            |m| matches!(m.body, ClientBody::SubscribeCancel { .. }),
            Duration::from_secs(2),
        )
        .await
        .expect("cancellation sent after last release");
}

#[tokio::test]
async fn permission_subscription_cancel_carries_the_granted_id() {
    let (server, subscriptions) = connect().await;

    subscriptions
        .add_permission_changed_subscription("uuid-4")
        .await
        .unwrap();
    subscriptions
        .remove_permission_changed_subscription("uuid-4")
        .await;

    server
        .wait_for(
            |m| matches!(m.body, ClientBody::SubscribeCancel { .. }),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    // The mock grants ids starting at 1; the cancel must echo the granted
    // id, and only once.
    assert_eq!(cancel_ids(&server), vec![1]);
}
