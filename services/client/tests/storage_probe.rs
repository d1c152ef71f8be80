//! Storage access probe: direct when the test file reads back as expected,
//! proxy downgrade otherwise, recorded mode short-circuits.

use remora::cache::{AccessMode, HelpersCache};
use remora::comm::pool::{HandshakeBuilder, HandshakeResponder, HandshakeVerdict, PoolConfig};
use remora::comm::{Communicator, ErrorPolicy};
use remora_proto::{
    ClientBody, HandshakeAuth, HandshakeRequest, StorageTestFileWire,
};
use remora_test_utils::MockProviderServer;
use std::collections::BTreeMap;
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

async fn connect() -> (MockProviderServer, Arc<Communicator>) {
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
    (server, communicator)
}

fn posix_test_file(root: &std::path::Path, expected: &str) -> StorageTestFileWire {
    let mut helper_args = BTreeMap::new();
    helper_args.insert("root".to_owned(), root.display().to_string());
    StorageTestFileWire {
        storage_id: "s1".to_owned(),
        helper_name: "posix".to_owned(),
        helper_args,
        file_id: "probe-file".to_owned(),
        expected_content: expected.to_owned(),
    }
}

#[tokio::test]
async fn matching_probe_records_direct_access() {
    let (server, communicator) = connect().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("probe-file"), b"probe-content").unwrap();
    server.add_test_file("s1", posix_test_file(dir.path(), "probe-content"));

    let cache = HelpersCache::new(communicator);
    let helper = cache.get("file-1", "s1", false).await.unwrap();
    assert_eq!(cache.access_mode("s1"), Some(AccessMode::Direct));

    // The returned helper reads the storage directly.
    std::fs::write(dir.path().join("data"), b"direct-bytes").unwrap();
    let read = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 32];
        let n = helper.read("data", &mut buf, 0).unwrap();
        buf[..n].to_vec()
    })
    .await
    .unwrap();
    assert_eq!(read, b"direct-bytes");

    // Probe verdict reported to the provider.
    let verification = server
        .wait_for(
            |m| matches!(m.body, ClientBody::StorageTestFileVerification { .. }),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert!(matches!(
        verification.body,
        ClientBody::StorageTestFileVerification { ok: true, .. }
    ));
}

#[tokio::test]
async fn mismatched_probe_downgrades_to_proxy() {
    let (server, communicator) = connect().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("probe-file"), b"actual-content").unwrap();
    server.add_test_file("s1", posix_test_file(dir.path(), "expected-content"));
    server.add_proxy_file("data", b"proxied-bytes");

    let cache = HelpersCache::new(communicator);
    let helper = cache.get("file-1", "s1", false).await.unwrap();
    assert_eq!(cache.access_mode("s1"), Some(AccessMode::Proxy));

    // Bytes flow through the provider.
    let read = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 32];
        let n = helper.read("data", &mut buf, 0).unwrap();
        buf[..n].to_vec()
    })
    .await
    .unwrap();
    assert_eq!(read, b"proxied-bytes");

    let verification = server
        .wait_for(
            |m| matches!(m.body, ClientBody::StorageTestFileVerification { .. }),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert!(matches!(
        verification.body,
        ClientBody::StorageTestFileVerification { ok: false, .. }
    ));
}

#[tokio::test]
async fn recorded_mode_short_circuits_without_reprobing() {
    let (server, communicator) = connect().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("probe-file"), b"probe-content").unwrap();
    server.add_test_file("s1", posix_test_file(dir.path(), "probe-content"));

    let cache = HelpersCache::new(communicator);
    let _ = cache.get("file-1", "s1", false).await.unwrap();
    let _ = cache.get("file-2", "s1", false).await.unwrap();
    let _ = cache.get("file-3", "s1", false).await.unwrap();

    let probes = server
        .received()
        .iter()
        .filter(|m| matches!(m.body, ClientBody::GetStorageTestFile { .. }))
        .count();
    assert_eq!(probes, 1, "only the first get may probe");
}

#[tokio::test]
async fn force_proxy_bypasses_probe_and_recorded_mode() {
    let (server, communicator) = connect().await;
    server.add_proxy_file("data", b"proxied");

    let cache = HelpersCache::new(communicator);
    let helper = cache.get("file-1", "s9", true).await.unwrap();

    // Forced proxying neither probes nor records a mode.
    assert_eq!(cache.access_mode("s9"), None);
    let probes = server
        .received()
        .iter()
        .filter(|m| matches!(m.body, ClientBody::GetStorageTestFile { .. }))
        .count();
    assert_eq!(probes, 0);

    let read = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 16];
        let n = helper.read("data", &mut buf, 0).unwrap();
        buf[..n].to_vec()
    })
    .await
    .unwrap();
    assert_eq!(read, b"proxied");
}
