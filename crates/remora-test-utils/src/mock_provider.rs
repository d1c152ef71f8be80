// mock_provider: A mock WebSocket provider for testing the client core.
//
// Accepts connections on ws://127.0.0.1:<port>, answers handshakes,
// auto-replies to subscribe/location/test-file requests from scripted
// tables, records every client message, and lets tests push arbitrary
// server messages to all connected clients.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use remora_proto::*;
use tokio::net::TcpListener;
use tokio::sync::{Notify, broadcast};
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock provider endpoint for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound address. Each test
/// spins up its own isolated instance.
///
/// # Protocol behavior
///
/// - The first message on a connection must be `handshake_request`; the
///   reply carries the configured status (default `ok`) and a generated
///   session id.
/// - `subscribe` requests are answered with `subscribe_reply` carrying an
///   incrementing id.
/// - `get_file_location` / `get_storage_test_file` are answered from the
///   scripted tables, or with `status: not_found`.
/// - `proxy_read` / `proxy_write` operate on an in-memory file table.
/// - Every parsed client message is recorded for assertions.
pub struct MockProviderServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    _task: tokio::task::JoinHandle<()>,
}

struct MockState {
    received: Mutex<Vec<ClientMessage>>,
    received_notify: Notify,
    push_tx: broadcast::Sender<ServerMessage>,
    next_subscription_id: AtomicI64,
    handshake_status: Mutex<HandshakeStatus>,
    protocol_version: Mutex<ProtocolVersion>,
    locations: Mutex<HashMap<String, FileLocationWire>>,
    test_files: Mutex<HashMap<String, StorageTestFileWire>>,
    proxy_files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockProviderServer {
    /// Start the mock provider, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (push_tx, _) = broadcast::channel(64);

        let state = Arc::new(MockState {
            received: Mutex::new(Vec::new()),
            received_notify: Notify::new(),
            push_tx,
            next_subscription_id: AtomicI64::new(1),
            handshake_status: Mutex::new(HandshakeStatus::Ok),
            protocol_version: Mutex::new(ProtocolVersion { major: 1, minor: 0 }),
            locations: Mutex::new(HashMap::new()),
            test_files: Mutex::new(HashMap::new()),
            proxy_files: Mutex::new(HashMap::new()),
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            // Client drops are expected in tests; swallow.
                            let _ = handle_connection(stream, state).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL of this endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Status for subsequent handshakes (default `ok`).
    pub fn set_handshake_status(&self, status: HandshakeStatus) {
        *self.state.handshake_status.lock().unwrap() = status;
    }

    /// Protocol version advertised in handshake responses.
    pub fn set_protocol_version(&self, version: ProtocolVersion) {
        *self.state.protocol_version.lock().unwrap() = version;
    }

    /// Script the reply to `get_file_location` for a path.
    pub fn add_location(&self, path: &str, wire: FileLocationWire) {
        self.state
            .locations
            .lock()
            .unwrap()
            .insert(path.to_owned(), wire);
    }

    /// Script the reply to `get_storage_test_file` for a storage.
    pub fn add_test_file(&self, storage_id: &str, wire: StorageTestFileWire) {
        self.state
            .test_files
            .lock()
            .unwrap()
            .insert(storage_id.to_owned(), wire);
    }

    /// Seed a file served through `proxy_read` / `proxy_write`.
    pub fn add_proxy_file(&self, file_id: &str, content: &[u8]) {
        self.state
            .proxy_files
            .lock()
            .unwrap()
            .insert(file_id.to_owned(), content.to_vec());
    }

    /// Push a server message to every connected client.
    pub fn push(&self, body: ServerBody) {
        let _ = self.state.push_tx.send(ServerMessage {
            message_id: None,
            body,
        });
    }

    /// Snapshot of everything received so far.
    pub fn received(&self) -> Vec<ClientMessage> {
        self.state.received.lock().unwrap().clone()
    }

    /// Wait until a received message satisfies `pred`, up to `timeout`.
    pub async fn wait_for<F>(&self, pred: F, timeout: Duration) -> Option<ClientMessage>
    where
        F: Fn(&ClientMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self
                .state
                .received
                .lock()
                .unwrap()
                .iter()
                .find(|msg| pred(msg))
                .cloned()
            {
                return Some(found);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining, self.state.received_notify.notified()).await;
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    state: Arc<MockState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    let mut push_rx = state.push_tx.subscribe();
    let session_id = uuid::Uuid::new_v4().to_string();
    let mut hello_received = false;

    loop {
        tokio::select! {
            pushed = push_rx.recv() => {
                if let Ok(msg) = pushed {
                    if hello_received {
                        let json = serde_json::to_string(&msg)?;
                        write.send(Message::Text(json.into())).await?;
                    }
                }
            }
            inbound = read.next() => {
                let Some(msg_result) = inbound else { break };
                let text = match msg_result? {
                    Message::Text(t) => t,
                    Message::Close(_) => break,
                    Message::Ping(data) => {
                        write.send(Message::Pong(data)).await?;
                        continue;
                    }
                    _ => continue,
                };

                let msg: ClientMessage = serde_json::from_str(&text)?;
                state.received.lock().unwrap().push(msg.clone());
                state.received_notify.notify_waiters();

                if let ClientBody::HandshakeRequest(_) = &msg.body {
                    hello_received = true;
                    let status = *state.handshake_status.lock().unwrap();
                    let response = ServerMessage {
                        message_id: msg.message_id.clone(),
                        body: ServerBody::HandshakeResponse(HandshakeResponse {
                            session_id: matches!(status, HandshakeStatus::Ok)
                                .then(|| session_id.clone()),
                            status,
                            protocol_version: *state.protocol_version.lock().unwrap(),
                        }),
                    };
                    let json = serde_json::to_string(&response)?;
                    write.send(Message::Text(json.into())).await?;
                    continue;
                }

                if let Some(reply) = auto_reply(&state, &msg) {
                    let json = serde_json::to_string(&reply)?;
                    write.send(Message::Text(json.into())).await?;
                }
            }
        }
    }

    Ok(())
}

/// Scripted auto-replies for request/reply message kinds.
fn auto_reply(state: &MockState, msg: &ClientMessage) -> Option<ServerMessage> {
    let body = match &msg.body {
        ClientBody::Subscribe(_) => ServerBody::SubscribeReply {
            id: state.next_subscription_id.fetch_add(1, Ordering::Relaxed),
        },
        ClientBody::GetFileLocation { path } => {
            match state.locations.lock().unwrap().get(path) {
                Some(wire) => ServerBody::FileLocation(wire.clone()),
                None => ServerBody::Status {
                    code: StatusCode::NotFound,
                },
            }
        }
        ClientBody::GetStorageTestFile { storage_id } => {
            match state.test_files.lock().unwrap().get(storage_id) {
                Some(wire) => ServerBody::StorageTestFile(wire.clone()),
                None => ServerBody::Status {
                    code: StatusCode::NotFound,
                },
            }
        }
        ClientBody::ProxyRead {
            file_id,
            offset,
            size,
            ..
        } => match state.proxy_files.lock().unwrap().get(file_id) {
            Some(content) => {
                let start = (*offset as usize).min(content.len());
                let end = (start + *size as usize).min(content.len());
                ServerBody::ProxyData {
                    data_base64: base64::engine::general_purpose::STANDARD
                        .encode(&content[start..end]),
                }
            }
            None => ServerBody::Status {
                code: StatusCode::NotFound,
            },
        },
        ClientBody::ProxyWrite {
            file_id,
            offset,
            data_base64,
            ..
        } => {
            let data = base64::engine::general_purpose::STANDARD
                .decode(data_base64)
                .unwrap_or_default();
            let mut files = state.proxy_files.lock().unwrap();
            let content = files.entry(file_id.clone()).or_default();
            let offset = *offset as usize;
            if content.len() < offset + data.len() {
                content.resize(offset + data.len(), 0);
            }
            content[offset..offset + data.len()].copy_from_slice(&data);
            ServerBody::ProxyWritten {
                written: data.len() as u64,
            }
        }
        _ => return None,
    };
    Some(ServerMessage {
        message_id: msg.message_id.clone(),
        body,
    })
}
