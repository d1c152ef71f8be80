//! WebSocket connection pool with handshake lifecycle.
//!
//! The pool owns `pool_size` connections, one tokio task each. Outbound
//! frames are drawn from a shared queue by whichever connection is free —
//! deliberately unordered; per-stream ordering is reconstructed by the
//! receiver from sequence numbers. Each connection authenticates with a
//! handshake before entering its send/receive loop and reconnects with a
//! flat backoff on transient failure.

use super::{CommError, PROTOCOL_MAJOR};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use remora_proto::{
    CertificateConfirmation, ClientBody, ClientMessage, HandshakeRequest, HandshakeResponse,
    HandshakeStatus, ServerBody, ServerMessage,
};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ---------------------------------------------------------------------------
// Configuration and callbacks
// ---------------------------------------------------------------------------

/// Behavior on transient connect/handshake failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Keep retrying with a flat backoff.
    Retry,
    /// Fail the pool on the first transient error.
    Fail,
}

#[derive(Clone)]
pub struct PoolConfig {
    /// WebSocket URL of the provider endpoint, e.g. `wss://provider.example.com/client/protocol`.
    pub url: String,
    pub pool_size: usize,
    /// Flat backoff between handshake/connect attempts.
    pub handshake_retry: Duration,
    pub error_policy: ErrorPolicy,
}

/// Everything the auth layer needs to know to build a handshake request.
#[derive(Debug, Clone, Default)]
pub struct HandshakeContext {
    /// Session id adopted from an earlier successful handshake, if any.
    pub session_id: Option<String>,
    /// Certificate confirmation granted by the user, present only on the
    /// single retry that follows `cert_confirmation_required`.
    pub confirmation: Option<CertificateConfirmation>,
}

/// Builds the handshake request from the current auth material; supplied by
/// the auth manager so a token refresh is picked up on the next handshake.
pub type HandshakeBuilder = Arc<dyn Fn(&HandshakeContext) -> HandshakeRequest + Send + Sync>;

/// Observes every handshake response; decides how to proceed on
/// `cert_confirmation_required` (this is where the UI prompt hangs off).
pub type HandshakeResponder = Arc<dyn Fn(&HandshakeResponse) -> HandshakeVerdict + Send + Sync>;

#[derive(Debug, Clone)]
pub enum HandshakeVerdict {
    Proceed,
    /// User granted certificate confirmation; re-handshake once with it.
    ConfirmCertificate(CertificateConfirmation),
    Abort,
}

// ---------------------------------------------------------------------------
// Pool status
// ---------------------------------------------------------------------------

/// Cloneable failure record carried in the status channel.
#[derive(Debug, Clone)]
pub enum PoolFailure {
    Connect(String),
    Rejected(HandshakeStatus),
    VersionMismatch { major: u32, minor: u32 },
}

impl From<&PoolFailure> for CommError {
    fn from(failure: &PoolFailure) -> Self {
        match failure {
            PoolFailure::Connect(msg) => CommError::Connect(msg.clone()),
            PoolFailure::Rejected(status) => CommError::HandshakeRejected(*status),
            PoolFailure::VersionMismatch { major, minor } => CommError::VersionMismatch {
                major: *major,
                minor: *minor,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum PoolStatus {
    Connecting,
    Connected { session_id: String },
    Failed(PoolFailure),
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

pub struct ConnectionPool {
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    status_rx: watch::Receiver<PoolStatus>,
    rehandshake_tx: watch::Sender<u64>,
    session: Arc<RwLock<Option<String>>>,
}

impl ConnectionPool {
    /// Start the pool's connection tasks. Inbound messages (other than
    /// handshake responses, which are consumed by the handshake lifecycle)
    /// are forwarded to `inbound_tx`.
    pub fn spawn(
        cfg: PoolConfig,
        builder: HandshakeBuilder,
        responder: HandshakeResponder,
        inbound_tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared_rx = Arc::new(tokio::sync::Mutex::new(outbound_rx));
        let (status_tx, status_rx) = watch::channel(PoolStatus::Connecting);
        let status_tx = Arc::new(status_tx);
        let (rehandshake_tx, _) = watch::channel(0u64);
        let session = Arc::new(RwLock::new(None));

        for idx in 0..cfg.pool_size.max(1) {
            let conn = ConnectionTask {
                idx,
                cfg: cfg.clone(),
                builder: Arc::clone(&builder),
                responder: Arc::clone(&responder),
                shared_rx: Arc::clone(&shared_rx),
                outbound_tx: outbound_tx.clone(),
                inbound_tx: inbound_tx.clone(),
                status_tx: Arc::clone(&status_tx),
                session: Arc::clone(&session),
                rehandshake_rx: rehandshake_tx.subscribe(),
            };
            tokio::spawn(conn.run());
        }

        ConnectionPool {
            outbound_tx,
            status_rx,
            rehandshake_tx,
            session,
        }
    }

    /// Queue a frame for whichever connection is free next. Never fails;
    /// frames queued after shutdown are silently dropped (stream replay
    /// recovers stream messages).
    pub fn enqueue(&self, msg: ClientMessage) {
        let _ = self.outbound_tx.send(msg);
    }

    /// Make every connection re-issue the handshake with fresh auth
    /// material (token refresh, certificate confirmation).
    pub fn rehandshake(&self) {
        self.rehandshake_tx.send_modify(|generation| *generation += 1);
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.read().unwrap().clone()
    }

    /// Watch connection status; used to observe session reestablishment.
    pub fn status(&self) -> watch::Receiver<PoolStatus> {
        self.status_rx.clone()
    }

    /// Resolve once the first handshake succeeds or the pool fails
    /// terminally.
    pub async fn wait_connected(&self) -> Result<(), CommError> {
        let mut rx = self.status_rx.clone();
        loop {
            {
                let status = rx.borrow();
                match &*status {
                    PoolStatus::Connected { .. } => return Ok(()),
                    PoolStatus::Failed(failure) => return Err(failure.into()),
                    PoolStatus::Connecting => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(CommError::Closed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection task
// ---------------------------------------------------------------------------

enum HandshakeFailure {
    Transient(String),
    Fatal(PoolFailure),
}

struct ConnectionTask {
    idx: usize,
    cfg: PoolConfig,
    builder: HandshakeBuilder,
    responder: HandshakeResponder,
    shared_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientMessage>>>,
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    inbound_tx: mpsc::UnboundedSender<ServerMessage>,
    status_tx: Arc<watch::Sender<PoolStatus>>,
    session: Arc<RwLock<Option<String>>>,
    rehandshake_rx: watch::Receiver<u64>,
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            let (mut sink, mut source) = match connect_async(self.cfg.url.as_str()).await {
                Ok((ws, _response)) => ws.split(),
                Err(e) => {
                    if self.transient(format!("connect: {e}")).await {
                        continue;
                    }
                    return;
                }
            };

            match self.handshake(&mut sink, &mut source).await {
                Ok(session_id) => {
                    *self.session.write().unwrap() = Some(session_id.clone());
                    self.status_tx
                        .send_replace(PoolStatus::Connected { session_id });
                }
                Err(HandshakeFailure::Transient(msg)) => {
                    if self.transient(msg).await {
                        continue;
                    }
                    return;
                }
                Err(HandshakeFailure::Fatal(failure)) => {
                    warn!(connection = self.idx, ?failure, "handshake failed terminally");
                    self.status_tx.send_replace(PoolStatus::Failed(failure));
                    return;
                }
            }

            // Mark the rehandshake generation as seen so only future bumps
            // trigger a reconnect.
            self.rehandshake_rx.mark_unchanged();
            if !self.serve(&mut sink, &mut source).await {
                return;
            }
            debug!(connection = self.idx, "connection closed, reconnecting");
        }
    }

    /// Flat-backoff pause before the next attempt. Returns false when the
    /// error policy says to give up instead.
    async fn transient(&self, msg: String) -> bool {
        warn!(connection = self.idx, error = %msg, "transient connection failure");
        if self.cfg.error_policy == ErrorPolicy::Fail {
            self.status_tx
                .send_replace(PoolStatus::Failed(PoolFailure::Connect(msg)));
            return false;
        }
        tokio::time::sleep(self.cfg.handshake_retry).await;
        true
    }

    async fn handshake(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
    ) -> Result<String, HandshakeFailure> {
        let mut context = HandshakeContext {
            session_id: self.session.read().unwrap().clone(),
            confirmation: None,
        };
        loop {
            let request = (self.builder)(&context);
            let msg = ClientMessage::from_body(ClientBody::HandshakeRequest(request));
            send_frame(sink, &msg)
                .await
                .map_err(HandshakeFailure::Transient)?;

            let response = read_handshake_response(source)
                .await
                .map_err(HandshakeFailure::Transient)?;

            if response.protocol_version.major != PROTOCOL_MAJOR {
                return Err(HandshakeFailure::Fatal(PoolFailure::VersionMismatch {
                    major: response.protocol_version.major,
                    minor: response.protocol_version.minor,
                }));
            }

            let verdict = (self.responder)(&response);
            match response.status {
                HandshakeStatus::Ok => {
                    if matches!(verdict, HandshakeVerdict::Abort) {
                        return Err(HandshakeFailure::Fatal(PoolFailure::Rejected(
                            response.status,
                        )));
                    }
                    let session_id = response.session_id.unwrap_or_default();
                    info!(
                        connection = self.idx,
                        session_id = %session_id,
                        "handshake complete"
                    );
                    return Ok(session_id);
                }
                HandshakeStatus::CertConfirmationRequired => match verdict {
                    HandshakeVerdict::ConfirmCertificate(confirmation)
                        if context.confirmation.is_none() =>
                    {
                        // One retry carrying the user's confirmation.
                        context.confirmation = Some(confirmation);
                    }
                    _ => {
                        return Err(HandshakeFailure::Fatal(PoolFailure::Rejected(
                            response.status,
                        )));
                    }
                },
                HandshakeStatus::NoUserFound | HandshakeStatus::InvalidSession => {
                    return Err(HandshakeFailure::Fatal(PoolFailure::Rejected(
                        response.status,
                    )));
                }
            }
        }
    }

    /// Send/receive loop. Returns false when the pool is shutting down,
    /// true to reconnect.
    async fn serve(&mut self, sink: &mut WsSink, source: &mut WsSource) -> bool {
        loop {
            tokio::select! {
                biased;
                changed = self.rehandshake_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    // Fresh auth material; reconnect so the next handshake
                    // carries it.
                    info!(connection = self.idx, "re-issuing handshake with fresh credentials");
                    return true;
                }
                frame = next_outbound(&self.shared_rx) => {
                    let Some(msg) = frame else { return false };
                    if let Err(e) = send_frame(sink, &msg).await {
                        warn!(connection = self.idx, error = %e, "send failed, requeueing frame");
                        let _ = self.outbound_tx.send(msg);
                        return true;
                    }
                }
                inbound = source.next() => {
                    match inbound {
                        None => return true,
                        Some(Err(e)) => {
                            warn!(connection = self.idx, error = %e, "websocket error");
                            return true;
                        }
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(msg) => {
                                    if matches!(msg.body, ServerBody::HandshakeResponse(_)) {
                                        debug!(connection = self.idx, "ignoring handshake response outside handshake");
                                    } else if self.inbound_tx.send(msg).is_err() {
                                        return false;
                                    }
                                }
                                // Malformed messages are dropped without
                                // tearing the connection down.
                                Err(e) => warn!(connection = self.idx, error = %e, "malformed server message dropped"),
                            }
                        }
                        Some(Ok(Message::Close(_))) => return true,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }
}

/// Pop the next outbound frame from the shared queue.
///
/// Holding the queue lock parks this connection as the designated sender
/// until a frame arrives; cancelling (via select) releases it.
async fn next_outbound(
    shared_rx: &Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientMessage>>>,
) -> Option<ClientMessage> {
    let mut rx = shared_rx.lock().await;
    rx.recv().await
}

async fn send_frame(sink: &mut WsSink, msg: &ClientMessage) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| format!("serialize: {e}"))?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Read frames until the handshake response arrives.
async fn read_handshake_response(source: &mut WsSource) -> Result<HandshakeResponse, String> {
    loop {
        match source.next().await {
            None => return Err("connection closed during handshake".to_owned()),
            Some(Err(e)) => return Err(e.to_string()),
            Some(Ok(Message::Text(text))) => {
                let msg: ServerMessage = serde_json::from_str(&text)
                    .map_err(|e| format!("malformed handshake response: {e}"))?;
                match msg.body {
                    ServerBody::HandshakeResponse(response) => return Ok(response),
                    other => {
                        debug!(?other, "ignoring message before handshake response");
                    }
                }
            }
            Some(Ok(Message::Close(_))) => {
                return Err("connection closed during handshake".to_owned());
            }
            Some(Ok(_)) => {}
        }
    }
}
