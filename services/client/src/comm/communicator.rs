//! Request/reply communicator over the connection pool.
//!
//! Fire-and-forget sends go straight to the pool queue. Request/reply
//! exchanges stamp a correlation id and park a oneshot in the pending map;
//! a demux task completes them and forwards everything else (server pushes,
//! stream control) to the server-message channel consumed by the context
//! router.

use super::CommError;
use super::pool::{
    ConnectionPool, HandshakeBuilder, HandshakeResponder, PoolConfig,
};
use super::stream::RawSink;
use remora_proto::{ClientBody, ClientMessage, ServerMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Communicator {
    pool: ConnectionPool,
    pending: Mutex<HashMap<String, oneshot::Sender<ServerMessage>>>,
    runtime: tokio::runtime::Handle,
}

impl Communicator {
    /// Connect the pool and block until the first handshake response (or a
    /// terminal failure). Messages that are not correlated replies arrive
    /// on `server_tx`.
    pub async fn connect(
        cfg: PoolConfig,
        builder: HandshakeBuilder,
        responder: HandshakeResponder,
        server_tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<Arc<Self>, CommError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::spawn(cfg, builder, responder, inbound_tx);
        let communicator = Arc::new(Communicator {
            pool,
            pending: Mutex::new(HashMap::new()),
            runtime: tokio::runtime::Handle::current(),
        });

        tokio::spawn(demux(
            inbound_rx,
            Arc::downgrade(&communicator),
            server_tx,
        ));

        communicator.pool.wait_connected().await?;
        Ok(communicator)
    }

    /// Fire-and-forget send.
    pub fn send(&self, body: ClientBody) {
        self.pool.enqueue(ClientMessage::from_body(body));
    }

    /// Send a request and await the correlated reply.
    pub async fn communicate(&self, body: ClientBody) -> Result<ServerMessage, CommError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        self.pool.enqueue(ClientMessage {
            message_id: Some(id.clone()),
            message_stream: None,
            body,
        });

        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CommError::Closed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(CommError::Timeout)
            }
        }
    }

    /// Request/reply for callers outside the runtime (FUSE threads via the
    /// proxy helper). Must NOT be called from a runtime worker thread.
    pub fn communicate_blocking(&self, body: ClientBody) -> Result<ServerMessage, CommError> {
        self.runtime.block_on(self.communicate(body))
    }

    /// Re-issue the handshake on every connection with fresh auth material.
    pub fn rehandshake(&self) {
        self.pool.rehandshake();
    }

    /// Server-assigned session id from the last successful handshake.
    pub fn session_id(&self) -> Option<String> {
        self.pool.session_id()
    }

    /// Watch pool status; a changed session id means the session was
    /// reestablished and streams must reset.
    pub fn status(&self) -> tokio::sync::watch::Receiver<super::pool::PoolStatus> {
        self.pool.status()
    }
}

impl RawSink for Communicator {
    fn dispatch(&self, msg: &ClientMessage) {
        self.pool.enqueue(msg.clone());
    }
}

async fn demux(
    mut inbound_rx: mpsc::UnboundedReceiver<ServerMessage>,
    communicator: Weak<Communicator>,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    while let Some(msg) = inbound_rx.recv().await {
        if let Some(id) = msg.message_id.clone() {
            if let Some(communicator) = communicator.upgrade() {
                let waiter = communicator.pending.lock().unwrap().remove(&id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(msg);
                    continue;
                }
            }
        }
        if server_tx.send(msg).is_err() {
            break;
        }
    }
}
