//! Process-wide component wiring and lifecycle.
//!
//! The context is built once in `main` and handed down; children receive
//! the siblings they need at construction and never hold back-references.
//! A router task drains the communicator's server-message channel and
//! dispatches to the event manager, the caches, and the stream manager.

use crate::auth::registry::RegistryClient;
use crate::auth::token_store::TokenStore;
use crate::auth::{AuthCommon, CertificateAuthManager, TokenAuthManager};
use crate::cache::{AttrCache, HelpersCache, LocationCache};
use crate::comm::pool::{HandshakeResponder, PoolConfig};
use crate::comm::{Communicator, ErrorPolicy, StreamManager};
use crate::config::{AuthMethod, ClientConfig};
use crate::error::ClientError;
use crate::events::EventManager;
use crate::scheduler::Scheduler;
use crate::subscriptions::FsSubscriptions;
use remora_proto::{ServerBody, ServerMessage};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Context {
    pub scheduler: Scheduler,
    pub communicator: Arc<Communicator>,
    pub streams: Arc<StreamManager>,
    pub events: Arc<EventManager>,
    pub subscriptions: Arc<FsSubscriptions>,
    pub attrs: Arc<AttrCache>,
    pub locations: Arc<LocationCache>,
    pub helpers: Arc<HelpersCache>,
    token_auth: Option<Arc<TokenAuthManager>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Context {
    /// Connect and wire the whole client core. Returns once the first
    /// handshake succeeded (or failed terminally).
    pub async fn new(
        config: &ClientConfig,
        responder: HandshakeResponder,
    ) -> Result<Arc<Self>, ClientError> {
        let scheduler = Scheduler::new();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let pool = PoolConfig {
            url: config.provider.ws_url(),
            pool_size: config.pool.size,
            handshake_retry: config.pool.handshake_retry,
            error_policy: ErrorPolicy::Retry,
        };

        let common = AuthCommon::from_environment(config.env_prefix.clone());
        let mut token_auth = None;
        let communicator = match config.auth.method {
            AuthMethod::Token => {
                let manager = TokenAuthManager::bootstrap(
                    common,
                    RegistryClient::new(&config.registry.base_url()),
                    TokenStore::at(TokenStore::default_path()),
                    scheduler.clone(),
                    config.auth.refresh_margin,
                    config.auth.authorization_code.as_deref(),
                )
                .await?;
                let communicator = manager
                    .create_communicator(pool, responder, server_tx)
                    .await?;
                token_auth = Some(manager);
                communicator
            }
            AuthMethod::Certificate => {
                let manager = CertificateAuthManager::bootstrap(
                    common,
                    config.auth.cert_path.as_deref().unwrap_or_default(),
                    config.auth.key_path.as_deref().unwrap_or_default(),
                )?;
                manager
                    .create_communicator(pool, responder, server_tx)
                    .await?
            }
        };
        info!(
            session_id = communicator.session_id().as_deref().unwrap_or(""),
            "session established"
        );

        let streams = Arc::new(StreamManager::new(
            Arc::clone(&communicator) as Arc<dyn crate::comm::RawSink>
        ));
        let events = Arc::new(EventManager::new(&scheduler, &streams));
        let subscriptions =
            FsSubscriptions::new(Arc::clone(&communicator), scheduler.clone());
        let attrs = AttrCache::new(scheduler.clone(), config.cache.attr_expiry);
        let locations = LocationCache::new(
            Arc::clone(&communicator),
            scheduler.clone(),
            config.cache.location_renew_window,
        );
        let helpers = HelpersCache::new(Arc::clone(&communicator));

        let context = Arc::new(Context {
            scheduler,
            communicator,
            streams,
            events,
            subscriptions,
            attrs,
            locations,
            helpers,
            token_auth,
            tasks: Mutex::new(Vec::new()),
        });

        let router = tokio::spawn(route(
            server_rx,
            Arc::clone(&context.streams),
            Arc::clone(&context.events),
            Arc::clone(&context.attrs),
            Arc::clone(&context.locations),
        ));
        let session_watcher = tokio::spawn(watch_session(
            context.communicator.status(),
            context.communicator.session_id(),
            Arc::clone(&context.streams),
        ));
        context
            .tasks
            .lock()
            .unwrap()
            .extend([router, session_watcher]);

        Ok(context)
    }

    /// Flush event streams, close them, and stop the router (unmount path).
    pub async fn shutdown(&self) {
        self.events.shutdown(&self.streams);
        if let Some(token_auth) = &self.token_auth {
            token_auth.stop();
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("client core shut down");
    }
}

/// Reset every stream when the provider hands out a new session id.
async fn watch_session(
    mut status_rx: tokio::sync::watch::Receiver<crate::comm::pool::PoolStatus>,
    initial: Option<String>,
    streams: Arc<StreamManager>,
) {
    let mut current = initial;
    while status_rx.changed().await.is_ok() {
        let session = match &*status_rx.borrow() {
            crate::comm::pool::PoolStatus::Connected { session_id } => Some(session_id.clone()),
            _ => None,
        };
        if let Some(session) = session {
            if current.as_deref() != Some(session.as_str()) {
                info!(session_id = %session, "session reestablished, resetting streams");
                streams.reset_all();
                current = Some(session);
            }
        }
    }
}

/// Dispatch loop for server-initiated messages.
async fn route(
    mut server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    streams: Arc<StreamManager>,
    events: Arc<EventManager>,
    attrs: Arc<AttrCache>,
    locations: Arc<LocationCache>,
) {
    while let Some(msg) = server_rx.recv().await {
        match msg.body {
            ServerBody::MessageRequest {
                stream_id,
                lower_sequence_number,
                upper_sequence_number,
            } => streams.handle_request(stream_id, lower_sequence_number, upper_sequence_number),
            ServerBody::MessageAcknowledgement {
                stream_id,
                sequence_number,
            } => streams.handle_ack(stream_id, sequence_number),
            ServerBody::FileLocation(wire) => locations.update_from_server(wire).await,
            ServerBody::FileAttrChanged { attr } => attrs.update_from_server(attr),
            ServerBody::PermissionChanged { file_uuid } => {
                debug!(file_uuid = %file_uuid, "permission changed, invalidating attributes");
                attrs.invalidate_uuid(&file_uuid);
            }
            ref body if events.on_server_message(body) => {}
            other => warn!(?other, "unhandled server message dropped"),
        }
    }
}
