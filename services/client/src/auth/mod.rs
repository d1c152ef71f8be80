//! Session authentication: handshake construction for certificate and
//! token sessions, plus the token refresh lifecycle.
//!
//! Both variants satisfy the same contract: `create_communicator` connects
//! a pool with the variant's handshake material and returns once the first
//! handshake response arrives. Token sessions additionally keep themselves
//! fresh — a refresh is scheduled at `expires_at − margin`, swaps the pair
//! atomically, persists it, and re-issues the handshake.

pub mod registry;
pub mod token_store;

use crate::comm::pool::{HandshakeBuilder, HandshakeResponder, PoolConfig};
use crate::comm::{CommError, Communicator};
use crate::scheduler::{CancelHandle, Scheduler};
use base64::Engine;
use chrono::Utc;
use registry::RegistryClient;
use remora_proto::{HandshakeAuth, HandshakeRequest, ServerMessage};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use token_store::{TokenDetails, TokenStore};
use tracing::{info, warn};

/// Backoff before retrying a failed token refresh.
const REFRESH_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token store: {0}")]
    TokenStore(String),
    #[error("token store holds unsupported version {0}")]
    UnsupportedTokenVersion(u32),
    #[error("registry: {0}")]
    Registry(String),
    #[error("no cached tokens and no authorization code configured")]
    MissingAuthorizationCode,
    #[error("certificate identity not usable: {0}")]
    Certificate(String),
    #[error("handshake: {0}")]
    Handshake(#[from] CommError),
}

// ---------------------------------------------------------------------------
// Shared handshake pieces
// ---------------------------------------------------------------------------

/// Handshake fields common to both auth variants.
#[derive(Debug, Clone)]
pub struct AuthCommon {
    /// Client hostname reported to the provider.
    pub hostname: String,
    /// Environment variables with this prefix are forwarded in the
    /// handshake (e.g. `REMORA_GROUP_ID`).
    pub env_prefix: String,
}

impl AuthCommon {
    pub fn from_environment(env_prefix: impl Into<String>) -> Self {
        AuthCommon {
            hostname: client_hostname(),
            env_prefix: env_prefix.into(),
        }
    }
}

fn client_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_owned())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}

fn filtered_env(prefix: &str) -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with(prefix))
        .collect()
}

/// `base64(sha256(token))`, as carried in token handshakes.
pub fn hash_token(token: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(token.as_bytes()))
}

// ---------------------------------------------------------------------------
// Token sessions
// ---------------------------------------------------------------------------

pub struct TokenAuthManager {
    weak: Weak<TokenAuthManager>,
    common: AuthCommon,
    registry: RegistryClient,
    store: TokenStore,
    details: Arc<RwLock<TokenDetails>>,
    scheduler: Scheduler,
    runtime: tokio::runtime::Handle,
    refresh_margin: Duration,
    refresh_handle: Mutex<CancelHandle>,
}

impl TokenAuthManager {
    /// Obtain token details from the on-disk store, or by exchanging the
    /// configured authorization code when no cached pair exists.
    pub async fn bootstrap(
        common: AuthCommon,
        registry: RegistryClient,
        store: TokenStore,
        scheduler: Scheduler,
        refresh_margin: Duration,
        authorization_code: Option<&str>,
    ) -> Result<Arc<Self>, AuthError> {
        let details = match store.load()? {
            Some(details) => details,
            None => {
                let code = authorization_code.ok_or(AuthError::MissingAuthorizationCode)?;
                let details = registry.exchange_code(code).await?;
                store.save(&details)?;
                info!(gr_uid = %details.gr_uid, "obtained initial token pair");
                details
            }
        };

        Ok(Arc::new_cyclic(|weak| TokenAuthManager {
            weak: weak.clone(),
            common,
            registry,
            store,
            details: Arc::new(RwLock::new(details)),
            scheduler,
            runtime: tokio::runtime::Handle::current(),
            refresh_margin,
            refresh_handle: Mutex::new(CancelHandle::noop()),
        }))
    }

    /// Connect a communicator authenticated by the current access token and
    /// start the refresh schedule.
    pub async fn create_communicator(
        &self,
        pool: PoolConfig,
        responder: HandshakeResponder,
        server_tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<Arc<Communicator>, AuthError> {
        let communicator =
            Communicator::connect(pool, self.handshake_builder(), responder, server_tx).await?;
        self.schedule_refresh(Arc::downgrade(&communicator));
        Ok(communicator)
    }

    fn handshake_builder(&self) -> HandshakeBuilder {
        let details = Arc::clone(&self.details);
        let hostname = self.common.hostname.clone();
        let prefix = self.common.env_prefix.clone();
        Arc::new(move |ctx| HandshakeRequest {
            hostname: hostname.clone(),
            session_id: ctx.session_id.clone(),
            env_vars: filtered_env(&prefix),
            auth: HandshakeAuth::Token {
                token_hash: hash_token(&details.read().unwrap().access_token),
            },
        })
    }

    /// Delay until the next refresh: `expires_at − margin`, floored at zero.
    fn refresh_delay(&self) -> Duration {
        let expires_at = self.details.read().unwrap().expires_at;
        let remaining = expires_at - Utc::now();
        let margin = chrono::Duration::from_std(self.refresh_margin).unwrap_or_default();
        (remaining - margin).to_std().unwrap_or(Duration::ZERO)
    }

    fn schedule_refresh(&self, communicator: Weak<Communicator>) {
        let delay = self.refresh_delay();
        let manager = self.weak.clone();
        let runtime = self.runtime.clone();
        let handle = self.scheduler.schedule(delay, move || {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            runtime.spawn(async move {
                manager.refresh(communicator).await;
            });
        });
        *self.refresh_handle.lock().unwrap() = handle;
    }

    fn refresh(
        self: Arc<Self>,
        communicator: Weak<Communicator>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            let refresh_token = self.details.read().unwrap().refresh_token.clone();
            match self.registry.refresh(&refresh_token).await {
                Ok(fresh) => {
                    *self.details.write().unwrap() = fresh.clone();
                    if let Err(e) = self.store.save(&fresh) {
                        warn!(error = %e, "failed to persist refreshed tokens");
                    }
                    info!(expires_at = %fresh.expires_at, "token pair refreshed");
                    if let Some(communicator) = communicator.upgrade() {
                        communicator.rehandshake();
                    }
                    self.schedule_refresh(communicator);
                }
                Err(e) => {
                    warn!(error = %e, "token refresh failed, retrying");
                    let manager = self.weak.clone();
                    let runtime = self.runtime.clone();
                    let handle = self.scheduler.schedule(REFRESH_RETRY, move || {
                        let Some(manager) = manager.upgrade() else {
                            return;
                        };
                        runtime.spawn(async move {
                            manager.refresh(communicator).await;
                        });
                    });
                    *self.refresh_handle.lock().unwrap() = handle;
                }
            }
        })
    }

    /// Stop the refresh schedule (shutdown path).
    pub fn stop(&self) {
        self.refresh_handle.lock().unwrap().cancel();
    }
}

// ---------------------------------------------------------------------------
// Certificate sessions
// ---------------------------------------------------------------------------

pub struct CertificateAuthManager {
    common: AuthCommon,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CertificateAuthManager {
    /// Resolve the X.509 identity from explicit paths, honoring the
    /// conventional environment overrides. The identity itself travels at
    /// the TLS layer; this manager only verifies the files are present and
    /// builds handshakes.
    pub fn bootstrap(
        common: AuthCommon,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Result<Arc<Self>, AuthError> {
        let cert_path = std::env::var_os("X509_USER_CERT")
            .map(PathBuf::from)
            .unwrap_or_else(|| cert_path.into());
        let key_path = std::env::var_os("X509_USER_KEY")
            .map(PathBuf::from)
            .unwrap_or_else(|| key_path.into());

        for path in [&cert_path, &key_path] {
            std::fs::metadata(path)
                .map_err(|e| AuthError::Certificate(format!("{}: {e}", path.display())))?;
        }

        Ok(Arc::new(CertificateAuthManager {
            common,
            cert_path,
            key_path,
        }))
    }

    pub fn cert_path(&self) -> &PathBuf {
        &self.cert_path
    }

    pub fn key_path(&self) -> &PathBuf {
        &self.key_path
    }

    pub async fn create_communicator(
        &self,
        pool: PoolConfig,
        responder: HandshakeResponder,
        server_tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<Arc<Communicator>, AuthError> {
        let communicator =
            Communicator::connect(pool, self.handshake_builder(), responder, server_tx).await?;
        Ok(communicator)
    }

    fn handshake_builder(&self) -> HandshakeBuilder {
        let hostname = self.common.hostname.clone();
        let prefix = self.common.env_prefix.clone();
        Arc::new(move |ctx| HandshakeRequest {
            hostname: hostname.clone(),
            session_id: ctx.session_id.clone(),
            env_vars: filtered_env(&prefix),
            auth: HandshakeAuth::Certificate {
                confirmation: ctx.confirmation.clone(),
            },
        })
    }
}
