//! Storage helper cache and direct-access probe.
//!
//! Helpers are cached per `(storage_id, force_proxy)` key; the recorded
//! access mode per storage short-circuits every later lookup. An
//! undetermined storage is probed exactly once at a time: probe jobs go
//! through a single-consumer queue so setup work is serialized.

use crate::comm::Communicator;
use crate::storage::{ProxyHelper, StorageHelper, build_direct_helper};
use remora_proto::{ClientBody, ServerBody, StorageTestFileWire};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Direct,
    Proxy,
}

struct ProbeJob {
    storage_id: String,
    reply: oneshot::Sender<AccessMode>,
}

#[derive(Debug, thiserror::Error)]
pub enum HelpersCacheError {
    #[error("helpers cache shut down")]
    Closed,
}

pub struct HelpersCache {
    communicator: Arc<Communicator>,
    helpers: Mutex<HashMap<(String, bool), Arc<dyn StorageHelper>>>,
    access: Mutex<HashMap<String, AccessMode>>,
    probe_tx: mpsc::UnboundedSender<ProbeJob>,
}

impl HelpersCache {
    pub fn new(communicator: Arc<Communicator>) -> Arc<Self> {
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        let cache = Arc::new(HelpersCache {
            communicator,
            helpers: Mutex::new(HashMap::new()),
            access: Mutex::new(HashMap::new()),
            probe_tx,
        });
        tokio::spawn(probe_worker(Arc::downgrade(&cache), probe_rx));
        cache
    }

    /// Helper instance for a file on the given storage.
    ///
    /// `force_proxy` always yields a proxy helper and leaves the recorded
    /// access mode untouched. Otherwise the recorded mode decides; an
    /// unrecorded storage is probed first.
    pub async fn get(
        &self,
        file_uuid: &str,
        storage_id: &str,
        force_proxy: bool,
    ) -> Result<Arc<dyn StorageHelper>, HelpersCacheError> {
        if force_proxy {
            return Ok(self.proxy_helper(storage_id, true));
        }

        let recorded = self.access.lock().unwrap().get(storage_id).copied();
        let mode = match recorded {
            Some(mode) => mode,
            None => {
                debug!(file_uuid, storage_id, "probing storage access");
                let (tx, rx) = oneshot::channel();
                self.probe_tx
                    .send(ProbeJob {
                        storage_id: storage_id.to_owned(),
                        reply: tx,
                    })
                    .map_err(|_| HelpersCacheError::Closed)?;
                rx.await.map_err(|_| HelpersCacheError::Closed)?
            }
        };

        match mode {
            AccessMode::Direct => {
                // Inserted by the probe alongside the recorded mode.
                self.helpers
                    .lock()
                    .unwrap()
                    .get(&(storage_id.to_owned(), false))
                    .cloned()
                    .ok_or(HelpersCacheError::Closed)
            }
            AccessMode::Proxy => Ok(self.proxy_helper(storage_id, false)),
        }
    }

    /// Recorded access mode for a storage, if any.
    pub fn access_mode(&self, storage_id: &str) -> Option<AccessMode> {
        self.access.lock().unwrap().get(storage_id).copied()
    }

    fn proxy_helper(&self, storage_id: &str, force_proxy: bool) -> Arc<dyn StorageHelper> {
        let key = (storage_id.to_owned(), force_proxy);
        let mut helpers = self.helpers.lock().unwrap();
        Arc::clone(helpers.entry(key).or_insert_with(|| {
            Arc::new(ProxyHelper::new(
                storage_id,
                Arc::clone(&self.communicator),
            ))
        }))
    }

    /// Run the storage access probe for one storage.
    async fn probe(&self, storage_id: &str) -> AccessMode {
        let reply = self
            .communicator
            .communicate(ClientBody::GetStorageTestFile {
                storage_id: storage_id.to_owned(),
            })
            .await;
        let wire = match reply {
            Ok(msg) => match msg.body {
                ServerBody::StorageTestFile(wire) => wire,
                other => {
                    warn!(storage_id, ?other, "unexpected reply to storage test file request");
                    return AccessMode::Proxy;
                }
            },
            Err(e) => {
                warn!(storage_id, error = %e, "storage test file request failed");
                return AccessMode::Proxy;
            }
        };

        if self.verify_direct(storage_id, wire).await {
            AccessMode::Direct
        } else {
            AccessMode::Proxy
        }
    }

    /// Build a direct helper from the supplied parameters and check that it
    /// reads the expected test file content. On success the helper is
    /// cached for later `get` calls.
    async fn verify_direct(&self, storage_id: &str, wire: StorageTestFileWire) -> bool {
        let helper = match build_direct_helper(&wire.helper_name, &wire.helper_args) {
            Ok(helper) => helper,
            Err(e) => {
                debug!(storage_id, error = %e, "cannot construct direct helper");
                return false;
            }
        };

        let expected = wire.expected_content;
        let file_id = wire.file_id;
        let probe_helper = Arc::clone(&helper);
        let matches = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; expected.len() + 1];
            match probe_helper.read(&file_id, &mut buf, 0) {
                Ok(n) => n == expected.len() && buf[..n] == *expected.as_bytes(),
                Err(_) => false,
            }
        })
        .await
        .unwrap_or(false);

        if matches {
            self.helpers
                .lock()
                .unwrap()
                .insert((storage_id.to_owned(), false), helper);
        }
        matches
    }
}

/// Single consumer of probe jobs; one probe runs at a time.
async fn probe_worker(cache: Weak<HelpersCache>, mut rx: mpsc::UnboundedReceiver<ProbeJob>) {
    while let Some(job) = rx.recv().await {
        let Some(cache) = cache.upgrade() else {
            return;
        };
        // A queued duplicate may find the mode already recorded.
        let recorded = cache.access.lock().unwrap().get(&job.storage_id).copied();
        let mode = match recorded {
            Some(mode) => mode,
            None => {
                let mode = cache.probe(&job.storage_id).await;
                cache
                    .access
                    .lock()
                    .unwrap()
                    .insert(job.storage_id.clone(), mode);
                info!(storage_id = %job.storage_id, ?mode, "storage access mode recorded");
                cache.communicator.send(ClientBody::StorageTestFileVerification {
                    storage_id: job.storage_id.clone(),
                    ok: mode == AccessMode::Direct,
                });
                mode
            }
        };
        let _ = job.reply.send(mode);
    }
}
