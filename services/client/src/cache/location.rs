//! File location cache.
//!
//! Maps a logical path to the storage holding the file's bytes plus the
//! helper description needed to reach that storage. Mappings are leases: a
//! maintenance task renews any mapping still open at `valid_to −
//! RENEW_WINDOW` and evicts closed mappings once the lease passes.

use crate::comm::Communicator;
use crate::error::ClientError;
use crate::scheduler::{CancelHandle, Scheduler};
use remora_proto::{ClientBody, FileLocationWire, ServerBody};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Renew open mappings this long before their lease expires.
pub const RENEW_WINDOW: Duration = Duration::from_secs(30);

/// Backoff before retrying a failed renewal.
const RENEW_RETRY: Duration = Duration::from_secs(5);

/// Where a file's bytes live, and for how long the mapping may be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    pub storage_id: String,
    /// Storage-relative file id.
    pub file_id: String,
    pub valid_to: Instant,
    pub open_count: u32,
}

/// Helper description for a storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub helper_name: String,
    pub helper_args: BTreeMap<String, String>,
}

struct LocationEntry {
    file_uuid: String,
    location: LocationInfo,
    storage: StorageInfo,
    maintenance: CancelHandle,
}

pub struct LocationCache {
    weak: Weak<LocationCache>,
    communicator: Arc<Communicator>,
    scheduler: Scheduler,
    runtime: tokio::runtime::Handle,
    renew_window: Duration,
    entries: tokio::sync::Mutex<HashMap<String, LocationEntry>>,
    overrides: RwLock<HashMap<String, StorageInfo>>,
}

impl LocationCache {
    pub fn new(
        communicator: Arc<Communicator>,
        scheduler: Scheduler,
        renew_window: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| LocationCache {
            weak: weak.clone(),
            communicator,
            scheduler,
            runtime: tokio::runtime::Handle::current(),
            renew_window,
            entries: tokio::sync::Mutex::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
        })
    }

    /// Location and storage info for a path, querying the provider on miss
    /// or expired lease.
    pub async fn get_location(
        &self,
        path: &str,
    ) -> Result<(LocationInfo, StorageInfo), ClientError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(path) {
            if Instant::now() < entry.location.valid_to {
                return Ok(self.assemble(path, entry));
            }
        }
        let wire = self.query(path).await?;
        let open_count = entries
            .get(path)
            .map_or(0, |entry| entry.location.open_count);
        self.install(&mut entries, path, wire, open_count);
        let entry = entries.get(path).expect("just installed");
        Ok(self.assemble(path, entry))
    }

    /// Bump the open count; open mappings are renewed instead of evicted.
    pub async fn open(&self, path: &str) {
        if let Some(entry) = self.entries.lock().await.get_mut(path) {
            entry.location.open_count += 1;
        }
    }

    /// Drop one open reference.
    pub async fn release(&self, path: &str) {
        if let Some(entry) = self.entries.lock().await.get_mut(path) {
            entry.location.open_count = entry.location.open_count.saturating_sub(1);
        }
    }

    pub async fn invalidate(&self, path: &str) {
        if let Some(entry) = self.entries.lock().await.remove(path) {
            entry.maintenance.cancel();
        }
    }

    /// Apply a server-pushed location grant to whichever path maps the
    /// file; unknown files are ignored.
    pub async fn update_from_server(&self, wire: FileLocationWire) {
        let mut entries = self.entries.lock().await;
        let path = entries
            .iter()
            .find(|(_, entry)| entry.file_uuid == wire.file_uuid)
            .map(|(path, _)| path.clone());
        match path {
            Some(path) => {
                let open_count = entries[&path].location.open_count;
                self.install(&mut entries, &path, wire, open_count);
            }
            None => debug!(file_uuid = %wire.file_uuid, "location push for unmapped file"),
        }
    }

    /// Pin a storage description for a path, overriding the mapped one.
    pub fn helper_override(&self, path: &str, storage: StorageInfo) {
        self.overrides
            .write()
            .unwrap()
            .insert(path.to_owned(), storage);
    }

    pub fn reset_helper_override(&self, path: &str) {
        self.overrides.write().unwrap().remove(path);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn assemble(&self, path: &str, entry: &LocationEntry) -> (LocationInfo, StorageInfo) {
        let storage = self
            .overrides
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_else(|| entry.storage.clone());
        (entry.location.clone(), storage)
    }

    async fn query(&self, path: &str) -> Result<FileLocationWire, ClientError> {
        let reply = self
            .communicator
            .communicate(ClientBody::GetFileLocation {
                path: path.to_owned(),
            })
            .await?;
        match reply.body {
            ServerBody::FileLocation(wire) => Ok(wire),
            ServerBody::Status { code } => Err(ClientError::Remote(code)),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    fn install(
        &self,
        entries: &mut HashMap<String, LocationEntry>,
        path: &str,
        wire: FileLocationWire,
        open_count: u32,
    ) {
        if let Some(old) = entries.remove(path) {
            old.maintenance.cancel();
        }
        let valid_to = Instant::now() + Duration::from_millis(wire.valid_for_ms);
        let renew_at = valid_to
            .saturating_duration_since(Instant::now())
            .saturating_sub(self.renew_window);
        let maintenance = self.schedule_maintenance(path.to_owned(), renew_at);
        entries.insert(
            path.to_owned(),
            LocationEntry {
                file_uuid: wire.file_uuid,
                location: LocationInfo {
                    storage_id: wire.storage_id,
                    file_id: wire.file_id,
                    valid_to,
                    open_count,
                },
                storage: StorageInfo {
                    helper_name: wire.helper_name,
                    helper_args: wire.helper_args,
                },
                maintenance,
            },
        );
    }

    fn schedule_maintenance(&self, path: String, delay: Duration) -> CancelHandle {
        let weak = self.weak.clone();
        let runtime = self.runtime.clone();
        self.scheduler.schedule(delay, move || {
            let Some(cache) = weak.upgrade() else {
                return;
            };
            runtime.spawn(async move {
                cache.maintain(path).await;
            });
        })
    }

    /// Renew-or-evict pass for one mapping.
    async fn maintain(self: Arc<Self>, path: String) {
        let open_count = {
            let entries = self.entries.lock().await;
            let Some(entry) = entries.get(&path) else {
                return;
            };
            entry.location.open_count
        };

        if open_count > 0 {
            match self.query(&path).await {
                Ok(wire) => {
                    debug!(path = %path, "location mapping renewed");
                    let mut entries = self.entries.lock().await;
                    if entries.contains_key(&path) {
                        self.install(&mut entries, &path, wire, open_count);
                    }
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "location renewal failed, retrying");
                    let mut entries = self.entries.lock().await;
                    if let Some(entry) = entries.get_mut(&path) {
                        entry.maintenance =
                            self.schedule_maintenance(path.clone(), RENEW_RETRY);
                    }
                }
            }
            return;
        }

        let mut entries = self.entries.lock().await;
        let valid_to = match entries.get(&path) {
            Some(entry) => entry.location.valid_to,
            None => return,
        };
        let now = Instant::now();
        if now >= valid_to {
            entries.remove(&path);
            debug!(path = %path, "location mapping evicted");
        } else {
            let handle =
                self.schedule_maintenance(path.clone(), valid_to.saturating_duration_since(now));
            if let Some(entry) = entries.get_mut(&path) {
                entry.maintenance = handle;
            }
        }
    }
}
