//! File attribute cache.
//!
//! Entries carry a per-entry deadline drawn uniformly from
//! `[T/2, 3T/2]` around the configured expiry T, so a burst of lookups does
//! not expire in lockstep. The deadline is authoritative: `get` never
//! returns an entry past it, even before the scheduled deletion fires.

use crate::scheduler::Scheduler;
use rand::Rng;
use remora_proto::FileAttrWire;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// File attribute record held by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub file_uuid: String,
    pub mode: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl From<FileAttrWire> for FileAttr {
    fn from(wire: FileAttrWire) -> Self {
        FileAttr {
            file_uuid: wire.file_uuid,
            mode: wire.mode,
            size: wire.size,
            atime: wire.atime,
            mtime: wire.mtime,
            ctime: wire.ctime,
        }
    }
}

struct AttrEntry {
    attr: FileAttr,
    deadline: Instant,
}

pub struct AttrCache {
    weak: Weak<AttrCache>,
    scheduler: Scheduler,
    expiry: Duration,
    entries: RwLock<HashMap<String, AttrEntry>>,
}

impl AttrCache {
    pub fn new(scheduler: Scheduler, expiry: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| AttrCache {
            weak: weak.clone(),
            scheduler,
            expiry,
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Cache attributes for a path. The first put for a path schedules the
    /// deletion task; refreshed entries just move the deadline and the task
    /// re-arms itself when it fires early.
    pub fn put(&self, path: &str, attr: FileAttr) {
        let deadline = Instant::now() + self.jittered_expiry();
        let was_present = {
            let mut entries = self.entries.write().unwrap();
            entries
                .insert(path.to_owned(), AttrEntry { attr, deadline })
                .is_some()
        };
        if !was_present {
            self.schedule_cleanup(path.to_owned(), deadline);
        }
    }

    pub fn get(&self, path: &str) -> Option<FileAttr> {
        let entries = self.entries.read().unwrap();
        entries
            .get(path)
            .filter(|entry| Instant::now() < entry.deadline)
            .map(|entry| entry.attr.clone())
    }

    pub fn invalidate(&self, path: &str) {
        self.entries.write().unwrap().remove(path);
    }

    pub fn invalidate_all(&self) {
        self.entries.write().unwrap().clear();
    }

    /// Drop whatever entry describes the given file.
    pub fn invalidate_uuid(&self, file_uuid: &str) {
        self.entries
            .write()
            .unwrap()
            .retain(|_, entry| entry.attr.file_uuid != file_uuid);
    }

    /// Update timestamps in place. Returns false when the path is not
    /// cached.
    pub fn update_times(
        &self,
        path: &str,
        atime: Option<i64>,
        mtime: Option<i64>,
        ctime: Option<i64>,
    ) -> bool {
        let mut entries = self.entries.write().unwrap();
        let Some(entry) = entries.get_mut(path) else {
            return false;
        };
        if let Some(atime) = atime {
            entry.attr.atime = atime;
        }
        if let Some(mtime) = mtime {
            entry.attr.mtime = mtime;
        }
        if let Some(ctime) = ctime {
            entry.attr.ctime = ctime;
        }
        true
    }

    /// Update the cached size. Returns false when the path is not cached.
    pub fn update_size(&self, path: &str, size: u64) -> bool {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(path) {
            Some(entry) => {
                entry.attr.size = size;
                true
            }
            None => false,
        }
    }

    /// Apply a server-pushed attribute change to whichever entry describes
    /// the file.
    pub fn update_from_server(&self, wire: FileAttrWire) {
        let mut entries = self.entries.write().unwrap();
        for entry in entries.values_mut() {
            if entry.attr.file_uuid == wire.file_uuid {
                entry.attr = FileAttr::from(wire);
                return;
            }
        }
    }

    fn jittered_expiry(&self) -> Duration {
        let base = self.expiry.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(base / 2..=base.saturating_mul(3) / 2);
        Duration::from_millis(jittered.max(1))
    }

    fn schedule_cleanup(&self, path: String, deadline: Instant) {
        let weak = self.weak.clone();
        let delay = deadline.saturating_duration_since(Instant::now());
        self.scheduler.schedule(delay, move || {
            if let Some(cache) = weak.upgrade() {
                cache.cleanup(&path);
            }
        });
    }

    /// Deletion task: removes the entry once past its deadline, re-arms
    /// when a refresh pushed the deadline out.
    fn cleanup(&self, path: &str) {
        let rearm_at = {
            let mut entries = self.entries.write().unwrap();
            let deadline = entries.get(path).map(|entry| entry.deadline);
            match deadline {
                Some(deadline) if deadline <= Instant::now() => {
                    entries.remove(path);
                    debug!(path, "attribute entry expired");
                    None
                }
                other => other,
            }
        };
        if let Some(deadline) = rearm_at {
            self.schedule_cleanup(path.to_owned(), deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(uuid: &str, size: u64) -> FileAttr {
        FileAttr {
            file_uuid: uuid.to_owned(),
            mode: 0o644,
            size,
            atime: 1,
            mtime: 2,
            ctime: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_gone_after_expiry() {
        let cache = AttrCache::new(Scheduler::new(), Duration::from_secs(10));
        cache.put("/a", attr("u1", 100));
        assert!(cache.get("/a").is_some());

        // Past the maximum jittered deadline (3T/2).
        tokio::time::advance(Duration::from_secs(16)).await;
        tokio::task::yield_now().await;
        assert!(cache.get("/a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_survives_below_minimum_deadline() {
        let cache = AttrCache::new(Scheduler::new(), Duration::from_secs(10));
        cache.put("/a", attr("u1", 100));
        // Below T/2, no jitter outcome can have expired the entry.
        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(cache.get("/a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn update_size_and_times_mutate_cached_entry() {
        let cache = AttrCache::new(Scheduler::new(), Duration::from_secs(10));
        cache.put("/a", attr("u1", 100));

        assert!(cache.update_size("/a", 250));
        assert!(cache.update_times("/a", Some(10), None, Some(30)));
        let got = cache.get("/a").unwrap();
        assert_eq!(got.size, 250);
        assert_eq!(got.atime, 10);
        assert_eq!(got.mtime, 2);
        assert_eq!(got.ctime, 30);

        assert!(!cache.update_size("/missing", 1));
        assert!(!cache.update_times("/missing", None, None, None));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_by_path_and_uuid() {
        let cache = AttrCache::new(Scheduler::new(), Duration::from_secs(10));
        cache.put("/a", attr("u1", 1));
        cache.put("/b", attr("u2", 2));

        cache.invalidate("/a");
        assert!(cache.get("/a").is_none());

        cache.invalidate_uuid("u2");
        assert!(cache.get("/b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn server_push_replaces_matching_entry() {
        let cache = AttrCache::new(Scheduler::new(), Duration::from_secs(10));
        cache.put("/a", attr("u1", 1));
        cache.update_from_server(FileAttrWire {
            file_uuid: "u1".to_owned(),
            mode: 0o600,
            size: 999,
            atime: 7,
            mtime: 8,
            ctime: 9,
        });
        let got = cache.get("/a").unwrap();
        assert_eq!(got.size, 999);
        assert_eq!(got.mode, 0o600);
    }
}
