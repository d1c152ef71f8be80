//! Event types pushed by the filesystem adapter and folded by aggregators.
//!
//! Both event kinds form a monoid under [`StreamEvent::merge`], with the
//! default value as identity. Merge is commutative except for the write
//! event's `file_size`, which takes the value of the most recently merged
//! event — callers submit events in real-time order per file, which the
//! filesystem adapter naturally provides.

use super::blocks::BlockSet;
use remora_proto::{ClientBody, ReadEventWire, WriteEventWire};

/// Behavior shared by aggregatable event types.
pub trait StreamEvent: Clone + Send + 'static {
    fn file_uuid(&self) -> &str;
    /// Number of filesystem operations folded in. 0 only for the identity.
    fn counter(&self) -> u64;
    /// Total bytes touched.
    fn size(&self) -> u64;
    /// Fold `other` into `self` under the event's merge law.
    fn merge(&mut self, other: &Self);
    /// Serialize for emission.
    fn into_wire(self) -> ClientBody;
}

/// Aggregated read activity on one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadEvent {
    pub file_uuid: String,
    pub counter: u64,
    pub size: u64,
    pub blocks: BlockSet,
}

impl ReadEvent {
    pub fn new(file_uuid: impl Into<String>, offset: u64, size: u64) -> Self {
        ReadEvent {
            file_uuid: file_uuid.into(),
            counter: 1,
            size,
            blocks: BlockSet::single(offset, offset + size),
        }
    }
}

impl StreamEvent for ReadEvent {
    fn file_uuid(&self) -> &str {
        &self.file_uuid
    }

    fn counter(&self) -> u64 {
        self.counter
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn merge(&mut self, other: &Self) {
        self.counter += other.counter;
        self.size += other.size;
        self.blocks.union(&other.blocks);
    }

    fn into_wire(self) -> ClientBody {
        ClientBody::ReadEvent(ReadEventWire {
            file_uuid: self.file_uuid,
            counter: self.counter,
            size: self.size,
            blocks: self.blocks.to_wire(),
        })
    }
}

/// Aggregated write activity on one file.
///
/// Truncates are writes with `(offset = 0, size = 0, file_size = new_size)`;
/// merging clips accumulated blocks to `[0, file_size)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteEvent {
    pub file_uuid: String,
    pub counter: u64,
    pub size: u64,
    pub file_size: u64,
    pub blocks: BlockSet,
}

impl WriteEvent {
    pub fn new(file_uuid: impl Into<String>, offset: u64, size: u64, file_size: u64) -> Self {
        WriteEvent {
            file_uuid: file_uuid.into(),
            counter: 1,
            size,
            file_size,
            blocks: BlockSet::single(offset, offset + size),
        }
    }

    pub fn truncate(file_uuid: impl Into<String>, file_size: u64) -> Self {
        WriteEvent {
            file_uuid: file_uuid.into(),
            counter: 1,
            size: 0,
            file_size,
            blocks: BlockSet::new(),
        }
    }
}

impl StreamEvent for WriteEvent {
    fn file_uuid(&self) -> &str {
        &self.file_uuid
    }

    fn counter(&self) -> u64 {
        self.counter
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn merge(&mut self, other: &Self) {
        self.counter += other.counter;
        self.size += other.size;
        self.file_size = other.file_size;
        self.blocks.union(&other.blocks);
        self.blocks.truncate_at(self.file_size);
    }

    fn into_wire(self) -> ClientBody {
        ClientBody::WriteEvent(WriteEventWire {
            file_uuid: self.file_uuid,
            counter: self.counter,
            size: self.size,
            file_size: self.file_size,
            blocks: self.blocks.to_wire(),
        })
    }
}
