//! Event manager: owns the read and write streams, routes pushes from the
//! filesystem adapter and subscription messages from the provider.
//!
//! Truncates are a write variant and fold into the write stream. All
//! emissions leave through a single transport stream, so the provider sees
//! them in a replayable sequence.

use super::stream::{EventStream, EventSubscription};
use super::types::{ReadEvent, WriteEvent};
use crate::comm::{OutboundStream, StreamManager};
use crate::scheduler::Scheduler;
use remora_proto::{ConfiguredSubscription, ServerBody};
use std::sync::Arc;
use tracing::debug;

pub struct EventManager {
    transport: Arc<OutboundStream>,
    read_stream: Arc<EventStream<ReadEvent>>,
    write_stream: Arc<EventStream<WriteEvent>>,
}

impl EventManager {
    pub fn new(scheduler: &Scheduler, streams: &StreamManager) -> Self {
        let transport = streams.create();
        EventManager {
            read_stream: EventStream::new("read", scheduler.clone(), Arc::clone(&transport)),
            write_stream: EventStream::new("write", scheduler.clone(), Arc::clone(&transport)),
            transport,
        }
    }

    pub fn emit_read(&self, file_uuid: &str, offset: u64, size: u64) {
        self.read_stream.push(ReadEvent::new(file_uuid, offset, size));
    }

    pub fn emit_write(&self, file_uuid: &str, offset: u64, size: u64, file_size: u64) {
        self.write_stream
            .push(WriteEvent::new(file_uuid, offset, size, file_size));
    }

    pub fn emit_truncate(&self, file_uuid: &str, file_size: u64) {
        self.write_stream.push(WriteEvent::truncate(file_uuid, file_size));
    }

    /// Dispatch a server message to the matching stream. Returns false for
    /// messages this manager does not handle.
    pub fn on_server_message(&self, body: &ServerBody) -> bool {
        match body {
            ServerBody::ReadEventSubscription(wire) => {
                self.read_stream.add_subscription(EventSubscription::from(wire));
                true
            }
            ServerBody::WriteEventSubscription(wire) => {
                self.write_stream.add_subscription(EventSubscription::from(wire));
                true
            }
            ServerBody::EventSubscriptionCancellation { id } => {
                if !self.read_stream.remove_subscription(*id)
                    && !self.write_stream.remove_subscription(*id)
                {
                    debug!(id, "cancellation for unknown event subscription");
                }
                true
            }
            ServerBody::Configuration { subscriptions } => {
                for configured in subscriptions {
                    match configured {
                        ConfiguredSubscription::ReadEventSubscription(wire) => self
                            .read_stream
                            .add_subscription(EventSubscription::from(wire)),
                        ConfiguredSubscription::WriteEventSubscription(wire) => self
                            .write_stream
                            .add_subscription(EventSubscription::from(wire)),
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Force-emit both streams (unmount path).
    pub fn flush(&self) {
        self.read_stream.flush();
        self.write_stream.flush();
    }

    /// Flush and close the transport stream.
    pub fn shutdown(&self, streams: &StreamManager) {
        self.flush();
        streams.close(self.transport.stream_id());
    }
}
