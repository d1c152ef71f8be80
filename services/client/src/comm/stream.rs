//! Ordered, acknowledged, replayable outbound message streams.
//!
//! A stream stamps each message with `(stream_id, sequence_number)` and
//! retains a copy until the provider acknowledges it. The physical send is
//! fire-and-forget; reliability comes from replaying buffered messages when
//! the provider requests a range, not from the socket. The provider
//! reconstructs the original order by sequence even when physical arrival
//! is reordered across the connection pool.

use remora_proto::{ClientBody, ClientMessage, StreamHeader};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Destination for stamped stream messages; implemented by the
/// communicator and by test capture sinks.
pub trait RawSink: Send + Sync {
    /// Hand a message to the connection pool. Must not block and must not
    /// fail loudly — a dropped frame is recovered by replay.
    fn dispatch(&self, msg: &ClientMessage);
}

struct StreamState {
    next_seq: u64,
    /// Sent but not yet acknowledged, keyed by sequence.
    buffer: BTreeMap<u64, ClientMessage>,
}

/// One outbound logical stream.
pub struct OutboundStream {
    stream_id: u64,
    sink: Arc<dyn RawSink>,
    state: Mutex<StreamState>,
}

impl OutboundStream {
    fn new(stream_id: u64, sink: Arc<dyn RawSink>) -> Self {
        OutboundStream {
            stream_id,
            sink,
            state: Mutex::new(StreamState {
                next_seq: 0,
                buffer: BTreeMap::new(),
            }),
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Send the next message in the stream.
    ///
    /// Assigns the next sequence, retains a copy for replay, dispatches to
    /// the pool. Never fails: a send error at the pool level leaves the
    /// retained copy in place and the provider re-requests it.
    pub fn send(&self, body: ClientBody) {
        let msg = {
            let mut state = self.state.lock().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;
            let msg = ClientMessage {
                message_id: None,
                message_stream: Some(StreamHeader {
                    stream_id: self.stream_id,
                    sequence_number: seq,
                }),
                body,
            };
            state.buffer.insert(seq, msg.clone());
            msg
        };
        self.sink.dispatch(&msg);
    }

    /// Resend the buffered messages the provider asked for.
    ///
    /// Messages below `lo` are implicitly acknowledged and dropped;
    /// messages in `[lo, hi]` are re-dispatched in sequence order.
    pub fn handle_request(&self, lo: u64, hi: u64) {
        let to_resend: Vec<ClientMessage> = {
            let mut state = self.state.lock().unwrap();
            state.buffer.retain(|&seq, _| seq >= lo);
            state
                .buffer
                .range(lo..=hi)
                .map(|(_, msg)| msg.clone())
                .collect()
        };
        debug!(
            stream_id = self.stream_id,
            lo,
            hi,
            resent = to_resend.len(),
            "replaying stream range"
        );
        for msg in &to_resend {
            self.sink.dispatch(msg);
        }
    }

    /// Drop every buffered message with sequence `<= seq`.
    pub fn handle_ack(&self, seq: u64) {
        let mut state = self.state.lock().unwrap();
        state.buffer.retain(|&s, _| s > seq);
    }

    /// Emit an end-of-stream marker, consuming the next sequence.
    pub fn close(&self) {
        self.send(ClientBody::EndOfStream {});
    }

    /// Empty the buffer and zero the sequence counter; used after
    /// reconnect or session reestablishment.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.buffer.clear();
        state.next_seq = 0;
    }

    #[cfg(test)]
    fn buffered_seqs(&self) -> Vec<u64> {
        self.state.lock().unwrap().buffer.keys().copied().collect()
    }
}

/// Allocates stream ids and routes inbound stream control messages.
pub struct StreamManager {
    sink: Arc<dyn RawSink>,
    next_id: AtomicU64,
    streams: Mutex<HashMap<u64, Arc<OutboundStream>>>,
}

impl StreamManager {
    pub fn new(sink: Arc<dyn RawSink>) -> Self {
        StreamManager {
            sink,
            next_id: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a new outbound stream.
    pub fn create(&self) -> Arc<OutboundStream> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(OutboundStream::new(id, Arc::clone(&self.sink)));
        self.streams
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&stream));
        stream
    }

    /// Provider asked for a retransmit of one of our streams.
    pub fn handle_request(&self, stream_id: u64, lo: u64, hi: u64) {
        match self.lookup(stream_id) {
            Some(stream) => stream.handle_request(lo, hi),
            None => warn!(stream_id, "message request for unknown stream"),
        }
    }

    /// Provider acknowledged a prefix of one of our streams.
    pub fn handle_ack(&self, stream_id: u64, seq: u64) {
        match self.lookup(stream_id) {
            Some(stream) => stream.handle_ack(seq),
            None => warn!(stream_id, "acknowledgement for unknown stream"),
        }
    }

    /// Close a stream and drop its registration.
    pub fn close(&self, stream_id: u64) {
        let stream = self.streams.lock().unwrap().remove(&stream_id);
        if let Some(stream) = stream {
            stream.close();
        }
    }

    /// Reset every stream after session reestablishment.
    pub fn reset_all(&self) {
        let streams: Vec<Arc<OutboundStream>> =
            self.streams.lock().unwrap().values().cloned().collect();
        for stream in streams {
            stream.reset();
        }
    }

    fn lookup(&self, stream_id: u64) -> Option<Arc<OutboundStream>> {
        self.streams.lock().unwrap().get(&stream_id).cloned()
    }
}
