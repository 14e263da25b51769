/// Message framing over a single GATT characteristic
///
/// A logical message travels as an ordered run of chunks, each no larger than
/// the negotiated write size, followed by exactly one chunk whose bytes equal
/// the ASCII sentinel `EOM`. There is no escaping: a payload chunk that happens
/// to equal the sentinel ends the message early on the receiving side.

use tracing::debug;

/// End-of-message sentinel
pub const EOM: &[u8] = b"EOM";

/// Conservative default chunk size, below the minimum negotiated BLE write size
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Chunk size for a peer: the configured cap, lowered to the transport-reported
/// maximum write length when one is known. Never zero.
pub fn chunk_size(cap: usize, reported_max: Option<usize>) -> usize {
    let size = match reported_max {
        Some(max) => cap.min(max),
        None => cap,
    };
    size.max(1)
}

/// Exact-equality sentinel check
pub fn is_sentinel(chunk: &[u8]) -> bool {
    chunk == EOM
}

/// End offset of the chunk starting at `start`: the furthest char boundary
/// within `max` bytes. When the next scalar alone is wider than `max` it is
/// taken whole so the sender always makes progress.
fn chunk_end(text: &str, start: usize, max: usize) -> usize {
    let len = text.len();
    if start >= len {
        return len;
    }

    let mut end = (start + max.max(1)).min(len);
    while end > start && !text.is_char_boundary(end) {
        end -= 1;
    }

    if end == start {
        // Scalar wider than the cap
        end = start + 1;
        while end < len && !text.is_char_boundary(end) {
            end += 1;
        }
    }
    end
}

/// Split a message into chunks of at most `max_chunk_bytes`, never splitting a
/// multi-byte scalar. The sentinel is not included.
pub fn split(message: &str, max_chunk_bytes: usize) -> Vec<&[u8]> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < message.len() {
        let end = chunk_end(message, offset, max_chunk_bytes);
        chunks.push(&message.as_bytes()[offset..end]);
        offset = end;
    }
    chunks
}

/// Per-peer accumulator of chunk bytes since the last sentinel
#[derive(Debug, Default, Clone)]
pub struct Reassembler {
    buffer: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received chunk. Returns the completed message when the chunk is
    /// the sentinel; the buffer is then empty again.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        if is_sentinel(chunk) {
            let message = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            return Some(message);
        }
        self.buffer.extend_from_slice(chunk);
        None
    }

    /// Bytes accumulated for the message in progress
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any partial message, returning how many bytes were discarded
    pub fn clear(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        discarded
    }
}

/// Something that takes one chunk at a time and may refuse it when its
/// outbound buffer is full. A refused chunk was not consumed.
pub trait ChunkSink {
    fn try_send(&mut self, chunk: &[u8]) -> bool;
}

impl<F> ChunkSink for F
where
    F: FnMut(&[u8]) -> bool,
{
    fn try_send(&mut self, chunk: &[u8]) -> bool {
        self(chunk)
    }
}

/// Result of one pass of the send loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every chunk and the sentinel were accepted
    Complete,
    /// The transport refused a write; resume on the next ready signal
    Blocked,
}

/// Outbound state for one message
#[derive(Debug, Clone)]
pub struct SendCursor {
    payload: String,
    offset: usize,
    eom_in_flight: bool,
}

impl SendCursor {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            offset: 0,
            eom_in_flight: false,
        }
    }

    /// Byte offset of the next unsent data
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The sentinel was attempted but not yet accepted
    pub fn eom_in_flight(&self) -> bool {
        self.eom_in_flight
    }

    /// Push as much as the sink accepts.
    ///
    /// With the sentinel in flight only the sentinel is retried. Otherwise
    /// chunks go out until the sink refuses one or the payload is exhausted, at
    /// which point the sentinel is marked in flight and attempted immediately.
    pub fn drain(&mut self, sink: &mut dyn ChunkSink, max_chunk_bytes: usize) -> DrainOutcome {
        if self.eom_in_flight {
            return self.send_eom(sink);
        }

        loop {
            if self.offset >= self.payload.len() {
                self.eom_in_flight = true;
                return self.send_eom(sink);
            }

            let end = chunk_end(&self.payload, self.offset, max_chunk_bytes);
            let chunk = &self.payload.as_bytes()[self.offset..end];
            if !sink.try_send(chunk) {
                debug!(
                    "Write refused at offset {}/{}, waiting for ready signal",
                    self.offset,
                    self.payload.len()
                );
                return DrainOutcome::Blocked;
            }
            debug!("Sent {} bytes ({}/{})", chunk.len(), end, self.payload.len());
            self.offset = end;
        }
    }

    fn send_eom(&mut self, sink: &mut dyn ChunkSink) -> DrainOutcome {
        if sink.try_send(EOM) {
            self.eom_in_flight = false;
            debug!("Sent EOM");
            DrainOutcome::Complete
        } else {
            DrainOutcome::Blocked
        }
    }
}
