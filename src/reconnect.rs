use crate::send_queue::SendParameters;
use std::collections::VecDeque;
use tracing::trace;

/// Bounded most-recent-first history of the chunks handed to a recipient's socket -
///  *dequeued for sending*, not necessarily delivered. Heartbeats are excluded.
///
/// On reconnect the client reports the last chunk it received, and everything more
///  recent than that is replayed. The buffer survives the connection; it is discarded
///  only when a disconnected client's removal deadline elapses.
pub struct ReconnectBuffer {
    entries: VecDeque<SendParameters>,
    capacity: usize,
}

impl ReconnectBuffer {
    pub fn new(capacity: usize) -> ReconnectBuffer {
        ReconnectBuffer {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a chunk that was just dequeued for sending, evicting the oldest entry once
    ///  capacity is exceeded. Heartbeats are not worth replaying and are skipped.
    pub fn record(&mut self, params: SendParameters) {
        if params.is_heartbeat {
            return;
        }
        self.entries.push_front(params);
        if self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    /// The chunks to replay after a reconnect, oldest first, ready to be fed to
    ///  `ClientQueue::requeue` in iteration order.
    ///
    /// Scans most-recent-first for the entry matching the resumption point the client
    ///  reported; everything scanned before the match (i.e. sent after it) is replayed.
    ///  No match means the client saw none of this - the whole buffer is replayed.
    pub fn recover(&self, last_message_seq: u64, last_chunk_index: u32) -> Vec<SendParameters> {
        let mut newer = Vec::new();
        for entry in &self.entries {
            if entry.chunk.header.message_seq == last_message_seq
                && entry.chunk.header.chunk_index == last_chunk_index
            {
                newer.reverse();
                trace!(
                    "resumption point ({}, {}) found - replaying {} chunks",
                    last_message_seq,
                    last_chunk_index,
                    newer.len()
                );
                return newer;
            }
            newer.push(entry.clone());
        }

        trace!(
            "resumption point ({}, {}) not in the buffer - replaying all {} chunks",
            last_message_seq,
            last_chunk_index,
            newer.len()
        );
        newer.reverse();
        newer
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
