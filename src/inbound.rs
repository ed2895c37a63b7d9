use crate::chunk::ChunkAssembler;
use crate::participant::{ParticipantId, ParticipantRole};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;

/// The application-facing callbacks of an endpoint. All invocations for a given sender
///  happen sequentially, in the order the messages were completed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// a fully reassembled message arrived
    async fn on_message(&self, from: ParticipantId, payload: Bytes);

    /// a participant completed its *first* handshake. Not called on reconnects.
    async fn on_participant_joined(&self, id: ParticipantId, name: &str);

    /// the role of a (new) participant, consulted once on join to decide its
    ///  scheduling treatment
    fn role_of(&self, id: ParticipantId) -> ParticipantRole;
}

/// Per-peer receive bookkeeping: reassembly state plus the resumption point reported in
///  the next handshake. Survives reconnects, so a partially received message can complete
///  across a connection change.
pub struct ReceiveState {
    pub assembler: ChunkAssembler,
    /// message sequence of the last fully received chunk, 0 before the first one
    pub last_message_seq: u64,
    pub last_chunk_index: u32,
    /// refreshed by every arriving frame, heartbeats included
    pub last_received_at: Instant,
}

impl ReceiveState {
    pub fn new() -> ReceiveState {
        ReceiveState {
            assembler: ChunkAssembler::default(),
            last_message_seq: 0,
            last_chunk_index: 0,
            last_received_at: Instant::now(),
        }
    }
}
