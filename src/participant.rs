use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identity of a participant, exchanged in the handshake.
///
/// Identity deliberately outlives any single TCP connection: send queues and reconnect
///  buffers are keyed by it, so a client that drops and re-handshakes is rebound to its
///  existing backlog instead of starting over.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    pub fn new_unique() -> ParticipantId {
        ParticipantId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> ParticipantId {
        ParticipantId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The capability of a recipient, used only for send prioritisation: what a public display
///  shows is visible to the whole room, so its global / current-slide traffic outranks
///  everything else and may even bypass the one-send-in-flight rule.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ParticipantRole {
    Student,
    PublicDisplay,
}

/// The recipient set an outbound message targets.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Group {
    All,
    PublicDisplays,
    Single(ParticipantId),
}

impl Group {
    pub fn contains(&self, id: ParticipantId, role: ParticipantRole) -> bool {
        match self {
            Group::All => true,
            Group::PublicDisplays => role == ParticipantRole::PublicDisplay,
            Group::Single(target) => *target == id,
        }
    }
}
