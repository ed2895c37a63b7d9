use crate::participant::Group;
use bytes::Bytes;
use std::fmt::{Display, Formatter};

/// Identifies the slide a message belongs to, for scheduling purposes only - the transport
///  never looks inside a payload.
///
/// `SlideId::GLOBAL` is the sentinel for messages that are independent of any slide
///  (deck structure, navigation, polls opening and closing). Those are never shed and
///  always go out first.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SlideId(u64);

impl SlideId {
    pub const GLOBAL: SlideId = SlideId(0);

    pub fn from_raw(value: u64) -> SlideId {
        SlideId(value)
    }

    pub fn is_global(&self) -> bool {
        *self == SlideId::GLOBAL
    }
}

impl Display for SlideId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_global() {
            write!(f, "global")
        } else {
            write!(f, "slide-{}", self.0)
        }
    }
}

/// Scheduling priority of a message.
///
/// `RealTime` marks traffic that tolerates loss but not staleness (live ink strokes): the
///  queues drop it under backlog pressure instead of delivering it late.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MessagePriority {
    Normal,
    RealTime,
}

impl MessagePriority {
    pub fn is_real_time(&self) -> bool {
        *self == MessagePriority::RealTime
    }
}

/// The scheduling metadata a message carries into the transport. The transport inspects
///  nothing else about a message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DeliveryTags {
    pub priority: MessagePriority,
    pub target_slide: SlideId,
}

impl DeliveryTags {
    pub fn global() -> DeliveryTags {
        DeliveryTags {
            priority: MessagePriority::Normal,
            target_slide: SlideId::GLOBAL,
        }
    }

    pub fn for_slide(slide: SlideId) -> DeliveryTags {
        DeliveryTags {
            priority: MessagePriority::Normal,
            target_slide: slide,
        }
    }

    pub fn real_time(slide: SlideId) -> DeliveryTags {
        DeliveryTags {
            priority: MessagePriority::RealTime,
            target_slide: slide,
        }
    }
}

/// An outbound message as handed over by the domain layer: an opaque serialized payload
///  plus its recipient group and scheduling tags. Immutable once chunked.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub group: Group,
    pub tags: DeliveryTags,
}
