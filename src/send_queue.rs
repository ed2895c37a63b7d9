use crate::chunk::Chunk;
use crate::message::{DeliveryTags, SlideId};
use crate::participant::{ParticipantId, ParticipantRole};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use tracing::debug;

/// One chunk bound for one recipient, with the metadata the scheduler needs.
#[derive(Clone, Debug)]
pub struct SendParameters {
    pub chunk: Chunk,
    pub recipient: ParticipantId,
    pub tags: DeliveryTags,
    /// assigned at enqueue time - the sole fallback tie breaker for ordering
    pub enqueue_seq: u64,
    pub is_heartbeat: bool,
}

impl SendParameters {
    pub fn is_real_time(&self) -> bool {
        self.tags.priority.is_real_time()
    }
}

/// Scheduling rank of a pending chunk for cross-recipient selection; lower sorts first.
///
/// Tiers: 0 = a public display's global or current-slide chunk, 1 = global, 2 = the
///  recipient's current slide, 3 = everything else. Ties within a tier go to the oldest
///  enqueue sequence (FIFO).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct SendRank {
    pub tier: u8,
    pub enqueue_seq: u64,
}

/// Per-recipient backlog, partitioned into one queue per target slide, implementing the
///  priority dequeue policy:
///
/// 1. Global chunks first, oldest first, never shed.
/// 2. Then the recipient's current slide, shedding stale real-time chunks once the
///    backlog crosses a threshold ("sometimes"-drop).
/// 3. Then the globally oldest chunk across all other slides, where real-time chunks
///    that have fallen behind a non-real-time one are unconditionally discarded
///    ("always"-drop) - an ink stroke for a slide nobody is looking at is worthless
///    once newer state for that slide exists.
pub struct ClientQueue {
    slide_queues: FxHashMap<SlideId, VecDeque<SendParameters>>,
    current_slide: SlideId,
    drop_threshold: usize,
}

impl ClientQueue {
    pub fn new(drop_threshold: usize) -> ClientQueue {
        ClientQueue {
            slide_queues: FxHashMap::default(),
            current_slide: SlideId::GLOBAL,
            drop_threshold,
        }
    }

    pub fn set_current_slide(&mut self, slide: SlideId) {
        self.current_slide = slide;
    }

    pub fn current_slide(&self) -> SlideId {
        self.current_slide
    }

    pub fn len(&self) -> usize {
        self.slide_queues.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slide_queues.values().all(|q| q.is_empty())
    }

    pub fn enqueue(&mut self, params: SendParameters) {
        self.slide_queues
            .entry(params.tags.target_slide)
            .or_default()
            .push_back(params);
    }

    /// Reinserts a replayed chunk at the position given by its original enqueue sequence,
    ///  preserving relative send order. Used only during reconnect replay.
    pub fn requeue(&mut self, params: SendParameters) {
        let queue = self.slide_queues.entry(params.tags.target_slide).or_default();
        let pos = queue.partition_point(|p| p.enqueue_seq < params.enqueue_seq);
        queue.insert(pos, params);
    }

    /// The rank of the chunk [`Self::dequeue`] would hand out next, without mutating
    ///  anything. `None` if nothing is pending.
    pub fn peek_rank(&self, role: ParticipantRole) -> Option<SendRank> {
        let latency_tier = |slide_tier: u8| {
            if role == ParticipantRole::PublicDisplay {
                0
            } else {
                slide_tier
            }
        };

        if let Some(front) = self.front_of(SlideId::GLOBAL) {
            return Some(SendRank {
                tier: latency_tier(1),
                enqueue_seq: front.enqueue_seq,
            });
        }
        if !self.current_slide.is_global() {
            if let Some(front) = self.front_of(self.current_slide) {
                return Some(SendRank {
                    tier: latency_tier(2),
                    enqueue_seq: front.enqueue_seq,
                });
            }
        }
        self.oldest_other_slide()
            .and_then(|slide| self.front_of(slide))
            .map(|front| SendRank {
                tier: 3,
                enqueue_seq: front.enqueue_seq,
            })
    }

    /// Takes the next chunk to send, applying the drop policy. May return `None` even for
    ///  a non-empty queue if everything pending was stale real-time traffic (which is
    ///  discarded in the process and not recoverable afterwards).
    pub fn dequeue(&mut self) -> Option<SendParameters> {
        // global chunks go first and are never shed
        if let Some(params) = self.pop_front_of(SlideId::GLOBAL) {
            return Some(params);
        }

        // the recipient's current slide, with "sometimes"-drop under backlog pressure
        if !self.current_slide.is_global() {
            if let Some(params) = self.dequeue_current_slide() {
                return Some(params);
            }
        }

        // remaining slides: oldest first, unconditionally shedding stale real-time chunks
        loop {
            let slide = self.oldest_other_slide()?;
            let params = self.pop_front_of(slide)?;
            if params.is_real_time() {
                debug!(
                    "dropping stale real-time chunk {} for non-visible {}",
                    params.chunk.chunk_seq, slide
                );
                continue;
            }
            return Some(params);
        }
    }

    fn dequeue_current_slide(&mut self) -> Option<SendParameters> {
        let current = self.current_slide;
        let queue = self.slide_queues.get_mut(&current)?;
        if queue.is_empty() {
            return None;
        }

        let sheddable = queue.len() >= self.drop_threshold && queue.iter().any(|p| !p.is_real_time());
        if sheddable {
            while queue.len() > self.drop_threshold
                && queue.front().map(|p| p.is_real_time()).unwrap_or(false)
            {
                if let Some(dropped) = queue.pop_front() {
                    debug!(
                        "dropping stale real-time chunk {} for {} under backlog pressure",
                        dropped.chunk.chunk_seq, current
                    );
                }
            }
            // the surviving non-real-time chunk jumps ahead of leftover strokes so the
            // visible slide's durable state stays latency-bounded
            if let Some(pos) = queue.iter().position(|p| !p.is_real_time()) {
                return queue.remove(pos);
            }
        }
        queue.pop_front()
    }

    /// The non-global, non-current slide whose front chunk is globally oldest.
    fn oldest_other_slide(&self) -> Option<SlideId> {
        let mut best: Option<(SlideId, u64)> = None;
        for (&slide, queue) in &self.slide_queues {
            if slide.is_global() || slide == self.current_slide {
                continue;
            }
            if let Some(front) = queue.front() {
                if best.map(|(_, seq)| front.enqueue_seq < seq).unwrap_or(true) {
                    best = Some((slide, front.enqueue_seq));
                }
            }
        }
        best.map(|(slide, _)| slide)
    }

    fn front_of(&self, slide: SlideId) -> Option<&SendParameters> {
        self.slide_queues.get(&slide).and_then(|q| q.front())
    }

    fn pop_front_of(&mut self, slide: SlideId) -> Option<SendParameters> {
        self.slide_queues.get_mut(&slide).and_then(|q| q.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{make_chunks, SequenceCounter};
    use rstest::rstest;

    fn params(tags: DeliveryTags, enqueue_seq: u64) -> SendParameters {
        let sequences = SequenceCounter::new();
        let chunks = make_chunks(&[enqueue_seq as u8], &sequences, 64);
        SendParameters {
            chunk: chunks.into_iter().next().unwrap(),
            recipient: ParticipantId::new_unique(),
            tags,
            enqueue_seq,
            is_heartbeat: false,
        }
    }

    fn slide(raw: u64) -> SlideId {
        SlideId::from_raw(raw)
    }

    #[rstest]
    #[case::slides_behind(vec![1, 0, 2], 1)]
    #[case::two_globals(vec![1, 0, 0], 2)]
    #[case::only_globals(vec![0, 0], 2)]
    fn test_global_first(#[case] enqueued_slides: Vec<u64>, #[case] num_globals: usize) {
        let mut queue = ClientQueue::new(3);
        queue.set_current_slide(slide(1));

        for (i, &slide_raw) in enqueued_slides.iter().enumerate() {
            queue.enqueue(params(DeliveryTags::for_slide(slide(slide_raw)), i as u64));
        }

        // every pending global chunk is returned before any slide-bound one
        let dequeued = std::iter::from_fn(|| queue.dequeue()).collect::<Vec<_>>();
        assert_eq!(dequeued.len(), enqueued_slides.len());
        for (pos, p) in dequeued.iter().enumerate() {
            assert_eq!(p.tags.target_slide.is_global(), pos < num_globals);
        }
    }

    #[test]
    fn test_global_interleaving_always_wins() {
        let mut queue = ClientQueue::new(3);
        queue.set_current_slide(slide(1));

        queue.enqueue(params(DeliveryTags::for_slide(slide(1)), 0));
        queue.enqueue(params(DeliveryTags::for_slide(slide(2)), 1));
        queue.enqueue(params(DeliveryTags::global(), 2));
        queue.enqueue(params(DeliveryTags::for_slide(slide(1)), 3));
        queue.enqueue(params(DeliveryTags::global(), 4));

        let order = std::iter::from_fn(|| queue.dequeue())
            .map(|p| p.enqueue_seq)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![2, 4, 0, 3, 1]);
    }

    #[test]
    fn test_real_time_shedding_on_current_slide() {
        let mut queue = ClientQueue::new(3);
        queue.set_current_slide(slide(7));

        for i in 0..5 {
            queue.enqueue(params(DeliveryTags::real_time(slide(7)), i));
        }
        queue.enqueue(params(DeliveryTags::for_slide(slide(7)), 5));

        // the three oldest strokes are shed, the durable chunk jumps the two survivors
        let first = queue.dequeue().unwrap();
        assert_eq!(first.enqueue_seq, 5);
        assert!(!first.is_real_time());

        let rest = std::iter::from_fn(|| queue.dequeue())
            .map(|p| p.enqueue_seq)
            .collect::<Vec<_>>();
        assert_eq!(rest, vec![3, 4]);

        // dropped chunks are gone for good
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_no_shedding_below_threshold() {
        let mut queue = ClientQueue::new(3);
        queue.set_current_slide(slide(7));

        queue.enqueue(params(DeliveryTags::real_time(slide(7)), 0));
        queue.enqueue(params(DeliveryTags::for_slide(slide(7)), 1));

        let order = std::iter::from_fn(|| queue.dequeue())
            .map(|p| p.enqueue_seq)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn test_all_real_time_current_slide_is_not_shed() {
        // without a durable chunk behind them, strokes for the visible slide are delivered
        let mut queue = ClientQueue::new(3);
        queue.set_current_slide(slide(7));

        for i in 0..5 {
            queue.enqueue(params(DeliveryTags::real_time(slide(7)), i));
        }
        let order = std::iter::from_fn(|| queue.dequeue())
            .map(|p| p.enqueue_seq)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_always_drop_on_other_slides() {
        let mut queue = ClientQueue::new(3);
        queue.set_current_slide(slide(1));

        queue.enqueue(params(DeliveryTags::real_time(slide(2)), 0));
        queue.enqueue(params(DeliveryTags::real_time(slide(2)), 1));
        queue.enqueue(params(DeliveryTags::for_slide(slide(2)), 2));
        queue.enqueue(params(DeliveryTags::real_time(slide(3)), 3));

        // the two stale strokes ahead of the durable chunk are discarded outright
        assert_eq!(queue.dequeue().unwrap().enqueue_seq, 2);
        // a trailing all-real-time backlog is discarded entirely
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_other_slides_oldest_first() {
        let mut queue = ClientQueue::new(3);
        queue.set_current_slide(slide(1));

        queue.enqueue(params(DeliveryTags::for_slide(slide(3)), 0));
        queue.enqueue(params(DeliveryTags::for_slide(slide(2)), 1));
        queue.enqueue(params(DeliveryTags::for_slide(slide(3)), 2));

        let order = std::iter::from_fn(|| queue.dequeue())
            .map(|p| p.enqueue_seq)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_requeue_preserves_enqueue_order() {
        let mut queue = ClientQueue::new(3);
        queue.set_current_slide(slide(1));

        let a = params(DeliveryTags::for_slide(slide(1)), 10);
        let b = params(DeliveryTags::for_slide(slide(1)), 11);
        let c = params(DeliveryTags::for_slide(slide(1)), 12);

        queue.enqueue(c.clone());
        queue.requeue(b.clone());
        queue.requeue(a.clone());

        let order = std::iter::from_fn(|| queue.dequeue())
            .map(|p| p.enqueue_seq)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![10, 11, 12]);
    }

    #[rstest]
    #[case::student_global(ParticipantRole::Student, 0, 1)]
    #[case::student_current(ParticipantRole::Student, 1, 2)]
    #[case::student_other(ParticipantRole::Student, 2, 3)]
    #[case::display_global(ParticipantRole::PublicDisplay, 0, 0)]
    #[case::display_current(ParticipantRole::PublicDisplay, 1, 0)]
    #[case::display_other(ParticipantRole::PublicDisplay, 2, 3)]
    fn test_peek_rank_tiers(
        #[case] role: ParticipantRole,
        #[case] slide_raw: u64,
        #[case] expected_tier: u8,
    ) {
        let mut queue = ClientQueue::new(3);
        queue.set_current_slide(slide(1));
        queue.enqueue(params(DeliveryTags::for_slide(slide(slide_raw)), 5));

        let rank = queue.peek_rank(role).unwrap();
        assert_eq!(rank.tier, expected_tier);
        assert_eq!(rank.enqueue_seq, 5);
    }

    #[test]
    fn test_peek_rank_empty() {
        let queue = ClientQueue::new(3);
        assert!(queue.peek_rank(ParticipantRole::Student).is_none());
    }
}
