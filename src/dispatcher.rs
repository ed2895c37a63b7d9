use crate::chunk::Chunk;
use crate::message::{DeliveryTags, OutboundMessage, SlideId};
use crate::participant::{ParticipantId, ParticipantRole};
use crate::reconnect::ReconnectBuffer;
use crate::send_queue::{ClientQueue, SendParameters, SendRank};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, trace, warn};

/// Abstraction for pushing one framed chunk down a connected socket, introduced to
///  facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChunkSink: Send + Sync + 'static {
    async fn send_chunk(&self, frame: &[u8]) -> std::io::Result<()>;
}

/// The real sink over the write half of a TCP stream. Transient send errors (send buffer
///  full) are retried with a short backoff; everything else bubbles up and disables the
///  recipient's queue.
pub struct TcpChunkSink {
    write_half: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl TcpChunkSink {
    pub fn new(write_half: OwnedWriteHalf) -> TcpChunkSink {
        TcpChunkSink {
            write_half: tokio::sync::Mutex::new(write_half),
        }
    }
}

#[async_trait]
impl ChunkSink for TcpChunkSink {
    async fn send_chunk(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut write_half = self.write_half.lock().await;
        loop {
            match write_half.write_all(frame).await {
                Ok(()) => return write_half.flush().await,
                Err(e) if crate::error::TransportError::is_transient_send_error(&e) => {
                    debug!("send buffer full - backing off and retrying");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct RecipientState {
    role: ParticipantRole,
    queue: ClientQueue,
    reconnect: ReconnectBuffer,
    /// `None` while disconnected - dropping the sink is what eventually closes the socket
    sink: Option<Arc<dyn ChunkSink>>,
    /// dequeuing allowed - cleared on socket loss, restored when a new socket is bound
    enabled: bool,
    in_flight: u32,
    /// a forced close is waiting for in-flight sends on the old socket to finish
    draining: bool,
}

struct QueuesState {
    recipients: FxHashMap<ParticipantId, RecipientState>,
    next_enqueue_seq: u64,
    total_in_flight: usize,
}

/// The shared send-side structure of an endpoint: one prioritized queue plus reconnect
///  buffer per recipient, in-flight accounting, and the wakeup signalling the dispatch
///  loop waits on.
///
/// All mutation happens under one coarse lock; waiters block on a [`Notify`] signalled by
///  mutators instead of polling.
pub struct ChunkQueues {
    state: Mutex<QueuesState>,
    /// woken on enqueue and whenever in-flight capacity frees up
    wakeup: Notify,
    /// woken when a draining recipient's in-flight count reaches zero
    drained: Notify,
    max_concurrent_sends: usize,
    drop_threshold: usize,
    reconnect_capacity: usize,
}

impl ChunkQueues {
    pub fn new(max_concurrent_sends: usize, drop_threshold: usize, reconnect_capacity: usize) -> ChunkQueues {
        ChunkQueues {
            state: Mutex::new(QueuesState {
                recipients: FxHashMap::default(),
                next_enqueue_seq: 0,
                total_in_flight: 0,
            }),
            wakeup: Notify::new(),
            drained: Notify::new(),
            max_concurrent_sends,
            drop_threshold,
            reconnect_capacity,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueuesState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_recipient(&self, id: ParticipantId, role: ParticipantRole) {
        let mut state = self.lock_state();
        if state.recipients.contains_key(&id) {
            error!("recipient {} registered twice - this is a bug", id);
            return;
        }
        state.recipients.insert(id, RecipientState {
            role,
            queue: ClientQueue::new(self.drop_threshold),
            reconnect: ReconnectBuffer::new(self.reconnect_capacity),
            sink: None,
            enabled: false,
            in_flight: 0,
            draining: false,
        });
    }

    /// Permanently discards a recipient's queue and reconnect buffer. A later handshake
    ///  from the same identity starts from scratch.
    pub fn remove_recipient(&self, id: ParticipantId) {
        let mut state = self.lock_state();
        if state.recipients.remove(&id).is_none() {
            warn!("removing unknown recipient {}", id);
        }
        // a closer may be waiting on a recipient that just ceased to exist
        self.drained.notify_waiters();
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.lock_state().recipients.contains_key(&id)
    }

    pub fn is_enabled(&self, id: ParticipantId) -> bool {
        self.lock_state()
            .recipients
            .get(&id)
            .map(|r| r.enabled)
            .unwrap_or(false)
    }

    pub fn pending_len(&self, id: ParticipantId) -> usize {
        self.lock_state()
            .recipients
            .get(&id)
            .map(|r| r.queue.len())
            .unwrap_or(0)
    }

    /// Binds a (new) socket to the recipient and re-enables dequeuing.
    pub fn bind_sink(&self, id: ParticipantId, sink: Arc<dyn ChunkSink>) {
        let mut state = self.lock_state();
        match state.recipients.get_mut(&id) {
            Some(rec) => {
                rec.sink = Some(sink);
                rec.enabled = true;
            }
            None => error!("binding sink for unknown recipient {} - this is a bug", id),
        }
        drop(state);
        self.wakeup.notify_one();
    }

    /// Stops dequeuing for the recipient and drops its socket, keeping buffered chunks
    ///  for a later reconnect.
    pub fn disable(&self, id: ParticipantId) {
        let mut state = self.lock_state();
        if let Some(rec) = state.recipients.get_mut(&id) {
            rec.enabled = false;
            rec.sink = None;
        }
    }

    pub fn set_current_slide(&self, id: ParticipantId, slide: SlideId) {
        let mut state = self.lock_state();
        if let Some(rec) = state.recipients.get_mut(&id) {
            rec.queue.set_current_slide(slide);
        }
        drop(state);
        self.wakeup.notify_one();
    }

    /// Fans a chunked message out to every recipient in its group.
    pub fn enqueue_message(&self, message: &OutboundMessage, chunks: &[Chunk]) {
        let mut state = self.lock_state();
        let mut num_enqueued = 0;
        let targets = state
            .recipients
            .iter()
            .filter(|(id, rec)| message.group.contains(**id, rec.role))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for chunk in chunks {
            // one enqueue sequence number per (chunk, recipient) pair
            for &id in &targets {
                let enqueue_seq = state.next_enqueue_seq;
                state.next_enqueue_seq += 1;
                if let Some(rec) = state.recipients.get_mut(&id) {
                    rec.queue.enqueue(SendParameters {
                        chunk: chunk.clone(),
                        recipient: id,
                        tags: message.tags,
                        enqueue_seq,
                        is_heartbeat: false,
                    });
                    num_enqueued += 1;
                }
            }
        }
        trace!("enqueued {} chunk instance(s) for group {:?}", num_enqueued, message.group);
        drop(state);
        self.wakeup.notify_one();
    }

    /// Enqueues a heartbeat for one recipient. Heartbeats ride the global queue (never
    ///  shed) but are excluded from the reconnect buffer.
    pub fn enqueue_heartbeat(&self, id: ParticipantId) {
        let mut state = self.lock_state();
        let enqueue_seq = state.next_enqueue_seq;
        state.next_enqueue_seq += 1;
        if let Some(rec) = state.recipients.get_mut(&id) {
            rec.queue.enqueue(SendParameters {
                chunk: Chunk::heartbeat(),
                recipient: id,
                tags: DeliveryTags::global(),
                enqueue_seq,
                is_heartbeat: true,
            });
        }
        drop(state);
        self.wakeup.notify_one();
    }

    /// The replay set for a reconnecting recipient, oldest first.
    pub fn recover(&self, id: ParticipantId, last_message_seq: u64, last_chunk_index: u32) -> Vec<SendParameters> {
        self.lock_state()
            .recipients
            .get(&id)
            .map(|rec| rec.reconnect.recover(last_message_seq, last_chunk_index))
            .unwrap_or_default()
    }

    /// Reinserts replayed chunks, preserving their original relative order.
    pub fn requeue(&self, id: ParticipantId, replay: Vec<SendParameters>) {
        let mut state = self.lock_state();
        if let Some(rec) = state.recipients.get_mut(&id) {
            for params in replay {
                rec.queue.requeue(params);
            }
        }
        drop(state);
        self.wakeup.notify_one();
    }

    /// Waits (bounded) for all in-flight sends to the recipient to finish, so a forced
    ///  socket replacement never interleaves writes from two sockets representing the
    ///  same logical recipient. Returns false on timeout.
    pub async fn wait_drained(&self, id: ParticipantId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // register for the wakeup before checking the condition - notify_waiters
            // stores no permit, so a completion landing between check and await would
            // otherwise be lost and the caller would stall until the deadline
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock_state();
                match state.recipients.get_mut(&id) {
                    None => return true, // removed concurrently - nothing left to drain
                    Some(rec) => {
                        if rec.in_flight == 0 {
                            rec.draining = false;
                            return true;
                        }
                        rec.draining = true;
                    }
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = self.lock_state();
                if let Some(rec) = state.recipients.get_mut(&id) {
                    rec.draining = false;
                }
                return false;
            }
        }
    }

    /// Picks the globally highest-priority ready chunk and marks it in flight.
    ///
    /// A recipient with a send already in flight is excluded - except that a public
    ///  display's global / current-slide chunk (tier 0) may preempt and go out even while
    ///  another send to the same display is outstanding.
    pub(crate) fn take_next(&self) -> Option<(SendParameters, Arc<dyn ChunkSink>)> {
        let mut state = self.lock_state();
        if state.total_in_flight >= self.max_concurrent_sends {
            return None;
        }

        loop {
            let mut best: Option<(ParticipantId, SendRank)> = None;
            for (id, rec) in &state.recipients {
                if !rec.enabled || rec.sink.is_none() {
                    continue;
                }
                let Some(rank) = rec.queue.peek_rank(rec.role) else {
                    continue;
                };
                if rec.in_flight > 0 && rank.tier != 0 {
                    continue;
                }
                if best.map(|(_, b)| rank < b).unwrap_or(true) {
                    best = Some((*id, rank));
                }
            }

            let (id, _) = best?;
            let rec = state.recipients.get_mut(&id)?;
            match rec.queue.dequeue() {
                Some(params) => {
                    let Some(sink) = rec.sink.clone() else {
                        error!("selected recipient {} has no sink - this is a bug", id);
                        return None;
                    };
                    rec.in_flight += 1;
                    rec.reconnect.record(params.clone());
                    state.total_in_flight += 1;
                    return Some((params, sink));
                }
                // everything pending for this recipient was stale real-time traffic and
                // got shed - select again
                None => continue,
            }
        }
    }

    /// Completion callback for one send: frees the concurrency budget, disables the queue
    ///  on a socket error (buffered chunks are kept for reconnect), and signals a waiting
    ///  closer once the recipient's in-flight count reaches zero.
    pub(crate) fn on_send_complete(&self, id: ParticipantId, result: std::io::Result<()>) {
        let mut state = self.lock_state();
        if state.total_in_flight == 0 {
            error!("global in-flight counter underflow - this is a bug");
        } else {
            state.total_in_flight -= 1;
        }

        match state.recipients.get_mut(&id) {
            Some(rec) => {
                if rec.in_flight == 0 {
                    error!("in-flight counter underflow for {} - this is a bug", id);
                } else {
                    rec.in_flight -= 1;
                }
                if let Err(e) = result {
                    warn!("send to {} failed: {} - disabling its queue pending reconnect", id, e);
                    rec.enabled = false;
                    rec.sink = None;
                }
                if rec.draining && rec.in_flight == 0 {
                    self.drained.notify_waiters();
                }
            }
            None => debug!("send completion for removed recipient {}", id),
        }
        drop(state);
        self.wakeup.notify_one();
    }
}

/// Drains the queues: picks the highest-priority ready chunk, issues the send as its own
///  task (sends are concurrent up to the global cap), and sleeps on the wakeup signal
///  when there is nothing to do.
pub async fn run_dispatch_loop(queues: Arc<ChunkQueues>, mut shutdown: watch::Receiver<bool>) {
    debug!("starting dispatch loop");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match queues.take_next() {
            Some((params, sink)) => {
                let queues = queues.clone();
                tokio::spawn(async move {
                    let result = sink.send_chunk(&params.chunk.frame).await;
                    queues.on_send_complete(params.recipient, result);
                });
            }
            None => {
                tokio::select! {
                    _ = queues.wakeup.notified() => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    debug!("dispatch loop terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{make_chunks, SequenceCounter};
    use crate::participant::Group;
    use bytes::Bytes;

    fn queues(cap: usize) -> ChunkQueues {
        ChunkQueues::new(cap, 3, 100)
    }

    fn connected_recipient(q: &ChunkQueues, role: ParticipantRole) -> ParticipantId {
        let id = ParticipantId::new_unique();
        q.add_recipient(id, role);
        q.bind_sink(id, Arc::new(MockChunkSink::new()));
        id
    }

    fn enqueue_one(q: &ChunkQueues, to: ParticipantId, tags: DeliveryTags) {
        let sequences = SequenceCounter::new();
        let chunks = make_chunks(&[1, 2, 3], &sequences, 64);
        let message = OutboundMessage {
            payload: Bytes::from_static(&[1, 2, 3]),
            group: Group::Single(to),
            tags,
        };
        q.enqueue_message(&message, &chunks);
    }

    #[test]
    fn test_take_next_marks_in_flight_and_excludes() {
        let q = queues(50);
        let id = connected_recipient(&q, ParticipantRole::Student);

        enqueue_one(&q, id, DeliveryTags::global());
        enqueue_one(&q, id, DeliveryTags::global());

        assert!(q.take_next().is_some());
        // one-in-flight rule: the same recipient is not selected again
        assert!(q.take_next().is_none());

        q.on_send_complete(id, Ok(()));
        assert!(q.take_next().is_some());
    }

    #[test]
    fn test_public_display_preempts_one_in_flight_rule() {
        let q = queues(50);
        let display = connected_recipient(&q, ParticipantRole::PublicDisplay);

        enqueue_one(&q, display, DeliveryTags::global());
        enqueue_one(&q, display, DeliveryTags::global());

        assert!(q.take_next().is_some());
        // a display's global chunk goes out even with a send outstanding
        assert!(q.take_next().is_some());
    }

    #[test]
    fn test_public_display_other_slide_does_not_preempt() {
        let q = queues(50);
        let display = connected_recipient(&q, ParticipantRole::PublicDisplay);
        q.set_current_slide(display, crate::message::SlideId::from_raw(1));

        enqueue_one(&q, display, DeliveryTags::for_slide(crate::message::SlideId::from_raw(2)));
        enqueue_one(&q, display, DeliveryTags::for_slide(crate::message::SlideId::from_raw(2)));

        assert!(q.take_next().is_some());
        // a non-visible slide's chunk earns no preemption, even for a display
        assert!(q.take_next().is_none());
    }

    #[test]
    fn test_display_outranks_student() {
        let q = queues(50);
        let student = connected_recipient(&q, ParticipantRole::Student);
        let display = connected_recipient(&q, ParticipantRole::PublicDisplay);

        // the student's chunk is older, but the display's tier wins
        enqueue_one(&q, student, DeliveryTags::global());
        enqueue_one(&q, display, DeliveryTags::global());

        let (first, _) = q.take_next().unwrap();
        assert_eq!(first.recipient, display);
        let (second, _) = q.take_next().unwrap();
        assert_eq!(second.recipient, student);
    }

    #[test]
    fn test_global_concurrency_cap() {
        let q = queues(2);
        for _ in 0..3 {
            let id = connected_recipient(&q, ParticipantRole::Student);
            enqueue_one(&q, id, DeliveryTags::global());
        }

        let (first, _) = q.take_next().unwrap();
        assert!(q.take_next().is_some());
        // budget exhausted
        assert!(q.take_next().is_none());

        q.on_send_complete(first.recipient, Ok(()));
        assert!(q.take_next().is_some());
    }

    #[test]
    fn test_send_failure_disables_queue_but_keeps_backlog() {
        let q = queues(50);
        let id = connected_recipient(&q, ParticipantRole::Student);

        enqueue_one(&q, id, DeliveryTags::global());
        enqueue_one(&q, id, DeliveryTags::global());

        let (params, _) = q.take_next().unwrap();
        q.on_send_complete(
            params.recipient,
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        );

        assert!(!q.is_enabled(id));
        assert_eq!(q.pending_len(id), 1);
        assert!(q.take_next().is_none());

        // a reconnect re-binds a sink and delivery resumes
        q.bind_sink(id, Arc::new(MockChunkSink::new()));
        assert!(q.take_next().is_some());
    }

    #[test]
    fn test_dequeued_chunks_are_recorded_for_replay() {
        let q = queues(50);
        let id = connected_recipient(&q, ParticipantRole::Student);

        enqueue_one(&q, id, DeliveryTags::global());
        let (params, _) = q.take_next().unwrap();

        let replay = q.recover(id, 999, 999);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].chunk, params.chunk);
    }

    #[test]
    fn test_heartbeat_sent_but_not_recorded() {
        let q = queues(50);
        let id = connected_recipient(&q, ParticipantRole::Student);

        q.enqueue_heartbeat(id);
        let (params, _) = q.take_next().unwrap();
        assert!(params.is_heartbeat);
        assert!(params.chunk.is_heartbeat());

        assert!(q.recover(id, 999, 999).is_empty());
    }

    #[test]
    fn test_removed_recipient_is_unrecoverable() {
        let q = queues(50);
        let id = connected_recipient(&q, ParticipantRole::Student);
        enqueue_one(&q, id, DeliveryTags::global());
        let _ = q.take_next().unwrap();

        q.remove_recipient(id);

        assert!(!q.contains(id));
        assert!(q.recover(id, 999, 999).is_empty());
        assert_eq!(q.pending_len(id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_drained_completes_on_zero_in_flight() {
        let q = Arc::new(queues(50));
        let id = connected_recipient(&q, ParticipantRole::Student);
        enqueue_one(&q, id, DeliveryTags::global());
        let (params, _) = q.take_next().unwrap();

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_drained(id, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        q.on_send_complete(params.recipient, Ok(()));

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_drained_wakes_promptly_not_at_deadline() {
        let q = Arc::new(queues(50));
        let id = connected_recipient(&q, ParticipantRole::Student);
        enqueue_one(&q, id, DeliveryTags::global());
        let (params, _) = q.take_next().unwrap();

        let started = tokio::time::Instant::now();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_drained(id, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        q.on_send_complete(params.recipient, Ok(()));

        // a lost wakeup would stall the waiter until the deadline and report failure
        assert!(waiter.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_drained_times_out() {
        let q = queues(50);
        let id = connected_recipient(&q, ParticipantRole::Student);
        enqueue_one(&q, id, DeliveryTags::global());
        let _ = q.take_next().unwrap();

        // the in-flight send never completes
        assert!(!q.wait_drained(id, Duration::from_secs(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_loop_sends_and_stops_on_shutdown() {
        let q = Arc::new(queues(50));
        let id = ParticipantId::new_unique();
        q.add_recipient(id, ParticipantRole::Student);

        let mut sink = MockChunkSink::new();
        sink.expect_send_chunk().times(2).returning(|_| Ok(()));
        q.bind_sink(id, Arc::new(sink));

        enqueue_one(&q, id, DeliveryTags::global());
        enqueue_one(&q, id, DeliveryTags::global());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_task = tokio::spawn(run_dispatch_loop(q.clone(), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(q.pending_len(id), 0);

        shutdown_tx.send(true).unwrap();
        loop_task.await.unwrap();
    }
}
