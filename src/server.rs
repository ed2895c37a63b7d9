use crate::chunk::{make_chunks, read_chunk, SequenceCounter};
use crate::config::TransportConfig;
use crate::dispatcher::{run_dispatch_loop, ChunkQueues, ChunkSink, TcpChunkSink};
use crate::error::TransportError;
use crate::handshake::{read_handshake, write_handshake, Handshake};
use crate::inbound::{InboundHandler, ReceiveState};
use crate::message::{DeliveryTags, OutboundMessage, SlideId};
use crate::participant::{Group, ParticipantId};
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle of a participant as the server sees it.
///
/// ```text
///           handshake                    socket lost
/// (new) --------------> Connected -----------------------> Disconnected
///                           ^                                   |
///                           |     handshake (same identity)     |
///                           +--------- Reconnecting <-----------+
/// ```
///
/// `Reconnecting` is a guard state: while a reconnect is being wired up (draining the old
///  socket, replaying buffered chunks) the maintenance sweep keeps its hands off, and a
///  competing handshake for the same identity is rejected.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

struct ClientData {
    name: String,
    connection_state: ConnectionState,
    /// set when entering `Disconnected` - the client is removed for good once it passes
    disconnect_deadline: Option<Instant>,
    receive: Arc<Mutex<ReceiveState>>,
    recv_task: Option<JoinHandle<()>>,
    /// bumped on every (re)handshake. A receive loop carries the generation it was
    ///  spawned under, so a stale loop's death report cannot disable a newer socket.
    generation: u64,
}

struct ServerShared {
    config: TransportConfig,
    server_id: ParticipantId,
    queues: Arc<ChunkQueues>,
    sequences: SequenceCounter,
    handler: Arc<dyn InboundHandler>,
    clients: Mutex<FxHashMap<ParticipantId, ClientData>>,
    shutdown: watch::Sender<bool>,
}

/// The presenter-side endpoint: accepts connections, tracks each participant's lifecycle,
///  and feeds the shared [`ChunkQueues`] the dispatch loop drains.
pub struct ServerEndpoint {
    shared: Arc<ServerShared>,
}

impl ServerEndpoint {
    pub fn new(config: TransportConfig, handler: Arc<dyn InboundHandler>) -> ServerEndpoint {
        let queues = Arc::new(ChunkQueues::new(
            config.max_concurrent_sends,
            config.realtime_drop_threshold,
            config.reconnect_buffer_capacity,
        ));
        let (shutdown, _) = watch::channel(false);
        ServerEndpoint {
            shared: Arc::new(ServerShared {
                server_id: ParticipantId::new_unique(),
                queues,
                sequences: SequenceCounter::new(),
                handler,
                clients: Mutex::new(FxHashMap::default()),
                shutdown,
                config,
            }),
        }
    }

    /// Binds the listener and runs until [`Self::shutdown`] is called. Spawns the
    ///  dispatch and maintenance loops and one connection task per accepted socket.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.shared.config.validate()?;
        let listener = TcpListener::bind(self.shared.config.peer_addr).await?;
        info!("listening on {}", listener.local_addr()?);

        tokio::spawn(run_dispatch_loop(
            self.shared.queues.clone(),
            self.shared.shutdown.subscribe(),
        ));
        tokio::spawn(maintenance_loop(
            self.shared.clone(),
            self.shared.shutdown.subscribe(),
        ));

        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!("accepted a connection from {}", remote);
                        tokio::spawn(handle_connection(self.shared.clone(), stream, remote));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                _ = shutdown.changed() => if *shutdown.borrow() {
                    info!("shutting down");
                    break;
                },
            }
        }
        Ok(())
    }

    /// Hands a message to the transport. Chunking and per-recipient fan-out happen here,
    ///  delivery is asynchronous.
    pub fn send_message(&self, group: Group, tags: DeliveryTags, payload: Bytes) {
        let chunks = make_chunks(&payload, &self.shared.sequences, self.shared.config.max_chunk_payload);
        let message = OutboundMessage { payload, group, tags };
        self.shared.queues.enqueue_message(&message, &chunks);
    }

    /// Updates which slide a participant is looking at, changing how its pending chunks
    ///  are prioritized and shed.
    pub fn set_current_slide(&self, id: ParticipantId, slide: SlideId) {
        self.shared.queues.set_current_slide(id, slide);
    }

    pub fn connection_state(&self, id: ParticipantId) -> Option<ConnectionState> {
        self.shared
            .lock_clients()
            .get(&id)
            .map(|client| client.connection_state)
    }

    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
    }
}

impl ServerShared {
    fn lock_clients(&self) -> MutexGuard<'_, FxHashMap<ParticipantId, ClientData>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wires up a peer that just completed its handshake, returning the receive state for
    ///  the connection's receive loop, or `None` if the handshake is rejected.
    ///
    /// For a known identity this is a reconnect: the old socket is drained and dropped,
    ///  and the chunks the peer reports missing are replayed. The peer sits in
    ///  [`ConnectionState::Reconnecting`] for the duration.
    async fn register_peer(
        &self,
        handshake: &Handshake,
        sink: Arc<dyn ChunkSink>,
    ) -> Option<(Arc<Mutex<ReceiveState>>, u64)> {
        let id = handshake.peer_id;

        let is_new = {
            let mut clients = self.lock_clients();
            match clients.get_mut(&id) {
                Some(client) => {
                    if client.connection_state == ConnectionState::Reconnecting {
                        warn!("{} attempted a reconnect while another one is in progress - rejecting", id);
                        return None;
                    }
                    debug!("{} is reconnecting (was {:?})", id, client.connection_state);
                    client.connection_state = ConnectionState::Reconnecting;
                    client.disconnect_deadline = None;
                    client.generation += 1;
                    if let Some(task) = client.recv_task.take() {
                        task.abort();
                    }
                    false
                }
                None => {
                    clients.insert(id, ClientData {
                        name: handshake.name.clone(),
                        connection_state: ConnectionState::Reconnecting,
                        disconnect_deadline: None,
                        receive: Arc::new(Mutex::new(ReceiveState::new())),
                        recv_task: None,
                        generation: 0,
                    });
                    true
                }
            }
        };

        if is_new {
            let role = self.handler.role_of(id);
            self.queues.add_recipient(id, role);
            info!("{} ({}) joined as {:?}", handshake.name, id, role);
            self.handler.on_participant_joined(id, &handshake.name).await;
        } else {
            self.queues.disable(id);
            if !self
                .queues
                .wait_drained(id, self.config.forced_close_drain_timeout)
                .await
            {
                warn!("timed out draining in-flight sends to {} - replacing the socket anyway", id);
            }
            // an implausible chunk index must not wrap into a false match - a clamped
            // value matches nothing and the whole buffer is replayed
            let last_chunk_index = u32::try_from(handshake.last_chunk_index).unwrap_or(u32::MAX);
            let replay = self.queues.recover(id, handshake.last_message_seq, last_chunk_index);
            debug!("replaying {} chunk(s) to {}", replay.len(), id);
            self.queues.requeue(id, replay);
        }

        self.queues.bind_sink(id, sink);

        let mut clients = self.lock_clients();
        match clients.get_mut(&id) {
            Some(client) => {
                client.connection_state = ConnectionState::Connected;
                client.disconnect_deadline = None;
                Some((client.receive.clone(), client.generation))
            }
            None => None,
        }
    }

    fn store_recv_task(&self, id: ParticipantId, generation: u64, task: JoinHandle<()>) {
        let mut clients = self.lock_clients();
        match clients.get_mut(&id) {
            Some(client) if client.generation == generation => client.recv_task = Some(task),
            _ => task.abort(),
        }
    }

    /// A receive loop noticed its socket dying. Sending stops, and a removal deadline
    ///  starts ticking unless a reconnect is already under way.
    ///
    /// A dying receive loop can race the reconnect that replaces it: `abort` cannot
    ///  interrupt a loop already past its read, so its death report may arrive after the
    ///  new socket is bound. The generation check makes such a report a no-op instead of
    ///  letting it disable the fresh socket.
    fn on_socket_lost(&self, id: ParticipantId, generation: u64) {
        let mut clients = self.lock_clients();
        let Some(client) = clients.get_mut(&id) else {
            return;
        };
        if client.generation != generation {
            debug!("ignoring the loss of an already replaced socket for {}", id);
            return;
        }
        self.queues.disable(id);
        if client.connection_state == ConnectionState::Connected {
            client.connection_state = ConnectionState::Disconnected;
            client.disconnect_deadline = Some(Instant::now() + self.config.disconnect_removal_timeout);
            info!(
                "lost the connection to {} - keeping its buffered state for {:?}",
                id, self.config.disconnect_removal_timeout
            );
        }
    }

    /// One housekeeping pass: reconciles lifecycle state with the send side, removes
    ///  clients whose removal deadline passed, and enqueues periodic heartbeats.
    fn maintain_once(&self, tick: u64, now: Instant) {
        let mut removed: Vec<(ParticipantId, String)> = Vec::new();
        let mut heartbeat_targets = Vec::new();
        {
            let mut clients = self.lock_clients();
            clients.retain(|id, client| match client.connection_state {
                ConnectionState::Reconnecting => true,
                ConnectionState::Connected => {
                    if self.queues.is_enabled(*id) {
                        heartbeat_targets.push(*id);
                    } else {
                        // the send side lost the socket before the receive loop noticed
                        client.connection_state = ConnectionState::Disconnected;
                        client.disconnect_deadline = Some(now + self.config.disconnect_removal_timeout);
                        debug!("{} has no usable socket - marking it disconnected", id);
                    }
                    true
                }
                ConnectionState::Disconnected => {
                    let expired = client.disconnect_deadline.map(|d| now >= d).unwrap_or(false);
                    if expired {
                        if let Some(task) = client.recv_task.take() {
                            task.abort();
                        }
                        removed.push((*id, client.name.clone()));
                    }
                    !expired
                }
            });
        }

        for (id, name) in removed {
            info!("{} ({}) did not reconnect in time - discarding its queue and reconnect buffer", name, id);
            self.queues.remove_recipient(id);
        }

        if tick % self.config.heartbeat_every_n_ticks == 0 {
            for id in heartbeat_targets {
                self.queues.enqueue_heartbeat(id);
            }
        }
    }
}

async fn maintenance_loop(shared: Arc<ServerShared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.maintenance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick += 1;
                shared.maintain_once(tick, Instant::now());
            }
            _ = shutdown.changed() => if *shutdown.borrow() {
                break;
            },
        }
    }
}

async fn handle_connection(shared: Arc<ServerShared>, stream: TcpStream, remote: SocketAddr) {
    if let Err(e) = serve_connection(shared, stream, remote).await {
        debug!("connection from {} not serviceable: {}", remote, e);
    }
}

async fn serve_connection(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    remote: SocketAddr,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let local_addr = stream.local_addr()?;
    let (mut read_half, mut write_half) = stream.into_split();

    // the server introduces itself first; the resume fields mean nothing in this
    // direction and stay zero
    write_handshake(&mut write_half, &Handshake {
        peer_id: shared.server_id,
        endpoint: local_addr,
        name: shared.config.endpoint_name.clone(),
        last_message_seq: 0,
        last_chunk_index: 0,
    })
    .await?;

    let peer = tokio::time::timeout(shared.config.handshake_timeout, read_handshake(&mut read_half))
        .await
        .map_err(|_| TransportError::Handshake("peer did not complete the handshake in time".to_string()))??;

    let sink = Arc::new(TcpChunkSink::new(write_half));
    let Some((receive, generation)) = shared.register_peer(&peer, sink).await else {
        bail!("handshake from {} at {} rejected", peer.peer_id, remote);
    };

    let id = peer.peer_id;
    let task = tokio::spawn(receive_loop(shared.clone(), id, generation, read_half, receive));
    shared.store_recv_task(id, generation, task);
    Ok(())
}

/// Reads frames off one socket until it dies. Heartbeats only refresh the liveness clock;
///  data chunks advance the resumption point and feed the assembler.
async fn receive_loop(
    shared: Arc<ServerShared>,
    id: ParticipantId,
    generation: u64,
    mut read_half: OwnedReadHalf,
    receive: Arc<Mutex<ReceiveState>>,
) {
    loop {
        let (header, payload) = match read_chunk(&mut read_half, shared.config.max_chunk_payload).await {
            Ok(frame) => frame,
            Err(TransportError::ConnectionClosed) => {
                debug!("{} closed the connection", id);
                break;
            }
            Err(e) => {
                warn!("receiving from {} failed: {}", id, e);
                break;
            }
        };

        let completed = {
            let mut receive = receive.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            receive.last_received_at = Instant::now();
            if header.is_heartbeat() {
                None
            } else {
                receive.last_message_seq = header.message_seq;
                receive.last_chunk_index = header.chunk_index;
                match receive.assembler.add(header, payload) {
                    Ok(completed) => completed,
                    Err(e) => {
                        warn!("corrupted stream from {}: {}", id, e);
                        break;
                    }
                }
            }
        };

        if let Some(message) = completed {
            shared.handler.on_message(id, message).await;
        }
    }
    shared.on_socket_lost(id, generation);
}
