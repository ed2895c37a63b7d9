use crate::chunk::{make_chunks, read_chunk, SequenceCounter};
use crate::config::TransportConfig;
use crate::dispatcher::{run_dispatch_loop, ChunkQueues, TcpChunkSink};
use crate::error::TransportError;
use crate::handshake::{read_handshake, write_handshake, Handshake};
use crate::inbound::{InboundHandler, ReceiveState};
use crate::message::{DeliveryTags, OutboundMessage, SlideId};
use crate::participant::{Group, ParticipantId, ParticipantRole};
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

struct ClientShared {
    config: TransportConfig,
    client_id: ParticipantId,
    /// local key for the server's send queue and reconnect buffer - generated here, never
    ///  sent on the wire, stable across reconnects
    server_key: ParticipantId,
    queues: Arc<ChunkQueues>,
    sequences: SequenceCounter,
    handler: Arc<dyn InboundHandler>,
    receive: Arc<Mutex<ReceiveState>>,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

/// The participant-side endpoint: maintains one connection to the server, reconnecting
///  with backoff until shut down, and buffers outgoing messages across the gaps.
pub struct ClientEndpoint {
    shared: Arc<ClientShared>,
}

impl ClientEndpoint {
    pub fn new(config: TransportConfig, handler: Arc<dyn InboundHandler>) -> ClientEndpoint {
        let queues = Arc::new(ChunkQueues::new(
            config.max_concurrent_sends,
            config.realtime_drop_threshold,
            config.reconnect_buffer_capacity,
        ));
        let server_key = ParticipantId::new_unique();
        queues.add_recipient(server_key, ParticipantRole::Student);
        let (connected, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        ClientEndpoint {
            shared: Arc::new(ClientShared {
                client_id: ParticipantId::new_unique(),
                server_key,
                queues,
                sequences: SequenceCounter::new(),
                handler,
                receive: Arc::new(Mutex::new(ReceiveState::new())),
                connected,
                shutdown,
                config,
            }),
        }
    }

    /// Connects and keeps the connection alive until [`Self::shutdown`] is called,
    ///  retrying with a fixed pause whenever the connection dies or cannot be made.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.shared.config.validate()?;
        tokio::spawn(run_dispatch_loop(
            self.shared.queues.clone(),
            self.shared.shutdown.subscribe(),
        ));

        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = connect_once(&self.shared).await {
                debug!("connection attempt failed: {}", e);
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.shared.config.connect_retry_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("client endpoint terminated");
        Ok(())
    }

    /// Hands a message to the transport. Buffered locally while disconnected and sent
    ///  once the connection is (re)established.
    pub fn send_message(&self, tags: DeliveryTags, payload: Bytes) {
        let chunks = make_chunks(&payload, &self.shared.sequences, self.shared.config.max_chunk_payload);
        let message = OutboundMessage {
            payload,
            group: Group::Single(self.shared.server_key),
            tags,
        };
        self.shared.queues.enqueue_message(&message, &chunks);
    }

    /// The slide the user is currently viewing, prioritizing what is sent first and what
    ///  gets shed under backlog pressure.
    pub fn set_current_slide(&self, slide: SlideId) {
        self.shared.queues.set_current_slide(self.shared.server_key, slide);
    }

    pub fn id(&self) -> ParticipantId {
        self.shared.client_id
    }

    /// Observes connection establishment and loss.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
    }
}

fn lock_receive(receive: &Mutex<ReceiveState>) -> MutexGuard<'_, ReceiveState> {
    receive.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The receive timeout, doubled on links too slow to trust the usual heartbeat cadence.
fn adaptive_receive_timeout(config: &TransportConfig) -> Duration {
    match config.link_speed_bps {
        Some(bps) if bps < 11_000_000 => config.base_receive_timeout * 2,
        _ => config.base_receive_timeout,
    }
}

/// One connection attempt: TCP connect, handshake exchange (server talks first, the
///  client reports its resumption point), then frames until the connection dies.
async fn connect_once(shared: &Arc<ClientShared>) -> anyhow::Result<()> {
    let stream = TcpStream::connect(shared.config.peer_addr).await?;
    stream.set_nodelay(true)?;
    let local_addr = stream.local_addr()?;
    let (mut read_half, mut write_half) = stream.into_split();

    let hello = tokio::time::timeout(shared.config.handshake_timeout, read_handshake(&mut read_half))
        .await
        .map_err(|_| TransportError::Handshake("server did not complete the handshake in time".to_string()))??;

    let (last_message_seq, last_chunk_index) = {
        let receive = lock_receive(&shared.receive);
        (receive.last_message_seq, receive.last_chunk_index)
    };
    write_handshake(&mut write_half, &Handshake {
        peer_id: shared.client_id,
        endpoint: local_addr,
        name: shared.config.endpoint_name.clone(),
        last_message_seq,
        last_chunk_index: last_chunk_index as u64,
    })
    .await?;

    info!("connected to {} ({})", hello.name, hello.peer_id);
    // the liveness clock must start at the handshake, not at whatever the previous
    // connection last received, or the watchdog kills a fresh connection after an outage
    lock_receive(&shared.receive).last_received_at = tokio::time::Instant::now();
    shared.queues.bind_sink(shared.server_key, Arc::new(TcpChunkSink::new(write_half)));
    let _ = shared.connected.send(true);

    run_connection(shared, hello.peer_id, &mut read_half).await;

    shared.queues.disable(shared.server_key);
    let _ = shared.connected.send(false);
    Ok(())
}

/// Reads frames until the socket dies, the server goes silent for too long, or shutdown
///  is requested. Heartbeats only refresh the liveness clock.
async fn run_connection(
    shared: &Arc<ClientShared>,
    server_id: ParticipantId,
    read_half: &mut OwnedReadHalf,
) {
    let receive_timeout = adaptive_receive_timeout(&shared.config);
    let mut watchdog = tokio::time::interval(Duration::from_secs(1));
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        // the in-progress read must survive watchdog ticks, so it is polled across them
        let frame = {
            let read = read_chunk(read_half, shared.config.max_chunk_payload);
            tokio::pin!(read);
            loop {
                tokio::select! {
                    frame = &mut read => break frame,
                    _ = watchdog.tick() => {
                        let last = lock_receive(&shared.receive).last_received_at;
                        if last.elapsed() > receive_timeout {
                            warn!("nothing received for {:?} - treating the connection as dead", receive_timeout);
                            return;
                        }
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() {
                        return;
                    },
                }
            }
        };

        let (header, payload) = match frame {
            Ok(frame) => frame,
            Err(TransportError::ConnectionClosed) => {
                info!("server closed the connection");
                return;
            }
            Err(e) => {
                warn!("receiving failed: {}", e);
                return;
            }
        };

        let completed = {
            let mut receive = lock_receive(&shared.receive);
            receive.last_received_at = tokio::time::Instant::now();
            if header.is_heartbeat() {
                None
            } else {
                receive.last_message_seq = header.message_seq;
                receive.last_chunk_index = header.chunk_index;
                match receive.assembler.add(header, payload) {
                    Ok(completed) => completed,
                    Err(e) => {
                        warn!("corrupted stream from the server: {}", e);
                        return;
                    }
                }
            }
        };

        if let Some(message) = completed {
            shared.handler.on_message(server_id, message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::MockInboundHandler;
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[rstest]
    #[case::unknown_link(None, 15)]
    #[case::fast_link(Some(100_000_000), 15)]
    #[case::at_threshold(Some(11_000_000), 15)]
    #[case::slow_link(Some(5_000_000), 30)]
    fn test_adaptive_receive_timeout(#[case] link_speed_bps: Option<u64>, #[case] expected_secs: u64) {
        let mut config = TransportConfig::new("127.0.0.1:9100".parse().unwrap(), "c");
        config.link_speed_bps = link_speed_bps;

        assert_eq!(adaptive_receive_timeout(&config), Duration::from_secs(expected_secs));
    }

    #[test]
    fn test_messages_buffer_while_disconnected() {
        let mut handler = MockInboundHandler::new();
        handler.expect_on_message().never();
        let client = ClientEndpoint::new(
            TransportConfig::new("127.0.0.1:9100".parse().unwrap(), "c"),
            Arc::new(handler),
        );

        client.send_message(DeliveryTags::global(), Bytes::from_static(b"queued"));
        client.send_message(DeliveryTags::global(), Bytes::from_static(b"offline"));

        assert_eq!(client.shared.queues.pending_len(client.shared.server_key), 2);
        // no socket yet, so nothing is dispatchable
        assert!(client.shared.queues.take_next().is_none());
    }

    async fn server_side_handshake(stream: tokio::net::TcpStream, addr: std::net::SocketAddr)
        -> (tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf)
    {
        let (mut read_half, mut write_half) = stream.into_split();
        write_handshake(&mut write_half, &Handshake {
            peer_id: ParticipantId::new_unique(),
            endpoint: addr,
            name: "presenter".to_string(),
            last_message_seq: 0,
            last_chunk_index: 0,
        })
        .await
        .unwrap();
        read_handshake(&mut read_half).await.unwrap();
        (read_half, write_half)
    }

    #[tokio::test]
    async fn test_connection_survives_after_outage_longer_than_receive_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = TransportConfig::new(addr, "student-3");
        config.maintenance_interval = Duration::from_millis(50);
        config.heartbeat_every_n_ticks = 2;
        config.base_receive_timeout = Duration::from_millis(300);
        config.connect_retry_interval = Duration::from_millis(50);

        let mut handler = MockInboundHandler::new();
        handler.expect_on_message().returning(|_, _| ());
        let client = Arc::new(ClientEndpoint::new(config, Arc::new(handler)));
        let client_task = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };

        // first connection comes up, then dies
        let (stream, _) = listener.accept().await.unwrap();
        drop(server_side_handshake(stream, addr).await);

        // an outage well past the receive timeout
        tokio::time::sleep(Duration::from_millis(400)).await;

        // the next connection is kept alive by heartbeats - the stale timestamp from
        // before the outage must not trip the watchdog
        let (stream, _) = listener.accept().await.unwrap();
        let (_read_half, mut write_half) = server_side_handshake(stream, addr).await;
        let heartbeats = tokio::spawn(async move {
            for _ in 0..15 {
                if write_half.write_all(&crate::chunk::Chunk::heartbeat().frame).await.is_err() {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            true
        });

        // a reconnect attempt would show up as another incoming connection
        let reconnect = tokio::time::timeout(Duration::from_millis(1200), listener.accept()).await;
        assert!(reconnect.is_err(), "client dropped a live, heartbeating connection");
        assert!(heartbeats.await.unwrap());

        client.shutdown();
        client_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_handshake_and_message_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (msg_tx, mut msg_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handler = MockInboundHandler::new();
        handler.expect_on_message().returning(move |from, payload| {
            let _ = msg_tx.send((from, payload));
        });

        let client = Arc::new(ClientEndpoint::new(
            TransportConfig::new(addr, "student-7"),
            Arc::new(handler),
        ));
        let client_task = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };

        let (stream, _) = listener.accept().await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();

        // server talks first
        let server_id = ParticipantId::new_unique();
        write_handshake(&mut write_half, &Handshake {
            peer_id: server_id,
            endpoint: addr,
            name: "presenter".to_string(),
            last_message_seq: 0,
            last_chunk_index: 0,
        })
        .await
        .unwrap();

        let client_handshake = read_handshake(&mut read_half).await.unwrap();
        assert_eq!(client_handshake.name, "student-7");
        assert_eq!(client_handshake.peer_id, client.id());
        assert_eq!(client_handshake.last_message_seq, 0);

        // server -> client: one single-chunk message
        let sequences = SequenceCounter::new();
        let chunk = make_chunks(b"slide-deck", &sequences, 1024).into_iter().next().unwrap();
        write_half.write_all(&chunk.frame).await.unwrap();

        let (from, payload) = msg_rx.recv().await.unwrap();
        assert_eq!(from, server_id);
        assert_eq!(payload, Bytes::from_static(b"slide-deck"));

        // client -> server: goes through the queues and the dispatch loop
        client.send_message(DeliveryTags::global(), Bytes::from_static(b"poll-answer"));
        let (header, payload) = read_chunk(&mut read_half, 16 * 1024).await.unwrap();
        assert_eq!(header.chunk_count, 1);
        assert_eq!(payload, Bytes::from_static(b"poll-answer"));

        client.shutdown();
        client_task.await.unwrap().unwrap();
    }
}
