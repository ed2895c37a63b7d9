//! A reliable, priority-ordered, reconnect-tolerant message transport on raw TCP, built for
//!  broadcasting presentation state (slides, ink, polls) from one instructor machine to many
//!  student machines and public displays - and back.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data), not a
//!   byte stream. Big messages are chunked, small ones go out as a single chunk; the receiving
//!   side reassembles them transparently.
//! * One server (the instructor) fans a message out to a *group* of recipients; each recipient
//!   has its own backlog so a slow or dead client never stalls delivery to the others.
//! * Latency matters more than completeness for some traffic: live ink strokes become worthless
//!   once the audience has moved on. Chunks carry a priority tag, and the per-recipient queues
//!   shed stale real-time chunks under backlog pressure rather than delivering them late.
//! * Presentation-global state changes and updates for the recipient's *currently visible*
//!   slide outrank everything else; a public display's visible state outranks even that.
//! * Connections drop - wireless classrooms guarantee it. Identity outlives the socket: a
//!   reconnecting client is recognized by its handshake, its queue is rebound to the new
//!   socket, and a bounded buffer of recently sent chunks is replayed so recently lost
//!   traffic is recovered without a full state resync.
//! * Failure detection is symmetric: the server sends heartbeats and sweeps dead sockets on a
//!   maintenance tick; the client watches for traffic and forces a reconnect when the link
//!   goes quiet.
//! * Explicitly *not* provided: encryption or authentication of the wire, NAT traversal,
//!   multicast discovery, or exactly-once delivery beyond best-effort replay.
//!
//! ## Wire format
//!
//! Every chunk is framed with a fixed header - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  message sequence number (u64) - per-sender monotonic, shared by all chunks of a message
//! 8:  chunk index (u32) - position of this chunk within its message
//! 12: chunk count (u32) - number of chunks in the message; 0 marks a heartbeat frame
//! 16: payload length (u32)
//! 20: payload bytes
//! ```
//!
//! A heartbeat is a zero-payload frame with chunk count 0. It refreshes the receiver's
//!  liveness clock and is never handed to the application, never buffered for replay.
//!
//! The first frame on a fresh connection (in both directions, server first) is a handshake,
//!  prefixed with its own u16 length:
//!
//! ```ascii
//! 0:  frame length (u16) - length of the body that follows
//! 2:  peer id (16 bytes) - stable identity, not tied to the socket
//! 18: endpoint address (1 byte kind: 4|6, then 4 or 16 address bytes, then u16 port)
//! *:  display name (u16 length + UTF-8 bytes)
//! *:  last received message sequence (u64)
//! *:  last received chunk index (u64)
//! ```
//!
//! The two trailing fields are the resumption point: on reconnect the server replays every
//!  buffered chunk more recent than that point. The server ignores them on its own frame.
//!
//! ## Connection lifecycle
//!
//! ```ascii
//! Connected --socket error/close--> Disconnected --handshake, same identity--> Reconnecting
//! Reconnecting --socket swapped, replay enqueued--> Connected
//! Disconnected --removal deadline elapsed--> (queue and replay buffer discarded)
//! ```
//!
//! `Reconnecting` is a short-lived guard state: while a socket swap is in progress the
//!  maintenance sweep keeps its hands off that client.

pub mod chunk;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod inbound;
pub mod message;
pub mod participant;
pub mod reconnect;
pub mod send_queue;
pub mod server;
