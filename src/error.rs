use thiserror::Error;

/// Failure taxonomy for the transport. Receive loops match on this to distinguish
///  "this connection is unusable, let reconnect handling take over" from errors that are
///  local to one connection attempt.
///
/// All per-connection failures stay local: none of these is ever fatal to the process.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A chunk header is malformed or its declared length is inconsistent with the bytes
    ///  actually on the stream. The connection is treated as corrupted and closed; the
    ///  reconnect logic takes over from there.
    #[error("framing error: {0}")]
    Framing(String),

    /// The first frame on a fresh connection was not a well-formed handshake. Rejects that
    ///  connection attempt only.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// The peer closed the connection at a frame boundary.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The socket reported an error (reset, aborted, ...). The recipient transitions to
    ///  `Disconnected`; its queue is preserved for a bounded grace period.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

impl TransportError {
    /// Send-side errors that are worth retrying on the same socket (send buffer full and
    ///  the like) rather than tearing the connection down.
    pub fn is_transient_send_error(e: &std::io::Error) -> bool {
        matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
        )
    }
}
