use crate::error::TransportError;
use crate::participant::ParticipantId;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

const MAX_HANDSHAKE_LEN: usize = 1024;
pub(crate) const MAX_NAME_LEN: usize = 512;

const ADDR_KIND_V4: u8 = 4;
const ADDR_KIND_V6: u8 = 6;

/// The first frame on every fresh connection, sent by both sides (server first). It
///  identifies the sender and, on the client side, reports the resumption point so the
///  server knows which buffered chunks to replay.
///
/// Wire format: a u16 length prefix followed by
/// ```text
/// +---------------+----------------------------+-------------------+-----------+-----------+
/// | peer id (16B) | endpoint (kind, addr, port)| name (u16 + utf8) | MsgSeq 8B | ChnkIx 8B |
/// +---------------+----------------------------+-------------------+-----------+-----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub peer_id: ParticipantId,
    /// the sender's own view of its address, for logging and diagnostics
    pub endpoint: SocketAddr,
    pub name: String,
    /// message sequence of the last fully received chunk, 0 if none
    pub last_message_seq: u64,
    /// chunk index of the last fully received chunk within that message
    pub last_chunk_index: u64,
}

impl Handshake {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.peer_id.as_bytes());
        match self.endpoint.ip() {
            IpAddr::V4(addr) => {
                buf.put_u8(ADDR_KIND_V4);
                buf.put_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                buf.put_u8(ADDR_KIND_V6);
                buf.put_slice(&addr.octets());
            }
        }
        buf.put_u16(self.endpoint.port());
        buf.put_u16(self.name.len() as u16);
        buf.put_slice(self.name.as_bytes());
        buf.put_u64(self.last_message_seq);
        buf.put_u64(self.last_chunk_index);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Handshake, TransportError> {
        let mut id_bytes = [0u8; 16];
        if buf.remaining() < id_bytes.len() {
            return Err(TransportError::Handshake("truncated peer id".to_string()));
        }
        buf.copy_to_slice(&mut id_bytes);
        let peer_id = ParticipantId::from_bytes(id_bytes);

        let ip = match buf.try_get_u8() {
            Ok(ADDR_KIND_V4) => {
                let mut octets = [0u8; 4];
                if buf.remaining() < octets.len() {
                    return Err(TransportError::Handshake("truncated v4 address".to_string()));
                }
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            Ok(ADDR_KIND_V6) => {
                let mut octets = [0u8; 16];
                if buf.remaining() < octets.len() {
                    return Err(TransportError::Handshake("truncated v6 address".to_string()));
                }
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            Ok(kind) => {
                return Err(TransportError::Handshake(format!("unknown address kind {}", kind)))
            }
            Err(_) => return Err(TransportError::Handshake("truncated address kind".to_string())),
        };
        let port = buf
            .try_get_u16()
            .map_err(|_| TransportError::Handshake("truncated port".to_string()))?;
        let endpoint = SocketAddr::new(ip, port);

        let name_len = buf
            .try_get_u16()
            .map_err(|_| TransportError::Handshake("truncated name length".to_string()))?
            as usize;
        if name_len > MAX_NAME_LEN {
            return Err(TransportError::Handshake(format!("name too long: {}", name_len)));
        }
        if buf.remaining() < name_len {
            return Err(TransportError::Handshake("truncated name".to_string()));
        }
        let name = String::from_utf8(buf.copy_to_bytes(name_len).to_vec())
            .map_err(|_| TransportError::Handshake("name is not valid utf-8".to_string()))?;

        let last_message_seq = buf
            .try_get_u64()
            .map_err(|_| TransportError::Handshake("truncated message sequence".to_string()))?;
        let last_chunk_index = buf
            .try_get_u64()
            .map_err(|_| TransportError::Handshake("truncated chunk index".to_string()))?;

        Ok(Handshake {
            peer_id,
            endpoint,
            name,
            last_message_seq,
            last_chunk_index,
        })
    }
}

pub async fn write_handshake(
    stream: &mut (impl AsyncWriteExt + Unpin),
    handshake: &Handshake,
) -> Result<(), TransportError> {
    let mut body = BytesMut::new();
    handshake.ser(&mut body);

    let mut frame = BytesMut::with_capacity(2 + body.len());
    frame.put_u16(body.len() as u16);
    frame.put_slice(&body);

    stream.write_all(&frame).await?;
    stream.flush().await?;
    trace!("sent handshake as {}", handshake.peer_id);
    Ok(())
}

pub async fn read_handshake(
    stream: &mut (impl AsyncReadExt + Unpin),
) -> Result<Handshake, TransportError> {
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(map_handshake_eof)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_HANDSHAKE_LEN {
        return Err(TransportError::Handshake(format!("implausible handshake length {}", len)));
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(map_handshake_eof)?;

    let mut buf = &body[..];
    let handshake = Handshake::deser(&mut buf)?;
    if buf.has_remaining() {
        return Err(TransportError::Handshake("trailing bytes after handshake".to_string()));
    }
    Ok(handshake)
}

fn map_handshake_eof(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Handshake("peer closed the connection mid-handshake".to_string())
    } else {
        TransportError::Socket(e)
    }
}
