use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Fixed header in front of every chunk on the wire. All numbers big-endian.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    /// per-sender monotonic, shared by all chunks of one message
    pub message_seq: u64,
    pub chunk_index: u32,
    /// number of chunks in the message - 0 marks a heartbeat frame
    pub chunk_count: u32,
    pub payload_len: u32,
}

impl ChunkHeader {
    pub const SERIALIZED_LEN: usize = 20;

    pub fn is_heartbeat(&self) -> bool {
        self.chunk_count == 0
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.message_seq);
        buf.put_u32(self.chunk_index);
        buf.put_u32(self.chunk_count);
        buf.put_u32(self.payload_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ChunkHeader> {
        let message_seq = buf.try_get_u64()?;
        let chunk_index = buf.try_get_u32()?;
        let chunk_count = buf.try_get_u32()?;
        let payload_len = buf.try_get_u32()?;
        Ok(ChunkHeader {
            message_seq,
            chunk_index,
            chunk_count,
            payload_len,
        })
    }
}

/// One framed chunk, ready for the wire: the full frame (header + payload) lives in a
///  shared buffer so per-recipient queues and the reconnect buffer can hold it without
///  copying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub header: ChunkHeader,
    /// sequence number of this chunk in the sender's shared chunk counter - scheduling
    ///  metadata only, never serialized
    pub chunk_seq: u64,
    /// header + payload, contiguous
    pub frame: Bytes,
}

impl Chunk {
    pub fn heartbeat() -> Chunk {
        let header = ChunkHeader {
            message_seq: 0,
            chunk_index: 0,
            chunk_count: 0,
            payload_len: 0,
        };
        let mut buf = BytesMut::with_capacity(ChunkHeader::SERIALIZED_LEN);
        header.ser(&mut buf);
        Chunk {
            header,
            chunk_seq: 0,
            frame: buf.freeze(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.header.is_heartbeat()
    }
}

/// Process-wide monotonic counters for message and chunk sequence numbers.
///
/// All senders on an endpoint share one instance; [`make_chunks`] advances it under its
///  lock so concurrently chunked messages get disjoint, strictly increasing numbers.
///  Callers hold no reference to the raw counters beyond what they are given.
pub struct SequenceCounter {
    // (next message seq, next chunk seq) - both start at 1, 0 is 'nothing yet'
    next: Mutex<(u64, u64)>,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceCounter {
    pub fn new() -> SequenceCounter {
        SequenceCounter {
            next: Mutex::new((1, 1)),
        }
    }

    /// Reserves one message sequence number and `chunk_count` chunk sequence numbers,
    ///  returning `(message_seq, first_chunk_seq)`.
    fn advance(&self, chunk_count: u32) -> (u64, u64) {
        let mut guard = self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = *guard;
        guard.0 += 1;
        guard.1 += chunk_count as u64;
        result
    }
}

/// Splits a serialized message into chunks of at most `max_chunk_payload` payload bytes,
///  stamping them with fresh sequence numbers from the shared counter.
///
/// A zero-length message still produces one (empty) chunk, so every message has a presence
///  on the wire and a resumption point.
pub fn make_chunks(payload: &[u8], sequences: &SequenceCounter, max_chunk_payload: usize) -> Vec<Chunk> {
    let chunk_count = payload.len().div_ceil(max_chunk_payload).max(1) as u32;
    let (message_seq, first_chunk_seq) = sequences.advance(chunk_count);

    trace!(
        "chunking message {} into {} chunk(s) of <= {} bytes",
        message_seq,
        chunk_count,
        max_chunk_payload
    );

    let mut chunks = Vec::with_capacity(chunk_count as usize);
    for index in 0..chunk_count {
        let start = index as usize * max_chunk_payload;
        let end = (start + max_chunk_payload).min(payload.len());
        let part = &payload[start..end];

        let header = ChunkHeader {
            message_seq,
            chunk_index: index,
            chunk_count,
            payload_len: part.len() as u32,
        };
        let mut buf = BytesMut::with_capacity(ChunkHeader::SERIALIZED_LEN + part.len());
        header.ser(&mut buf);
        buf.put_slice(part);

        chunks.push(Chunk {
            header,
            chunk_seq: first_chunk_seq + index as u64,
            frame: buf.freeze(),
        });
    }
    chunks
}

/// Reassembles received chunks into complete messages.
///
/// Chunks of one message ride a single ordered TCP stream, so they are expected strictly
///  in index order. That assumption is *verified* rather than trusted: an index gap means
///  the stream is corrupted and the connection must be closed.
#[derive(Default)]
pub struct ChunkAssembler {
    in_progress: FxHashMap<u64, PartialMessage>,
}

struct PartialMessage {
    chunk_count: u32,
    arrived: u32,
    acc: BytesMut,
}

impl ChunkAssembler {
    pub fn new() -> ChunkAssembler {
        ChunkAssembler::default()
    }

    /// Buffers one chunk; returns the completed message once all of its chunks arrived.
    pub fn add(&mut self, header: ChunkHeader, payload: Bytes) -> Result<Option<Bytes>, TransportError> {
        if header.is_heartbeat() {
            return Err(TransportError::Framing(
                "heartbeat frame handed to the assembler".to_string(),
            ));
        }
        if payload.len() != header.payload_len as usize {
            return Err(TransportError::Framing(format!(
                "chunk payload length {} does not match declared length {}",
                payload.len(),
                header.payload_len
            )));
        }

        let partial = self
            .in_progress
            .entry(header.message_seq)
            .or_insert_with(|| PartialMessage {
                chunk_count: header.chunk_count,
                arrived: 0,
                acc: BytesMut::new(),
            });

        if header.chunk_count != partial.chunk_count {
            let previous = partial.chunk_count;
            self.in_progress.remove(&header.message_seq);
            return Err(TransportError::Framing(format!(
                "chunk count changed mid-message: declared {}, previously {}",
                header.chunk_count, previous
            )));
        }
        if header.chunk_index != partial.arrived {
            let expected = partial.arrived;
            self.in_progress.remove(&header.message_seq);
            return Err(TransportError::Framing(format!(
                "chunk {} of message {} arrived out of order (expected {})",
                header.chunk_index, header.message_seq, expected
            )));
        }

        partial.arrived += 1;
        partial.acc.put_slice(&payload);

        if partial.arrived == partial.chunk_count {
            let complete = match self.in_progress.remove(&header.message_seq) {
                Some(partial) => partial.acc,
                None => return Ok(None), // unreachable, entry was just updated
            };
            trace!("message {} complete ({} bytes)", header.message_seq, complete.len());
            Ok(Some(complete.freeze()))
        } else {
            Ok(None)
        }
    }
}

/// Reads one chunk frame off an ordered stream.
///
/// EOF at a frame boundary is a regular close; EOF or a length lie mid-frame is a framing
///  error - the connection is corrupted and reconnect handling takes over.
pub async fn read_chunk(
    stream: &mut (impl AsyncRead + Unpin),
    max_chunk_payload: usize,
) -> Result<(ChunkHeader, Bytes), TransportError> {
    let mut header_buf = [0u8; ChunkHeader::SERIALIZED_LEN];
    match stream.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed)
        }
        Err(e) => return Err(TransportError::Socket(e)),
    }

    let header = ChunkHeader::deser(&mut &header_buf[..])
        .map_err(|e| TransportError::Framing(e.to_string()))?;

    if header.payload_len as usize > max_chunk_payload {
        return Err(TransportError::Framing(format!(
            "declared payload length {} exceeds the maximum of {}",
            header.payload_len, max_chunk_payload
        )));
    }
    if !header.is_heartbeat() && header.chunk_index >= header.chunk_count {
        return Err(TransportError::Framing(format!(
            "chunk index {} out of range for chunk count {}",
            header.chunk_index, header.chunk_count
        )));
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    match stream.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Framing(
                "stream ended inside a chunk payload".to_string(),
            ))
        }
        Err(e) => return Err(TransportError::Socket(e)),
    }

    Ok((header, Bytes::from(payload)))
}
