//! Chunk framing for the control channel.
//!
//! Every outbound message is framed, even when it fits in a single chunk,
//! so the receiver never has to assume the underlying channel preserves
//! message boundaries across intermediaries.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const FRAME_VERSION: u8 = 0xA7;
/// Payload bytes carried per chunk.
pub const CHUNK_BYTES: usize = 8192;
/// Hard cap on a whole serialized message. Anything larger is rejected
/// before splitting, never truncated.
pub const MAX_MESSAGE_BYTES: usize = 65536;

// version + msg_id(u64) + seq(u32) + total(u32)
const HEADER_LEN: usize = 1 + 8 + 4 + 4;
const MAX_CHUNKS: usize = MAX_MESSAGE_BYTES.div_ceil(CHUNK_BYTES);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("message exceeds {MAX_MESSAGE_BYTES} bytes: {0}")]
    Oversized(usize),
    #[error("chunk frame malformed: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub msg_id: u64,
    pub seq: u32,
    pub total: u32,
    pub payload: Bytes,
}

/// Split a serialized message into ordered frames. Single-chunk messages
/// still get a frame header.
pub fn split_message(payload: &[u8], msg_id: u64) -> Result<Vec<ChunkFrame>, ChunkError> {
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(ChunkError::Oversized(payload.len()));
    }
    if payload.is_empty() {
        return Ok(vec![ChunkFrame {
            msg_id,
            seq: 0,
            total: 1,
            payload: Bytes::new(),
        }]);
    }

    let total = payload.len().div_ceil(CHUNK_BYTES) as u32;
    let frames = payload
        .chunks(CHUNK_BYTES)
        .enumerate()
        .map(|(seq, chunk)| ChunkFrame {
            msg_id,
            seq: seq as u32,
            total,
            payload: Bytes::copy_from_slice(chunk),
        })
        .collect();
    Ok(frames)
}

pub fn encode_frame(frame: &ChunkFrame) -> Bytes {
    let mut buf = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    buf.push(FRAME_VERSION);
    buf.extend_from_slice(&frame.msg_id.to_be_bytes());
    buf.extend_from_slice(&frame.seq.to_be_bytes());
    buf.extend_from_slice(&frame.total.to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Bytes::from(buf)
}

/// Decode one frame. Returns `Ok(None)` when the bytes do not start with the
/// frame version, so legacy unframed payloads can be handled by the caller.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<ChunkFrame>, ChunkError> {
    if bytes.first().copied() != Some(FRAME_VERSION) {
        return Ok(None);
    }
    if bytes.len() < HEADER_LEN {
        return Err(ChunkError::Malformed("frame shorter than header"));
    }
    let msg_id = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
    let seq = u32::from_be_bytes(bytes[9..13].try_into().unwrap());
    let total = u32::from_be_bytes(bytes[13..17].try_into().unwrap());
    if total == 0 {
        return Err(ChunkError::Malformed("chunk total cannot be zero"));
    }
    if seq >= total {
        return Err(ChunkError::Malformed("chunk seq exceeds total"));
    }
    if total as usize > MAX_CHUNKS {
        return Err(ChunkError::Oversized(total as usize * CHUNK_BYTES));
    }
    let payload = &bytes[HEADER_LEN..];
    if payload.len() > CHUNK_BYTES {
        return Err(ChunkError::Malformed("chunk payload over chunk size"));
    }
    Ok(Some(ChunkFrame {
        msg_id,
        seq,
        total,
        payload: Bytes::copy_from_slice(payload),
    }))
}

#[derive(Debug)]
struct Partial {
    started_at: Instant,
    total: u32,
    received: u32,
    chunks: Vec<Option<Bytes>>,
}

/// Reassembles interleaved chunk frames into complete messages. Partials
/// that stall longer than the ttl are discarded by `gc`.
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<u64, Partial>,
    ttl: Duration,
}

impl Reassembler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            partials: HashMap::new(),
            ttl,
        }
    }

    /// Feed one frame in; returns the complete payload once the last missing
    /// chunk of a message arrives.
    pub fn ingest(&mut self, frame: ChunkFrame, now: Instant) -> Result<Option<Bytes>, ChunkError> {
        if frame.total == 1 {
            if frame.payload.len() > MAX_MESSAGE_BYTES {
                return Err(ChunkError::Oversized(frame.payload.len()));
            }
            return Ok(Some(frame.payload));
        }

        let entry = self.partials.entry(frame.msg_id).or_insert_with(|| Partial {
            started_at: now,
            total: frame.total,
            received: 0,
            chunks: vec![None; frame.total as usize],
        });
        if entry.total != frame.total {
            self.partials.remove(&frame.msg_id);
            return Err(ChunkError::Malformed("chunk total changed mid-message"));
        }
        let slot = &mut entry.chunks[frame.seq as usize];
        if slot.is_none() {
            *slot = Some(frame.payload);
            entry.received += 1;
        }
        if entry.received < entry.total {
            return Ok(None);
        }

        let partial = self.partials.remove(&frame.msg_id).expect("partial exists");
        let mut combined = Vec::new();
        for chunk in partial.chunks {
            let chunk = chunk.ok_or(ChunkError::Malformed("missing chunk at reassembly"))?;
            combined.extend_from_slice(&chunk);
        }
        if combined.len() > MAX_MESSAGE_BYTES {
            return Err(ChunkError::Oversized(combined.len()));
        }
        Ok(Some(Bytes::from(combined)))
    }

    /// Drop partial messages older than the ttl; returns how many were shed.
    pub fn gc(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.partials.len();
        self.partials
            .retain(|_, p| now.saturating_duration_since(p.started_at) <= ttl);
        before - self.partials.len()
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.partials.len()
    }
}
