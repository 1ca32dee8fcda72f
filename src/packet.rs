//! Wire framing: `{3-byte LE length, 1-byte sequence, payload}`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::protocol::MAX_FRAME_SIZE;

/// A single wire frame. Payloads longer than [`MAX_FRAME_SIZE`] span
/// several frames; joining is done by the connection read path.
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode this frame with its header. The payload must fit a
    /// single frame; use [`encode_frames`] for arbitrary payloads.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_uint_le(self.payload.len() as u64, 3);
        buf.put_u8(self.sequence_id);
        buf.put_slice(&self.payload);
        buf
    }

    /// Try to decode one frame from the front of `buf`. Returns
    /// `Ok(None)` when more bytes are needed. The consumed bytes are
    /// removed from `buf`; the payload is a zero-copy slice of it.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = (buf[0] as usize) | ((buf[1] as usize) << 8) | ((buf[2] as usize) << 16);
        let sequence_id = buf[3];

        if buf.len() < 4 + len {
            return Ok(None);
        }

        buf.advance(4);
        let payload = buf.split_to(len).freeze();

        Ok(Some(Packet {
            sequence_id,
            payload,
        }))
    }
}

/// Frame `payload` into one or more wire packets starting at
/// `*sequence`, advancing the sequence for each frame written.
///
/// A payload of exactly n * MAX_FRAME_SIZE bytes is terminated by an
/// empty frame so the reader knows the packet ended.
pub fn encode_frames(payload: &[u8], sequence: &mut u8) -> BytesMut {
    let mut out = BytesMut::with_capacity(payload.len() + 4);
    let mut rest = payload;

    loop {
        let chunk_len = rest.len().min(MAX_FRAME_SIZE);
        let (chunk, remainder) = rest.split_at(chunk_len);

        out.put_uint_le(chunk_len as u64, 3);
        out.put_u8(*sequence);
        out.put_slice(chunk);
        *sequence = sequence.wrapping_add(1);

        rest = remainder;
        if chunk_len < MAX_FRAME_SIZE {
            break;
        }
        // A maximal frame is always followed by another one, possibly
        // empty, so keep looping even when rest is empty.
    }

    out
}

/// Verify that a received frame carries the expected sequence number.
pub fn check_sequence(packet: &Packet, expected: u8) -> Result<()> {
    if packet.sequence_id != expected {
        return Err(WireError::InvalidPacket(format!(
            "invalid sequence id {} (expected {})",
            packet.sequence_id, expected
        )));
    }
    Ok(())
}
