//! Wire framing for tunnelled datagrams.
//!
//! Every datagram carried over a link is wrapped in an 8-byte header. All
//! multi-byte fields are little-endian.
//!
//! ```text
//! offset  size  field
//! 0       1     magic (0xA1)
//! 1       2     payload length
//! 3       2     connection id
//! 5       2     packet id
//! 7       1     CRC-8/MAXIM over bytes 0..7
//! 8       N     payload
//! ```
//!
//! Frames may be concatenated (TCP streams) or carried one per datagram (UDP).
//! [`decode_batch`] scans a region for consecutive frames and resynchronises on
//! the next magic byte after a corrupted or truncated frame. [`decode_stream`]
//! is the TCP variant: a valid header whose payload hasn't fully arrived is
//! left as trailing bytes for the next read.

use crate::buffer::{BufferHandle, BufferPool, PackedBuffer};
use crc::{Crc, CRC_8_MAXIM_DOW};
use std::ops::Range;
use std::sync::atomic::{AtomicU16, Ordering};

/// First byte of every frame.
pub const MAGIC: u8 = 0xA1;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest payload the length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);

/// Framing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short: need {needed} bytes, have {available}")]
    TooShort { needed: usize, available: usize },

    #[error("bad magic byte: 0x{0:02X} (expected 0x{:02X})", MAGIC)]
    BadMagic(u8),

    #[error("bad header checksum: got 0x{actual:02X}, computed 0x{expected:02X}")]
    BadChecksum { expected: u8, actual: u8 },
}

/// One tunnelled datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Logical client session the datagram belongs to
    pub conn_id: u16,
    /// Per-sender wrapping counter used for duplicate detection
    pub packet_id: u16,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn new(conn_id: u16, packet_id: u16, payload: &'a [u8]) -> Self {
        Self {
            conn_id,
            packet_id,
            payload,
        }
    }

    /// Size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode `packet` into the start of `dst` and return the frame length.
///
/// The caller guarantees `dst` holds at least [`Packet::encoded_len`] bytes and
/// that the payload fits the 16-bit length field.
pub fn encode(packet: &Packet<'_>, dst: &mut [u8]) -> usize {
    debug_assert!(packet.payload.len() <= MAX_PAYLOAD, "payload exceeds length field");
    let len = packet.encoded_len();
    dst[0] = MAGIC;
    dst[1..3].copy_from_slice(&(packet.payload.len() as u16).to_le_bytes());
    dst[3..5].copy_from_slice(&packet.conn_id.to_le_bytes());
    dst[5..7].copy_from_slice(&packet.packet_id.to_le_bytes());
    dst[7] = CRC8.checksum(&dst[..7]);
    dst[HEADER_SIZE..len].copy_from_slice(packet.payload);
    len
}

/// Decode the frame at the start of `buf`.
///
/// Returns the packet (borrowing its payload from `buf`) and the number of
/// bytes the frame occupies.
pub fn decode(buf: &[u8]) -> Result<(Packet<'_>, usize), ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::TooShort {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    }
    if buf[0] != MAGIC {
        return Err(ProtocolError::BadMagic(buf[0]));
    }
    let expected = CRC8.checksum(&buf[..7]);
    if buf[7] != expected {
        return Err(ProtocolError::BadChecksum {
            expected,
            actual: buf[7],
        });
    }

    let payload_len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    let frame_len = HEADER_SIZE + payload_len;
    if buf.len() < frame_len {
        return Err(ProtocolError::TooShort {
            needed: frame_len,
            available: buf.len(),
        });
    }

    let packet = Packet {
        conn_id: u16::from_le_bytes([buf[3], buf[4]]),
        packet_id: u16::from_le_bytes([buf[5], buf[6]]),
        payload: &buf[HEADER_SIZE..frame_len],
    };
    Ok((packet, frame_len))
}

/// Location of a decoded frame inside the region it was scanned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    pub conn_id: u16,
    pub packet_id: u16,
    /// Offset of the payload (just past the header)
    pub offset: usize,
    /// Payload length
    pub len: usize,
}

impl FrameRef {
    pub fn payload_range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    /// Range of the whole frame, header included.
    pub fn frame_range(&self) -> Range<usize> {
        self.offset - HEADER_SIZE..self.offset + self.len
    }

    pub fn payload<'a>(&self, region: &'a [u8]) -> &'a [u8] {
        &region[self.payload_range()]
    }
}

/// Scan `buf` for consecutive frames.
///
/// A bad magic byte, bad checksum or a frame whose declared length runs past
/// the end of the region skips ahead to the next magic byte; if there is none
/// the rest of the region is discarded. Only a tail shorter than a header is
/// returned as the trailing byte count.
pub fn decode_batch(buf: &[u8]) -> (Vec<FrameRef>, usize) {
    scan(buf, false)
}

/// Like [`decode_batch`], but a checksummed header whose payload is cut off
/// at the end of the region stops the scan and is reported as trailing bytes
/// so the caller can prefix it onto the next read.
pub fn decode_stream(buf: &[u8]) -> (Vec<FrameRef>, usize) {
    scan(buf, true)
}

fn scan(buf: &[u8], stream: bool) -> (Vec<FrameRef>, usize) {
    let mut frames = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        match decode(&buf[pos..]) {
            Ok((packet, used)) => {
                frames.push(FrameRef {
                    conn_id: packet.conn_id,
                    packet_id: packet.packet_id,
                    offset: pos + HEADER_SIZE,
                    len: packet.payload.len(),
                });
                pos += used;
                continue;
            }
            Err(ProtocolError::TooShort { needed, available }) => {
                if available < HEADER_SIZE || stream {
                    return (frames, available);
                }
                tracing::debug!(offset = pos, needed, available, "skipping truncated frame");
            }
            Err(err) => {
                tracing::debug!(offset = pos, "skipping corrupted frame: {err}");
            }
        }
        match next_magic(buf, pos + 1) {
            Some(next) => pos = next,
            None => return (frames, 0),
        }
    }

    (frames, 0)
}

fn next_magic(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == MAGIC)
        .map(|idx| from + idx)
}

/// Append `packet` to `buf` as one more sub-packet.
///
/// Returns `false`, leaving `buf` untouched, if the frame doesn't fit.
pub fn push_frame(buf: &mut PackedBuffer, packet: &Packet<'_>) -> bool {
    if packet.payload.len() > MAX_PAYLOAD || packet.encoded_len() > buf.remaining() {
        return false;
    }
    let len = encode(packet, buf.spare_mut());
    buf.commit(len);
    true
}

/// Wrapping source of packet ids shared by every producer of one sender.
#[derive(Debug, Default)]
pub struct PacketIds(AtomicU16);

impl PacketIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u16) -> Self {
        Self(AtomicU16::new(first))
    }

    /// Next id; wraps from 0xFFFF to 0.
    pub fn next_id(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Wrap every datagram of `datagrams` in a frame for `conn_id`, filling
/// pooled buffers and handing each full one to `emit`.
///
/// Datagrams longer than `max_size` are dropped. Returns how many were.
pub fn pack_datagrams<F>(
    conn_id: u16,
    ids: &PacketIds,
    datagrams: &PackedBuffer,
    max_size: usize,
    pool: &BufferPool,
    mut emit: F,
) -> usize
where
    F: FnMut(BufferHandle),
{
    let mut dropped = 0;
    let mut out = pool.allocate();
    for datagram in datagrams.segments() {
        if datagram.len() > max_size.min(MAX_PAYLOAD) {
            tracing::warn!(conn_id, len = datagram.len(), max_size, "dropping oversized datagram");
            dropped += 1;
            continue;
        }
        let packet = Packet::new(conn_id, ids.next_id(), datagram);
        let fits = out.get_mut().is_some_and(|buf| push_frame(buf, &packet));
        if !fits {
            emit(std::mem::replace(&mut out, pool.allocate()));
            if !out.get_mut().is_some_and(|buf| push_frame(buf, &packet)) {
                dropped += 1;
            }
        }
    }
    if !out.is_empty() {
        emit(out);
    }
    dropped
}
