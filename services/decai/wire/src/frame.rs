//! Length-prefixed framing for the wire protocol.
//!
//! Every payload travels as `uvarint(len) ++ payload`. The length prefix is
//! unsigned LEB128, so small frames cost a single prefix byte while large
//! proofs and SRS blobs still fit.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

/// Maximum frame size accepted by a receiver (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Longest valid LEB128 encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Protocol identifier negotiated when a stream to a peer is opened
pub const DEFAULT_PROTOCOL_ID: &str = "/decai/inference/1.0.0";

/// Append `value` to `buf` as an unsigned LEB128 varint
pub fn write_uvarint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Read an unsigned LEB128 varint from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the varint does, otherwise the
/// decoded value and the number of prefix bytes it occupied.
pub fn read_uvarint(buf: &[u8]) -> Result<Option<(u64, usize)>, WireError> {
    let mut value: u64 = 0;

    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        let bits = (byte & 0x7F) as u64;

        // The tenth byte may only contribute the top bit of a u64
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(WireError::MalformedFrame);
        }

        value |= bits << (7 * i);

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if buf.len() >= MAX_VARINT_LEN {
        return Err(WireError::MalformedFrame);
    }

    Ok(None)
}

/// Prefix `payload` with its varint length
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Bytes, WireError> {
    if payload.len() > max_frame_size {
        return Err(WireError::FrameTooLarge {
            len: payload.len() as u64,
            max: max_frame_size,
        });
    }

    let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN + payload.len());
    write_uvarint(&mut buf, payload.len() as u64);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder enforcing [`MAX_FRAME_SIZE`]
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a tighter bound; values above [`MAX_FRAME_SIZE`] are clamped
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    /// The bound this decoder enforces
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Decode one frame payload from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. An oversized
    /// declared length fails before any payload bytes are buffered.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        let (len, prefix_len) = match read_uvarint(buf)? {
            Some(prefix) => prefix,
            None => return Ok(None),
        };

        if len > self.max_frame_size as u64 {
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        let len = len as usize;
        if buf.len() < prefix_len + len {
            return Ok(None);
        }

        buf.advance(prefix_len);
        Ok(Some(buf.split_to(len).freeze()))
    }

    /// Decode after the source reported end of stream.
    ///
    /// Leftover bytes that do not form a whole frame are a truncation error.
    pub fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(WireError::TruncatedFrame(buf.len())),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
