//! Frame codec: varint message number, flags byte, payload chunk.
//!
//! Frames ride on a length-prefixed byte stream. A message larger than
//! [`MAX_FRAME_PAYLOAD`] is split across frames carrying `MoreComing`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// Largest payload chunk carried by one frame.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Upper bound on a whole frame, for sanity checking inbound lengths.
const MAX_FRAME_SIZE: usize = MAX_FRAME_PAYLOAD + 16;

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub number: u64,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Bytes this frame counts against the flow-control window.
    pub fn credit_size(&self) -> u64 {
        self.payload.len() as u64
    }
}

pub(crate) fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn get_varint(data: &mut &[u8]) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = data.split_first()?;
        *data = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

/// Length-prefixed frame codec for `FramedRead`/`FramedWrite`.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let mut header = Vec::with_capacity(12);
        put_varint(&mut header, frame.number);
        header.push(frame.flags);
        let total = header.len() + frame.payload.len();
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::invalid_parameter("frame payload too large"));
        }
        dst.reserve(4 + total);
        dst.put_u32(total as u32);
        dst.put_slice(&header);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::corrupt(format!("oversized frame: {len} bytes")));
        }
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);
        let frame_bytes = src.split_to(len).freeze();
        let mut cursor = &frame_bytes[..];
        let number =
            get_varint(&mut cursor).ok_or_else(|| Error::corrupt("truncated frame header"))?;
        let (&flags, payload) = cursor
            .split_first()
            .ok_or_else(|| Error::corrupt("frame missing flags byte"))?;
        Ok(Some(Frame {
            number,
            flags,
            payload: Bytes::copy_from_slice(payload),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            let mut cursor = &buf[..];
            assert_eq!(get_varint(&mut cursor), Some(value));
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn frame_round_trip() {
        let mut codec = FrameCodec;
        let frame = Frame {
            number: 300,
            flags: 0x29,
            payload: Bytes::from_static(b"hello"),
        };
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        // Partial input yields nothing.
        let mut partial = BytesMut::from(&buf[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 8]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
