//! Length-prefixed, checksummed framing for `tokio_util::codec::Framed`.
//!
//! The codec only moves opaque envelope bytes; turning them into
//! [`Envelope`](crate::envelope::Envelope)s is the job of
//! [`envelope::decode`](crate::envelope::decode). Any framing error
//! means the stream is out of sync and the connection must be dropped.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::LinkError;
use crate::header::{FrameHeader, HEADER_SIZE};

/// Largest envelope accepted on the wire.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkCodec;

impl Decoder for LinkCodec {
    type Item = Bytes;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::from_bytes(&src[..HEADER_SIZE])?;
        let len = header.payload_length();
        if len > MAX_FRAME_SIZE {
            return Err(LinkError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let frame_len = HEADER_SIZE + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        if !header.verify(&payload) {
            return Err(LinkError::Framing("checksum mismatch"));
        }
        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for LinkCodec {
    type Error = LinkError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(LinkError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let header = FrameHeader::for_payload(&item)?;
        dst.reserve(HEADER_SIZE + item.len());
        dst.extend_from_slice(&header.to_bytes());
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        LinkCodec
            .encode(Bytes::copy_from_slice(payload), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn decodes_complete_frame() {
        let mut buf = framed(b"{\"kind\":\"ping\"}");
        let out = LinkCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&out[..], b"{\"kind\":\"ping\"}");
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_frame() {
        let full = framed(b"abcdef");
        let mut buf = BytesMut::from(&full[..HEADER_SIZE + 2]);
        assert!(LinkCodec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[HEADER_SIZE + 2..]);
        assert_eq!(&LinkCodec.decode(&mut buf).unwrap().unwrap()[..], b"abcdef");
    }

    #[test]
    fn decodes_back_to_back_frames_in_order() {
        let mut buf = framed(b"one");
        buf.extend_from_slice(&framed(b"two"));
        assert_eq!(&LinkCodec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&LinkCodec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(LinkCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_corrupted_payload() {
        let mut buf = framed(b"payload");
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            LinkCodec.decode(&mut buf),
            Err(LinkError::Framing("checksum mismatch"))
        ));
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"ILK1");
        buf.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            LinkCodec.decode(&mut buf),
            Err(LinkError::FrameTooLarge { .. })
        ));

        let too_big = Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]);
        assert!(LinkCodec.encode(too_big, &mut BytesMut::new()).is_err());
    }
}
