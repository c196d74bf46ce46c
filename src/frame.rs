//! Length-prefixed framing.
//!
//! Wire format: `[4-byte big-endian length][length bytes of payload]`.
//!
//! `FrameCodec` only deals with the prefix. `MessageCodec` layers the
//! configured compressor on top: the payload is compressed before framing on
//! the way out, and uncompressed only once a whole frame has arrived on the
//! way in.

use crate::compress::Compressor;
use crate::error::{ChannelError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Encoder/decoder for length-prefixed frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Prepend the length prefix to `payload`.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.encode_into(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Append one frame carrying `payload` to `dst`.
    pub fn encode_into(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        self.check_len(payload.len())?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }

    /// Extract one complete frame payload from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when the frame is not
    /// complete yet. An oversized declared length is rejected as soon as the
    /// prefix is visible, before any payload is buffered.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let Some(len) = self.peek_len(src)? else {
            return Ok(None);
        };

        let total = HEADER_LEN + len;
        if src.len() < total {
            // Make room for the rest of the frame in one go.
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }

    /// Progress of the frame currently in assembly: `(expected, received)`
    /// payload bytes, or `None` if not even the prefix has arrived.
    pub fn assembly(&self, src: &[u8]) -> Option<(usize, usize)> {
        if src.len() < HEADER_LEN {
            return None;
        }
        let len = read_len(src);
        Some((len, (src.len() - HEADER_LEN).min(len)))
    }

    fn peek_len(&self, src: &[u8]) -> Result<Option<usize>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = read_len(src);
        self.check_len(len)?;
        Ok(Some(len))
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.max_frame_size {
            return Err(ChannelError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

fn read_len(src: &[u8]) -> usize {
    u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize
}

/// Framing plus the optional payload compressor.
#[derive(Clone)]
pub struct MessageCodec {
    frames: FrameCodec,
    compressor: Option<Arc<dyn Compressor>>,
}

impl MessageCodec {
    pub fn new(frames: FrameCodec, compressor: Option<Arc<dyn Compressor>>) -> Self {
        Self { frames, compressor }
    }

    pub fn frames(&self) -> &FrameCodec {
        &self.frames
    }

    /// Compress (if configured) and frame an application buffer.
    ///
    /// With a compressor the uncompressed length is bounded too, since the
    /// receiver refuses to inflate past `max_frame_size`.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        match &self.compressor {
            Some(c) => {
                self.frames.check_len(payload.len())?;
                self.frames.encode(&c.compress(payload)?)
            }
            None => self.frames.encode(payload),
        }
    }

    /// Pull one whole frame out of `src` and uncompress it.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let Some(payload) = self.frames.decode(src)? else {
            return Ok(None);
        };
        match &self.compressor {
            Some(c) => Ok(Some(Bytes::from(c.uncompress(&payload)?))),
            None => Ok(Some(payload)),
        }
    }
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("max_frame_size", &self.frames.max_frame_size)
            .field("compressor", &self.compressor.as_ref().map(|c| c.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::ZstdCompressor;
    use proptest::prelude::*;

    #[test]
    fn test_encode_wire_format() {
        let codec = FrameCodec::new(1024);
        let frame = codec.encode(&[0, 0, 0, 7, 0, 0, 0, 7]).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 8]);
        assert_eq!(&frame[4..], &[0, 0, 0, 7, 0, 0, 0, 7]);
    }

    #[test]
    fn test_incomplete_leaves_buffer_untouched() {
        let codec = FrameCodec::new(1024);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, b'h', b'e'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &[0, 0, 0, 5, b'h', b'e']);
        assert_eq!(codec.assembly(&buf), Some((5, 2)));

        buf.extend_from_slice(b"llo");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_coalesced_frames() {
        let codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode_into(b"one", &mut buf).unwrap();
        codec.encode_into(b"", &mut buf).unwrap();
        codec.encode_into(b"three", &mut buf).unwrap();
        buf.extend_from_slice(&[0, 0]); // start of a fourth prefix

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"three");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_frame_too_large() {
        let codec = FrameCodec::new(4);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ChannelError::FrameTooLarge { len: 5, max: 4 })
        ));
        assert!(matches!(
            codec.encode(b"12345"),
            Err(ChannelError::FrameTooLarge { .. })
        ));
        assert!(codec.encode(b"1234").is_ok());
    }

    #[test]
    fn test_split_at_every_boundary() {
        let codec = FrameCodec::new(1024);
        let payload: Vec<u8> = (0..64u8).collect();
        let frame = codec.encode(&payload).unwrap();

        for split in 0..=frame.len() {
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for part in [&frame[..split], &frame[split..]] {
                buf.extend_from_slice(part);
                while let Some(p) = codec.decode(&mut buf).unwrap() {
                    decoded.push(p);
                }
            }
            assert_eq!(decoded.len(), 1, "split at {split}");
            assert_eq!(&decoded[0][..], &payload[..]);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_message_codec_with_compressor() {
        let codec = MessageCodec::new(
            FrameCodec::new(1 << 20),
            Some(Arc::new(ZstdCompressor::new(3, 1 << 20))),
        );
        let payload = vec![42u8; 4096];
        let frame = codec.encode(&payload).unwrap();
        // prefix reflects the compressed size, not the original
        assert_eq!(read_len(&frame), frame.len() - HEADER_LEN);
        assert!(frame.len() < payload.len());

        let mut buf = BytesMut::from(&frame[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], &payload[..]);
    }

    #[test]
    fn test_compressible_payload_over_limit_rejected() {
        let codec = MessageCodec::new(
            FrameCodec::new(1024),
            Some(Arc::new(ZstdCompressor::new(3, 1024))),
        );
        // Compresses to a few bytes but would not inflate on the peer.
        assert!(matches!(
            codec.encode(&[0u8; 4096]),
            Err(ChannelError::FrameTooLarge { len: 4096, max: 1024 })
        ));

        let frame = codec.encode(&[0u8; 1024]).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), 1024);
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let codec = FrameCodec::new(4096);
            let mut buf = BytesMut::from(&codec.encode(&payload).unwrap()[..]);
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(&decoded[..], &payload[..]);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_chunked_delivery(
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..256),
                1..8,
            ),
            chunk in 1usize..17,
        ) {
            let codec = FrameCodec::new(4096);
            let mut wire = BytesMut::new();
            for p in &payloads {
                codec.encode_into(p, &mut wire).unwrap();
            }

            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for part in wire.chunks(chunk) {
                buf.extend_from_slice(part);
                while let Some(p) = codec.decode(&mut buf).unwrap() {
                    decoded.push(p.to_vec());
                }
            }
            prop_assert_eq!(decoded, payloads);
        }
    }
}
