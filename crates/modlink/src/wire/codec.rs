//! Length-prefixed framing for the byte-stream transport.
//!
//! Each frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes. Frames are handed up unparsed so a malformed message never
//! poisons the stream.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames above this size are rejected while decoding.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Codec yielding raw frame payloads.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => {
                tracing::trace!(frame_size_bytes = frame.len(), "Decoded frame");
                Ok(Some(frame.freeze()))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(frame_size_bytes = item.len(), "Encoding frame");
        self.inner.encode(item, dst)
    }
}
