//! Multipart message codec for stream framing
//!
//! Wire layout of one message:
//!
//! ```text
//! frame_count: u32 BE
//! repeated frame_count times:
//!     len: u32 BE
//!     bytes[len]
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::Multipart;

/// Maximum total message size (64 MB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Maximum number of frames in one message
pub const MAX_FRAMES: usize = 64;

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Too many frames: {count} (max {max})")]
    TooManyFrames { count: usize, max: usize },

    #[error("Message has no frames")]
    EmptyMessage,
}

/// Codec carrying [`Multipart`] messages in both directions
///
/// The same codec serves the client and the host side since both channels
/// exchange the same message shape.
#[derive(Debug, Default)]
pub struct MultipartCodec;

impl MultipartCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MultipartCodec {
    type Item = Multipart;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for the frame count
        if src.len() < 4 {
            return Ok(None);
        }

        let count = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if count == 0 {
            return Err(CodecError::EmptyMessage);
        }
        if count > MAX_FRAMES {
            return Err(CodecError::TooManyFrames {
                count,
                max: MAX_FRAMES,
            });
        }

        // Walk the frame headers without consuming until the whole message is buffered
        let mut offset = 4;
        let mut total = 0usize;
        for _ in 0..count {
            if src.len() < offset + 4 {
                src.reserve(offset + 4 - src.len());
                return Ok(None);
            }
            let len = u32::from_be_bytes([
                src[offset],
                src[offset + 1],
                src[offset + 2],
                src[offset + 3],
            ]) as usize;

            total += len;
            if total > MAX_MESSAGE_SIZE {
                return Err(CodecError::MessageTooLarge {
                    size: total,
                    max: MAX_MESSAGE_SIZE,
                });
            }

            offset += 4 + len;
            if src.len() < offset {
                src.reserve(offset - src.len());
                return Ok(None);
            }
        }

        // Full message available, consume it
        src.advance(4);
        let mut message = Multipart::new();
        for _ in 0..count {
            let len = src.get_u32() as usize;
            message.push(src.split_to(len).freeze());
        }
        Ok(Some(message))
    }
}

impl Encoder<Multipart> for MultipartCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Multipart, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.is_empty() {
            return Err(CodecError::EmptyMessage);
        }
        if item.len() > MAX_FRAMES {
            return Err(CodecError::TooManyFrames {
                count: item.len(),
                max: MAX_FRAMES,
            });
        }
        let size = item.byte_len();
        if size > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }

        dst.reserve(4 + 4 * item.len() + size);
        dst.put_u32(item.len() as u32);
        for frame in item.frames() {
            dst.put_u32(frame.len() as u32);
            dst.put_slice(frame);
        }
        Ok(())
    }
}
