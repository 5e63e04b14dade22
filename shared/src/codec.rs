//! Length-prefixed codec for TCP framing
//!
//! Stream messages are framed as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: protobuf message ]
//! ```
//!
//! Broker bodies are discrete, so they use the unframed `encode_message` /
//! `decode_message` pair instead.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

/// Upper bound for a single message body (10 MB)
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    MessageTooLarge(usize),

    #[error("frame length prefix {0} exceeds the message limit")]
    InvalidLength(u32),

    #[error("malformed message: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("failed to encode message: {0}")]
    EncodeError(#[from] prost::EncodeError),
}

fn check_size(len: usize) -> Result<(), CodecError> {
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(CodecError::MessageTooLarge(len));
    }
    Ok(())
}

/// Encode a broker body (no length prefix)
pub fn encode_message<M: Message>(message: &M) -> Result<Bytes, CodecError> {
    check_size(message.encoded_len())?;
    Ok(Bytes::from(message.encode_to_vec()))
}

/// Decode a broker body produced by `encode_message`
pub fn decode_message<M: Message + Default>(bytes: &[u8]) -> Result<M, CodecError> {
    check_size(bytes.len())?;
    Ok(M::decode(bytes)?)
}

/// Encode a message as one length-prefixed stream frame
pub fn encode<M: Message>(message: &M) -> Result<Bytes, CodecError> {
    let body_len = message.encoded_len();
    check_size(body_len)?;

    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    message.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Take one complete frame off the front of `buf`
///
/// `Ok(None)` means the frame is incomplete and `buf` is left untouched.
pub fn decode<M: Message + Default>(buf: &mut BytesMut) -> Result<Option<M>, CodecError> {
    let Some(prefix) = buf.get(..4) else {
        return Ok(None);
    };
    let body_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if body_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::InvalidLength(body_len));
    }

    let body_len = body_len as usize;
    if buf.len() < 4 + body_len {
        return Ok(None);
    }

    buf.advance(4);
    let body = buf.split_to(body_len).freeze();
    Ok(Some(M::decode(body)?))
}

/// Reassembles frames from arbitrary read chunks
#[derive(Debug)]
pub struct FrameDecoder<M> {
    buffer: BytesMut,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message + Default> FrameDecoder<M> {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            _message: PhantomData,
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame, if any; call until `Ok(None)` after each `extend`
    pub fn decode_next(&mut self) -> Result<Option<M>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Bytes buffered but not yet decoded
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

impl<M: Message + Default> Default for FrameDecoder<M> {
    fn default() -> Self {
        Self::new()
    }
}
