//! gRPC message framing.
//!
//! Messages on an HTTP/2 stream are length-prefixed:
//! - 1 byte: compressed flag (0 = uncompressed, 1 = compressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload
//!
//! Compression is not supported; a compressed message fails the call with
//! `UNIMPLEMENTED`.

use crate::error::Error;
use crate::status::Status;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the message prefix (1 byte flag + 4 bytes length).
pub const HEADER_SIZE: usize = 5;

/// Maximum message size (4MB default, matches gRPC default).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Prefix a payload for the wire.
pub fn encode_message(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    buf.put_u8(0);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Decode a single message.
///
/// Returns `Ok(Some(payload))` if a complete message was decoded, `Ok(None)`
/// if more data is needed, or the status the call must end with.
pub fn decode_message(buf: &mut BytesMut, max_message_size: usize) -> Result<Option<Bytes>, Error> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    // peek, the prefix is only consumed with a whole message
    let compressed = buf[0];
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

    match compressed {
        0 => {}
        1 => {
            return Err(Status::unimplemented("compressed messages are not supported").into());
        }
        flag => {
            return Err(Error::Protocol(format!("invalid compressed flag: {}", flag)));
        }
    }

    if length > max_message_size {
        return Err(Status::resource_exhausted(format!(
            "message too large: {} bytes (max {})",
            length, max_message_size
        ))
        .into());
    }

    if buf.len() < HEADER_SIZE + length {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    Ok(Some(buf.split_to(length).freeze()))
}

/// Incremental decoder for one stream's DATA payloads.
#[derive(Debug)]
pub struct MessageDecoder {
    buffer: BytesMut,
    max_message_size: usize,
}

impl MessageDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next message.
    pub fn decode(&mut self) -> Result<Option<Bytes>, Error> {
        decode_message(&mut self.buffer, self.max_message_size)
    }

    /// The stream ended. Leftover bytes are a truncated message.
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let leftover = self.buffer.len();
        self.buffer.clear();
        Err(Error::Protocol(format!(
            "stream ended inside a message ({} bytes buffered)",
            leftover
        )))
    }

    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}
