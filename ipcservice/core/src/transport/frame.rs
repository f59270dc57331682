//! Frame Protocol
//!
//! Wire format for IPC messages: a fixed 8-byte header followed by the payload.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Code (4)       | Size (4)       | Payload (Size bytes)                     |
//! | little-endian  | little-endian  | opaque                                   |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! There is no checksum; integrity is provided by the local stream socket.
//!
//! # Security
//!
//! - Maximum frame size is enforced to prevent memory exhaustion
//! - Size field is validated before the payload buffer is allocated

use crate::error::{IpcError, IpcResult};
use crate::message::Message;

/// Default maximum payload size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame header size: 4 bytes code + 4 bytes size
pub const HEADER_SIZE: usize = 8;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Encode a code and payload into a single frame
///
/// # Errors
///
/// Returns `IpcError::Protocol` if the payload exceeds `max_size`.
pub fn encode(code: u32, data: &[u8], max_size: usize) -> IpcResult<Vec<u8>> {
    if data.len() > max_size || u32::try_from(data.len()).is_err() {
        return Err(IpcError::Protocol(format!(
            "Frame too large: {} bytes (max: {max_size})",
            data.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let size = data.len() as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
    buf.extend_from_slice(&code.to_le_bytes());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(data);
    Ok(buf)
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete messages. Bytes of a frame that
/// is still incomplete stay buffered until the rest arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    max_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with the default size limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_size(MAX_FRAME_SIZE)
    }

    /// Create a decoder that rejects payloads larger than `max_size`
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            max_size,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Check whether part of a frame is buffered
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.available() > 0
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(msg))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(IpcError::Protocol)` if the size field exceeds the limit
    pub fn decode(&mut self) -> IpcResult<Option<Message>> {
        let available = self.available();

        if available < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let code = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        if size > self.max_size {
            return Err(IpcError::Protocol(format!(
                "Frame size {size} exceeds maximum {}",
                self.max_size
            )));
        }

        if available < HEADER_SIZE + size {
            return Ok(None);
        }

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + size;
        let data = self.buffer[payload_start..payload_end].to_vec();

        self.read_pos = payload_end;
        if self.read_pos == self.buffer.len() {
            self.clear();
        }

        Ok(Some(Message { code, data }))
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode(0x0102_0304, b"abc", MAX_FRAME_SIZE).unwrap();

        assert_eq!(frame.len(), HEADER_SIZE + 3);
        assert_eq!(&frame[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&frame[4..8], &[3, 0, 0, 0]);
        assert_eq!(&frame[8..], b"abc");
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = Message::new(42, "Hello, world!");

        let encoded = encode(msg.code, &msg.data, MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);

        assert_eq!(decoder.decode().unwrap(), Some(msg));
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_empty_payload() {
        let encoded = encode(5, &[], MAX_FRAME_SIZE).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        let msg = decoder.decode().unwrap().unwrap();
        assert_eq!(msg.code, 5);
        assert!(msg.is_empty());
    }

    #[test]
    fn test_decode_partial_header() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[1, 0, 0, 0, 5]);

        assert!(matches!(decoder.decode(), Ok(None)));
        assert!(decoder.has_partial());
    }

    #[test]
    fn test_decode_partial_payload_resumes() {
        let encoded = encode(9, b"partial payload", MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded[..encoded.len() / 2]);
        assert!(matches!(decoder.decode(), Ok(None)));

        decoder.push(&encoded[encoded.len() / 2..]);
        let msg = decoder.decode().unwrap().unwrap();
        assert_eq!(msg.data, b"partial payload");
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let encoded = encode(3, b"drip", MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();

        for (i, byte) in encoded.iter().enumerate() {
            decoder.push(std::slice::from_ref(byte));
            let result = decoder.decode().unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result, Some(Message::new(3, "drip")));
            }
        }
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut encoded = encode(1, b"first", MAX_FRAME_SIZE).unwrap();
        encoded.extend(encode(2, b"second", MAX_FRAME_SIZE).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);

        assert_eq!(decoder.decode().unwrap(), Some(Message::new(1, "first")));
        assert_eq!(decoder.decode().unwrap(), Some(Message::new(2, "second")));
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_encode_too_large() {
        let result = encode(1, &[0u8; 17], 16);
        assert!(matches!(result, Err(IpcError::Protocol(_))));
    }

    #[test]
    fn test_decode_frame_too_large() {
        let mut decoder = FrameDecoder::with_max_size(1024);

        decoder.push(&7u32.to_le_bytes());
        decoder.push(&u32::MAX.to_le_bytes());

        assert!(matches!(decoder.decode(), Err(IpcError::Protocol(_))));
    }

    #[test]
    fn test_compaction_keeps_pending_bytes() {
        let mut decoder = FrameDecoder::new();
        let big = vec![7u8; MIN_BUFFER_CAPACITY * 2];
        let frame = encode(1, &big, MAX_FRAME_SIZE).unwrap();
        let tail = encode(2, b"tail", MAX_FRAME_SIZE).unwrap();

        decoder.push(&frame);
        decoder.push(&tail[..3]);
        assert_eq!(decoder.decode().unwrap().unwrap().data.len(), big.len());

        decoder.push(&tail[3..]);
        assert_eq!(decoder.decode().unwrap(), Some(Message::new(2, "tail")));
    }
}
