//! IPC Message
//!
//! The atomic transport unit: a numeric code and an opaque payload. The
//! payload length is the message size, so the two can never disagree.

use std::fmt;

/// Number of payload bytes shown by the [`Display`](fmt::Display) impl
const FORMAT_DATA_LIMIT: usize = 4096;

/// A single IPC message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Application-defined message code
    pub code: u32,
    /// Message payload
    pub data: Vec<u8>,
}

impl Message {
    /// Create a message from a code and payload
    #[must_use]
    pub fn new(code: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }

    /// Create a message with an empty payload
    #[must_use]
    pub fn empty(code: u32) -> Self {
        Self {
            code,
            data: Vec::new(),
        }
    }

    /// Payload size in bytes
    ///
    /// Frames never carry more than `u32::MAX` bytes, so the cast is lossless
    /// for any message that came off the wire or passed the encoder.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Check whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Payload as UTF-8 text, without a trailing NUL terminator if one is present
    ///
    /// Returns `None` if the payload is not valid UTF-8.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        let data = self.data.strip_suffix(&[0]).unwrap_or(&self.data);
        std::str::from_utf8(data).ok()
    }

    /// Consume the message and return its payload
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Formats as `code:<code> size:<size> data:<hex bytes>`
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code:{} size:{} data:", self.code, self.size())?;
        for (i, byte) in self.data.iter().take(FORMAT_DATA_LIMIT).enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        if self.data.len() > FORMAT_DATA_LIMIT {
            write!(f, " ...")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_tracks_payload() {
        let msg = Message::new(7, "hello");
        assert_eq!(msg.size(), 5);
        assert!(!msg.is_empty());

        let empty = Message::empty(9);
        assert_eq!(empty.size(), 0);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_text_strips_nul_terminator() {
        let msg = Message::new(1, b"sync-pong\0".to_vec());
        assert_eq!(msg.text(), Some("sync-pong"));

        let raw = Message::new(1, vec![0xff, 0xfe]);
        assert_eq!(raw.text(), None);
    }

    #[test]
    fn test_display_format() {
        let msg = Message::new(101, vec![0x61, 0x0a, 0xff]);
        assert_eq!(msg.to_string(), "code:101 size:3 data:61 0a ff");

        assert_eq!(Message::empty(3).to_string(), "code:3 size:0 data:");
    }

    #[test]
    fn test_display_truncates_long_payload() {
        let msg = Message::new(1, vec![0u8; FORMAT_DATA_LIMIT + 10]);
        assert!(msg.to_string().ends_with(" ..."));
    }
}
