//! Received notification frames.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One notification payload as it arrived.
///
/// Frames are never mutated after creation. A payload that should have been
/// text but is not valid UTF-8 keeps its bytes, carries a lossy rendering and
/// records the decode error instead of being dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    data: Bytes,
    text: Option<String>,
    decode_error: Option<String>,
    received_at: DateTime<Utc>,
}

impl Frame {
    /// Build a frame stamped with the current time.
    ///
    /// With `as_text` set, the payload is decoded as UTF-8.
    pub fn decode(data: Bytes, as_text: bool) -> Self {
        Self::decode_at(data, as_text, Utc::now())
    }

    /// Build a frame with an explicit receipt time.
    pub fn decode_at(data: Bytes, as_text: bool, received_at: DateTime<Utc>) -> Self {
        let (text, decode_error) = if as_text {
            match std::str::from_utf8(&data) {
                Ok(text) => (Some(text.to_string()), None),
                Err(e) => (
                    Some(String::from_utf8_lossy(&data).into_owned()),
                    Some(e.to_string()),
                ),
            }
        } else {
            (None, None)
        };

        Self {
            data,
            text,
            decode_error,
            received_at,
        }
    }

    /// Raw payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Decoded text, lossy when [`decode_error`](Self::decode_error) is set.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// UTF-8 decode failure, if any.
    pub fn decode_error(&self) -> Option<&str> {
        self.decode_error.as_deref()
    }

    /// Whether text decoding failed.
    pub fn has_decode_error(&self) -> bool {
        self.decode_error.is_some()
    }

    /// Receipt time.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.text, &self.decode_error) {
            (Some(text), None) => write!(f, "{}", text),
            (Some(text), Some(_)) => write!(f, "{} (invalid UTF-8)", text),
            _ => write!(f, "{}", crate::utils::hex_preview(&self.data, self.data.len())),
        }
    }
}
