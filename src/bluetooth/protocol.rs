// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chat message definitions and wire serialization.
//!
//! One message travels per socket write. There is no length prefix and no
//! checksum; the receiving side treats the bytes of a single read as one
//! complete frame.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between sender name and body in the delimited format.
pub const DELIMITER: char = '#';

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender_name: String,
    pub body: String,
    /// True for messages authored on this side. Never transmitted.
    pub origin_local: bool,
}

impl ChatMessage {
    /// Create a message authored locally.
    pub fn local(sender_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender_name: sender_name.into(),
            body: body.into(),
            origin_local: true,
        }
    }

    /// Create a message received from the peer.
    pub fn remote(sender_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender_name: sender_name.into(),
            body: body.into(),
            origin_local: false,
        }
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("frame length {length} exceeds buffer of {available} bytes")]
    LengthOutOfBounds { length: usize, available: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Encoding used on the wire. Both peers must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// `senderName#body`, split on the first delimiter.
    #[default]
    Delimited,
    /// `{"message": .., "senderName": .., "isFromLocalUser": false}`.
    Json,
}

/// JSON frame layout. `isFromLocalUser` is always sent as false and ignored
/// on receipt.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonFrame {
    message: String,
    sender_name: String,
    #[serde(default)]
    is_from_local_user: bool,
}

impl WireFormat {
    /// Serialize a message into a single frame.
    pub fn encode(&self, message: &ChatMessage) -> Vec<u8> {
        match self {
            Self::Delimited => {
                format!("{}{}{}", message.sender_name, DELIMITER, message.body).into_bytes()
            }
            Self::Json => {
                let frame = JsonFrame {
                    message: message.body.clone(),
                    sender_name: message.sender_name.clone(),
                    is_from_local_user: false,
                };
                // Plain strings and a bool always serialize.
                serde_json::to_vec(&frame).unwrap_or_default()
            }
        }
    }

    /// Decode the first `length` bytes of `bytes` as one frame.
    ///
    /// The result is always marked as remote-origin. Delimited frames replace
    /// invalid UTF-8 sequences, so a read that ends inside a character still
    /// yields a message.
    pub fn decode(&self, bytes: &[u8], length: usize) -> Result<ChatMessage, CodecError> {
        if length > bytes.len() {
            return Err(CodecError::LengthOutOfBounds {
                length,
                available: bytes.len(),
            });
        }

        let frame = &bytes[..length];
        match self {
            Self::Delimited => {
                let text = String::from_utf8_lossy(frame);
                Ok(match text.split_once(DELIMITER) {
                    Some((sender, body)) => ChatMessage::remote(sender, body),
                    // No delimiter: the whole frame is the body.
                    None => ChatMessage::remote("", &*text),
                })
            }
            Self::Json => {
                let text = std::str::from_utf8(frame)
                    .map_err(|e| CodecError::InvalidUtf8(e.to_string()))?;
                let frame: JsonFrame = serde_json::from_str(text.trim())
                    .map_err(|e| CodecError::Malformed(e.to_string()))?;
                Ok(ChatMessage::remote(frame.sender_name, frame.message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delimited_encoding() {
        let msg = ChatMessage::local("Pixel 7", "Hello, World!");
        let bytes = WireFormat::Delimited.encode(&msg);
        assert_eq!(bytes, b"Pixel 7#Hello, World!");

        let parsed = WireFormat::Delimited.decode(&bytes, bytes.len()).unwrap();
        assert_eq!(parsed.sender_name, "Pixel 7");
        assert_eq!(parsed.body, "Hello, World!");
        assert!(!parsed.origin_local);
    }

    #[test]
    fn test_delimited_splits_on_first_delimiter() {
        let parsed = WireFormat::Delimited
            .decode(b"alice#issue #42 is fixed", 24)
            .unwrap();
        assert_eq!(parsed.sender_name, "alice");
        assert_eq!(parsed.body, "issue #42 is fixed");
    }

    #[test]
    fn test_delimited_without_delimiter() {
        let parsed = WireFormat::Delimited.decode(b"just text", 9).unwrap();
        assert_eq!(parsed.sender_name, "");
        assert_eq!(parsed.body, "just text");
    }

    #[test]
    fn test_decode_uses_only_length_bytes() {
        let mut buffer = [0u8; 1024];
        buffer[..7].copy_from_slice(b"bob#hey");
        let parsed = WireFormat::Delimited.decode(&buffer, 7).unwrap();
        assert_eq!(parsed.body, "hey");
    }

    #[test]
    fn test_decode_length_out_of_bounds() {
        let err = WireFormat::Delimited.decode(b"abc", 10).unwrap_err();
        assert_eq!(
            err,
            CodecError::LengthOutOfBounds {
                length: 10,
                available: 3
            }
        );
    }

    #[test]
    fn test_delimited_replaces_invalid_utf8() {
        // "é" is 0xc3 0xa9; the frame ends after its first byte.
        let parsed = WireFormat::Delimited.decode(b"bob#caf\xc3", 8).unwrap();
        assert_eq!(parsed.sender_name, "bob");
        assert_eq!(parsed.body, "caf\u{fffd}");

        let parsed = WireFormat::Delimited.decode(&[0xa9, b'!'], 2).unwrap();
        assert_eq!(parsed.body, "\u{fffd}!");
    }

    #[test]
    fn test_json_decode_invalid_utf8() {
        let err = WireFormat::Json.decode(&[0xff, 0xfe], 2).unwrap_err();
        assert!(matches!(err, CodecError::InvalidUtf8(_)));
    }

    #[test]
    fn test_json_encoding_sends_remote_origin() {
        let msg = ChatMessage::local("Pixel 7", "hi");
        let json: serde_json::Value = serde_json::from_slice(&WireFormat::Json.encode(&msg)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"message": "hi", "senderName": "Pixel 7", "isFromLocalUser": false})
        );
    }

    #[test]
    fn test_json_decode_without_origin_field() {
        let json = br#"{"message":"hi","senderName":"Pixel 7"}"#;
        let parsed = WireFormat::Json.decode(json, json.len()).unwrap();
        assert_eq!(parsed, ChatMessage::remote("Pixel 7", "hi"));
    }

    #[test]
    fn test_json_decode_forces_remote() {
        let json = br#"{"message":"hi","senderName":"Pixel 7","isFromLocalUser":true}"#;
        let parsed = WireFormat::Json.decode(json, json.len()).unwrap();
        assert_eq!(parsed, ChatMessage::remote("Pixel 7", "hi"));
    }

    #[test]
    fn test_json_decode_malformed() {
        let err = WireFormat::Json.decode(b"not json", 8).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_wire_format_config_names() {
        let format: WireFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, WireFormat::Json);
        assert_eq!(WireFormat::default(), WireFormat::Delimited);
    }

    proptest! {
        #[test]
        fn prop_delimited_round_trip(
            sender in "[^#]{0,16}",
            body in ".{0,64}",
            origin_local in any::<bool>(),
        ) {
            let msg = ChatMessage { sender_name: sender.clone(), body: body.clone(), origin_local };
            let bytes = WireFormat::Delimited.encode(&msg);
            let parsed = WireFormat::Delimited.decode(&bytes, bytes.len()).unwrap();
            prop_assert_eq!(parsed, ChatMessage::remote(sender, body));
        }

        #[test]
        fn prop_json_round_trip(
            sender in ".{0,16}",
            body in ".{0,64}",
            origin_local in any::<bool>(),
        ) {
            let msg = ChatMessage { sender_name: sender.clone(), body: body.clone(), origin_local };
            let bytes = WireFormat::Json.encode(&msg);
            let parsed = WireFormat::Json.decode(&bytes, bytes.len()).unwrap();
            prop_assert_eq!(parsed, ChatMessage::remote(sender, body));
        }
    }
}
