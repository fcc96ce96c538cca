//! Binary codecs for CRDT update payloads.
//!
//! Two text encodings are in play:
//!
//! ```text
//! ┌──────────────┐  bytes_to_text   ┌─────────────────────┐
//! │ raw update   │ ───────────────► │ base64 (transport,  │
//! │ bytes        │ ◄─────────────── │ local queue rows)   │
//! │              │  text_to_bytes   └─────────────────────┘
//! │              │  bytes_to_hex    ┌─────────────────────┐
//! │              │ ───────────────► │ "\x" + hex (storage │
//! │              │ ◄─────────────── │ byte literals)      │
//! └──────────────┘  hex_to_bytes    └─────────────────────┘
//! ```
//!
//! All functions are pure and round-trip exactly, including empty input.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Prefix of a hex-escaped byte literal.
pub const HEX_ESCAPE: &str = "\\x";

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
    #[error("invalid hex payload: {0}")]
    InvalidHex(String),
}

/// Encode raw bytes as base64 text.
pub fn bytes_to_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode base64 text back into raw bytes.
pub fn text_to_bytes(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(text)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}

/// Encode raw bytes as a `\x`-prefixed lowercase hex literal.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(HEX_ESCAPE.len() + bytes.len() * 2);
    out.push_str(HEX_ESCAPE);
    out.push_str(&hex::encode(bytes));
    out
}

/// Decode a hex literal, with or without the leading `\x`.
pub fn hex_to_bytes(literal: &str) -> Result<Vec<u8>, CodecError> {
    let digits = literal.strip_prefix(HEX_ESCAPE).unwrap_or(literal);
    hex::decode(digits).map_err(|e| CodecError::InvalidHex(e.to_string()))
}

/// Re-encode base64 text as a hex literal.
pub fn text_to_hex(text: &str) -> Result<String, CodecError> {
    text_to_bytes(text).map(|bytes| bytes_to_hex(&bytes))
}

/// Decode a payload that arrived either as a hex literal or as base64.
///
/// Anything starting with `\x` is treated as hex; everything else as base64.
pub fn decode_stored(value: &str) -> Result<Vec<u8>, CodecError> {
    if value.starts_with(HEX_ESCAPE) {
        hex_to_bytes(value)
    } else {
        text_to_bytes(value)
    }
}
