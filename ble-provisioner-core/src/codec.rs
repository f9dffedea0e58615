//! Conversion between protocol text lines and the byte buffers the transport
//! exchanges. Every write is one discrete packet, so no delimiter is added.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("notification is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },
}

/// Encodes one command line as UTF-8 bytes.
pub fn encode(command: &str) -> Vec<u8> {
    command.as_bytes().to_vec()
}

/// Decodes one notification payload.
///
/// Surrounding whitespace is trimmed. A payload that is empty after trimming
/// carries no event and yields `Ok(None)`.
pub fn decode(bytes: &[u8]) -> Result<Option<String>, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|e| CodecError::InvalidUtf8 {
        valid_up_to: e.valid_up_to(),
    })?;

    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(text.to_string()))
}
