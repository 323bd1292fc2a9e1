//! Byte encodings used by the AVM REST APIs.
//!
//! Indexer and algod carry binary fields (logs, notes, group ids, signed
//! transactions) as padded standard base64. Transaction ids are the unpadded
//! base32 form of a 32-byte digest.

use fast32::base32::RFC4648_NOPAD as BASE32;
use fast32::base64::RFC4648 as BASE64;

/// Length in bytes of a raw transaction id.
pub const TXID_LEN: usize = 32;

/// Errors produced when decoding API byte fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("invalid base64 encoding")]
    InvalidBase64,
    #[error("invalid base32 encoding")]
    InvalidBase32,
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Encode bytes as padded standard base64.
pub fn b64_encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode padded standard base64.
pub fn b64_decode(text: &str) -> Result<Vec<u8>, EncodingError> {
    BASE64
        .decode_str(text)
        .map_err(|_| EncodingError::InvalidBase64)
}

/// Render a raw 32-byte transaction id in its canonical text form.
pub fn encode_txid(raw: &[u8; TXID_LEN]) -> String {
    BASE32.encode(raw)
}

/// Parse a canonical transaction id back into its raw bytes.
pub fn decode_txid(text: &str) -> Result<[u8; TXID_LEN], EncodingError> {
    let bytes = BASE32
        .decode_str(text)
        .map_err(|_| EncodingError::InvalidBase32)?;
    <[u8; TXID_LEN]>::try_from(bytes.as_slice()).map_err(|_| EncodingError::InvalidLength {
        expected: TXID_LEN,
        actual: bytes.len(),
    })
}
