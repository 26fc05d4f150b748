//! Opaque identifiers
//!
//! File IDs are 16 random bytes and owner IDs are 32-byte HMAC digests, both
//! base64url without padding. Anything arriving in a URL path is checked
//! against these shapes before it is ever joined onto a filesystem path.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Random bytes behind a file ID
pub const FILE_ID_BYTES: usize = 16;

/// Digest bytes behind an owner ID
pub const OWNER_ID_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("invalid format")]
    InvalidFormat,

    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Generate a new file ID from secure randomness
pub fn new_file_id() -> String {
    let bytes: [u8; FILE_ID_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Check that a string is a well formed file ID
pub fn validate_file_id(id: &str) -> Result<(), IdError> {
    validate(id, FILE_ID_BYTES)
}

/// Check that a string is a well formed owner ID
pub fn validate_owner_id(id: &str) -> Result<(), IdError> {
    validate(id, OWNER_ID_BYTES)
}

fn validate(id: &str, expected: usize) -> Result<(), IdError> {
    let decoded = URL_SAFE_NO_PAD
        .decode(id)
        .map_err(|_| IdError::InvalidFormat)?;

    if decoded.len() != expected {
        return Err(IdError::InvalidLength {
            expected,
            actual: decoded.len(),
        });
    }

    Ok(())
}
