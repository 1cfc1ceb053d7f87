use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a logical key.
///
/// Used to derive filesystem-safe checkpoint slot names. The mapping is
/// one-way; colliding keys share a slot.
pub(crate) fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
