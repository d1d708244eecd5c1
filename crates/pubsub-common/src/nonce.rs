//! Random hex tokens for request nonces and OAuth state values.

use rand::rngs::OsRng;
use rand::RngCore;

/// Number of random bytes in a request nonce (hex-encoded to 64 chars).
pub const NONCE_BYTES: usize = 32;

/// Fills `len` bytes from the OS CSPRNG and hex-encodes them.
///
/// # Errors
///
/// Returns an error if the operating system entropy source is unavailable.
pub fn random_hex(len: usize) -> Result<String, rand::Error> {
    let mut buf = vec![0u8; len];
    OsRng.try_fill_bytes(&mut buf)?;
    Ok(hex::encode(buf))
}

/// Generates a fresh request nonce.
///
/// # Errors
///
/// Returns an error if the operating system entropy source is unavailable.
///
/// # Examples
///
/// ```
/// let nonce = pubsub_common::nonce::generate().unwrap();
/// assert_eq!(nonce.len(), 64);
/// ```
pub fn generate() -> Result<String, rand::Error> {
    random_hex(NONCE_BYTES)
}
