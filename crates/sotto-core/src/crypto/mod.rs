//! Cryptographic primitives for sotto.
//!
//! - **X25519**: ephemeral Diffie-Hellman key agreement per connection
//! - **AES-256-GCM**: authenticated encryption of every framed payload
//! - **SHA-256**: short key fingerprints for out-of-band comparison
//!
//! No custom constructions; the shared secret from the curve is used
//! directly as the 256-bit AEAD key for the lifetime of the connection.

pub mod aead;
mod keys;

pub use keys::{fingerprint, EphemeralKeypair, PublicKey, SharedSecret, PUBLIC_KEY_SIZE};

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}
