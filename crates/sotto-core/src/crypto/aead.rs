//! Authenticated encryption using AES-256-GCM.
//!
//! Every payload travels as a self-contained envelope
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)` under a fresh random
//! nonce, so no counter state is shared between the peers. Random 96-bit
//! nonces are safe up to roughly 2^32 messages per key; connections are
//! short-lived and stay far below that.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

/// Size of the encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Encrypt plaintext, prepending a fresh random nonce.
///
/// Output format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::Decryption)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);

    Ok(output)
}

/// Decrypt an envelope produced by [`seal`].
///
/// Splits the leading nonce, authenticates, and returns the plaintext in a
/// zeroized container. Fails with [`Error::Decryption`] on truncation,
/// tampering, or a wrong key; the cases are indistinguishable to the caller.
pub fn open(key: &[u8; KEY_SIZE], blob: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Decryption);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
    let ciphertext = &blob[NONCE_SIZE..];

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::Decryption)?;

    Ok(Zeroizing::new(plaintext))
}
