//! ChaCha20-Poly1305 AEAD encryption (RFC 8439).
//!
//! Used to protect the join handshake: the guest encrypts its request with
//! the key published in the join URL and the host answers under the same key.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

use crate::{CryptoError, Result};

/// Nonce size for ChaCha20-Poly1305 (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Key size for ChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under `key`/`nonce`, authenticating `aad`.
///
/// Returns the ciphertext with the 16-byte tag appended.
pub fn encrypt(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadDecryption)
}

/// Decrypt and authenticate. Fails if the tag, key, nonce or `aad` differ.
pub fn decrypt(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecryption)
}

/// Encrypt with a fresh random nonce. Returns `(nonce, ciphertext)`.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = encrypt(key, &nonce, plaintext, aad)?;
    Ok((nonce, ciphertext))
}

/// Counterpart of [`seal`].
pub fn open(key: &[u8; KEY_SIZE], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let nonce: [u8; NONCE_SIZE] = nonce.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: NONCE_SIZE,
        actual: nonce.len(),
    })?;
    decrypt(key, &nonce, ciphertext, aad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [0x42u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];

        let ciphertext = encrypt(&key, &nonce, b"join me", b"hash").expect("encrypt");
        assert_eq!(ciphertext.len(), b"join me".len() + TAG_SIZE);
        let decrypted = decrypt(&key, &nonce, &ciphertext, b"hash").expect("decrypt");
        assert_eq!(decrypted, b"join me");
    }

    #[test]
    fn test_seal_uses_fresh_nonces() {
        let key = [0x07u8; KEY_SIZE];
        let (n1, c1) = seal(&key, b"challenge", b"").expect("seal");
        let (n2, c2) = seal(&key, b"challenge", b"").expect("seal");
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
        assert_eq!(open(&key, &n1, &c1, b"").expect("open"), b"challenge");
    }

    #[test]
    fn test_wrong_key_fails() {
        let (nonce, ciphertext) = seal(&[0x01u8; KEY_SIZE], b"test", b"").expect("seal");
        assert!(open(&[0x02u8; KEY_SIZE], &nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [0x01u8; KEY_SIZE];
        let (nonce, ciphertext) = seal(&key, b"test", b"aad1").expect("seal");
        assert!(open(&key, &nonce, &ciphertext, b"aad2").is_err());
    }

    #[test]
    fn test_short_nonce_rejected() {
        let key = [0x01u8; KEY_SIZE];
        let (_, ciphertext) = seal(&key, b"test", b"").expect("seal");
        assert!(matches!(
            open(&key, &[0u8; 4], &ciphertext, b""),
            Err(CryptoError::InvalidKeyLength { expected: NONCE_SIZE, actual: 4 })
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0x01u8; KEY_SIZE];
        let (nonce, mut ciphertext) = seal(&key, b"test", b"").expect("seal");
        if let Some(byte) = ciphertext.first_mut() {
            *byte ^= 0xFF;
        }
        assert!(open(&key, &nonce, &ciphertext, b"").is_err());
    }
}
