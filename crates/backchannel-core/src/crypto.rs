//! Symmetric encryption layer using ChaCha20-Poly1305 AEAD
//!
//! Every channel owns one 32-byte symmetric key. Message packets carry their
//! IV as a separate base64 field, so the primary API here takes the nonce
//! explicitly instead of prepending it to the ciphertext. The sealed-box
//! exchange path uses the prepended-nonce format since its envelope is an
//! opaque blob.

use crate::error::{ChannelError, ChannelResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

/// IV (nonce) size for ChaCha20-Poly1305 (12 bytes)
pub const IV_SIZE: usize = 12;

/// Symmetric key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Cipher bound to one channel key.
///
/// # Wire Format
///
/// Packet bodies carry `base64(iv) + " " + base64(ciphertext + tag)`; the IV
/// is never prepended there. [`ChannelCrypto::encrypt`] / [`decrypt`] use the
/// self-contained format `[iv (12 bytes)] + [ciphertext + tag]` for blob
/// payloads such as sealed invite envelopes.
///
/// [`decrypt`]: ChannelCrypto::decrypt
pub struct ChannelCrypto {
    cipher: ChaCha20Poly1305,
}

impl ChannelCrypto {
    /// Create a cipher instance from a 32-byte channel key.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte channel key.
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Generate a random 12-byte IV.
    pub fn generate_iv() -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        rand::rng().fill_bytes(&mut iv);
        iv
    }

    /// Encrypt with an explicit IV. The IV is not prepended; the caller
    /// transmits it as its own packet field.
    pub fn encrypt_with_iv(&self, plaintext: &[u8], iv: &[u8; IV_SIZE]) -> ChannelResult<Vec<u8>> {
        let nonce = Nonce::from_slice(iv);
        self.cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| ChannelError::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt with an explicit IV carried outside the ciphertext.
    pub fn decrypt_with_iv(&self, ciphertext: &[u8], iv: &[u8; IV_SIZE]) -> ChannelResult<Vec<u8>> {
        let nonce = Nonce::from_slice(iv);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| ChannelError::Decryption(format!("{}", e)))
    }

    /// Encrypt with a fresh random IV prepended to the output:
    /// `[iv (12 bytes)] + [ciphertext + tag]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> ChannelResult<Vec<u8>> {
        let iv = Self::generate_iv();
        let ciphertext = self.encrypt_with_iv(plaintext, &iv)?;

        let mut result = iv.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data in the prepended-IV format produced by [`encrypt`].
    ///
    /// [`encrypt`]: ChannelCrypto::encrypt
    pub fn decrypt(&self, data: &[u8]) -> ChannelResult<Vec<u8>> {
        if data.len() < IV_SIZE {
            return Err(ChannelError::Decryption(
                "Data too short to contain IV".to_string(),
            ));
        }

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&data[..IV_SIZE]);
        self.decrypt_with_iv(&data[IV_SIZE..], &iv)
    }

    /// Encrypt a UTF-8 string to a base64 token suitable for a packet body.
    pub fn encrypt_text(&self, plaintext: &str, iv: &[u8; IV_SIZE]) -> ChannelResult<String> {
        let ciphertext = self.encrypt_with_iv(plaintext.as_bytes(), iv)?;
        Ok(BASE64.encode(ciphertext))
    }

    /// Decrypt a base64 packet-body token back to a UTF-8 string.
    pub fn decrypt_text(&self, encoded: &str, iv: &[u8; IV_SIZE]) -> ChannelResult<String> {
        let ciphertext = BASE64
            .decode(encoded)
            .map_err(|e| ChannelError::MalformedPacket(format!("Invalid base64 body: {}", e)))?;
        let plaintext = self.decrypt_with_iv(&ciphertext, iv)?;
        String::from_utf8(plaintext)
            .map_err(|e| ChannelError::Decryption(format!("Plaintext is not UTF-8: {}", e)))
    }
}

/// Decode a base64 IV field into the fixed 12-byte array.
pub fn decode_iv(encoded: &str) -> ChannelResult<[u8; IV_SIZE]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| ChannelError::MalformedPacket(format!("Invalid base64 IV: {}", e)))?;
    if bytes.len() != IV_SIZE {
        return Err(ChannelError::MalformedPacket(format!(
            "IV must be {} bytes, got {}",
            IV_SIZE,
            bytes.len()
        )));
    }
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&bytes);
    Ok(iv)
}

/// Encode an IV for transmission as a packet field.
pub fn encode_iv(iv: &[u8; IV_SIZE]) -> String {
    BASE64.encode(iv)
}
