//! Sealed envelopes with X25519 ephemeral key exchange
//!
//! The invite response carries channel state encrypted to the requester's
//! ephemeral public key:
//!
//! ```text
//! 1. X25519: ss = x25519(ephemeral_sk, recipient_pk)
//! 2. Derive: key = HKDF-SHA256(ss, "backchannel-key-exchange-v1")
//! 3. Seal:   ciphertext = ChaCha20-Poly1305(key, payload)
//! ```
//!
//! This provides confidentiality only: opening an envelope proves the sender
//! held the recipient's public key, which the requester broadcast in the
//! clear. There is no independent responder signature, so any observer of
//! the request can forge a response. That gap is inherited from the protocol
//! design, not an oversight here.

use crate::crypto::ChannelCrypto;
use crate::error::{ChannelError, ChannelResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

/// Domain separation string for HKDF
const HKDF_INFO: &[u8] = b"backchannel-key-exchange-v1";

/// Ephemeral keypair generated per join request.
pub struct ExchangeKeyPair {
    secret: X25519StaticSecret,
    public: X25519PublicKey,
}

impl ExchangeKeyPair {
    /// Generate a fresh keypair from the system RNG.
    pub fn generate() -> ChannelResult<Self> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| ChannelError::Crypto(format!("Failed to generate ephemeral key: {}", e)))?;
        let secret = X25519StaticSecret::from(seed);
        let public = X25519PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Raw public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Public key in its wire form (one base64 line).
    pub fn serialize_public(&self) -> String {
        serialize_public_key(&self.public_bytes())
    }

    /// The private half, for opening responses.
    pub fn secret(&self) -> &X25519StaticSecret {
        &self.secret
    }
}

/// Encode a public key for embedding in a join-request body.
pub fn serialize_public_key(public: &[u8; 32]) -> String {
    BASE64.encode(public)
}

/// Parse a wire-form public key.
pub fn parse_public_key(encoded: &str) -> ChannelResult<[u8; 32]> {
    let bytes = BASE64.decode(encoded.trim()).map_err(|e| {
        ChannelError::MalformedPacket(format!("Invalid base64 public key: {}", e))
    })?;
    if bytes.len() != 32 {
        return Err(ChannelError::MalformedPacket(format!(
            "Public key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Asymmetric ciphertext addressed to one ephemeral public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Sender's ephemeral X25519 public key
    pub ephemeral_pk: [u8; 32],
    /// ChaCha20-Poly1305 ciphertext in prepended-IV format
    pub ciphertext: Vec<u8>,
}

impl SealedEnvelope {
    /// Seal a payload to a recipient public key.
    pub fn seal(plaintext: &[u8], recipient_pk: &[u8; 32]) -> ChannelResult<Self> {
        let ephemeral = ExchangeKeyPair::generate()?;
        let recipient = X25519PublicKey::from(*recipient_pk);

        let shared = ephemeral.secret.diffie_hellman(&recipient);
        let key = derive_key(shared.as_bytes());

        let crypto = ChannelCrypto::new(&key);
        let ciphertext = crypto.encrypt(plaintext)?;

        Ok(Self {
            ephemeral_pk: ephemeral.public_bytes(),
            ciphertext,
        })
    }

    /// Open with the recipient's private key.
    pub fn open(&self, secret: &X25519StaticSecret) -> ChannelResult<Vec<u8>> {
        let ephemeral = X25519PublicKey::from(self.ephemeral_pk);
        let shared = secret.diffie_hellman(&ephemeral);
        let key = derive_key(shared.as_bytes());

        let crypto = ChannelCrypto::new(&key);
        crypto.decrypt(&self.ciphertext)
    }

    /// Wire form: base64 over the postcard encoding, one token with no
    /// internal spaces so it fits a space-delimited packet body.
    pub fn encode(&self) -> ChannelResult<String> {
        let bytes = postcard::to_stdvec(self).map_err(|e| {
            ChannelError::Serialization(format!("Failed to encode envelope: {}", e))
        })?;
        Ok(BASE64.encode(bytes))
    }

    /// Parse the wire form.
    pub fn decode(encoded: &str) -> ChannelResult<Self> {
        let bytes = BASE64.decode(encoded).map_err(|e| {
            ChannelError::MalformedPacket(format!("Invalid base64 envelope: {}", e))
        })?;
        postcard::from_bytes(&bytes)
            .map_err(|e| ChannelError::Serialization(format!("Invalid envelope data: {}", e)))
    }
}

/// Derive the sealing key from a shared secret using HKDF-SHA256.
fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut output = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut output)
        .expect("HKDF expand should never fail with 32-byte output");
    output
}
