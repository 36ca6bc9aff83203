//! Error types for backchannel protocol operations

use thiserror::Error;

/// Main error type for backchannel operations.
///
/// No variant here is fatal to a running scan loop: per-record failures are
/// caught where the record is processed, logged with context, and the rest
/// of the batch continues. The feed is shared and adversarial by
/// construction, so a single bad record must be inert.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Packet prefix or split structure did not match the expected framing
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Cipher failure while decrypting a packet body (wrong key or tampering)
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Cryptographic operation failed outside of packet decryption
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A previously seen message IV was encountered again
    #[error("Repeat encoding IV encountered: {0}")]
    Replay(String),

    /// Embedded timestamp drifted too far from the platform timestamp
    #[error("Timestamp validation failure: {skew}s discrepancy exceeds limit of {limit}s")]
    Freshness { skew: f64, limit: f64 },

    /// Join request older than the TTL window (filtered silently at scan time)
    #[error("Join request expired: {age}s old exceeds TTL of {ttl}s")]
    ExpiredRequest { age: f64, ttl: f64 },

    /// Transport-level fetch/send/download failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using ChannelError
pub type ChannelResult<T> = Result<T, ChannelError>;
