//! Channel model
//!
//! A channel is an identity plus a symmetric key for one encrypted group.
//! Channels are created locally (fresh id and key) or reconstructed verbatim
//! from a decoded invite response. There is no verification step for the
//! latter beyond successful asymmetric decryption.

use crate::crypto::{ChannelCrypto, KEY_SIZE};
use crate::error::{ChannelError, ChannelResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire schema version for serialized channels inside invite responses
const CHANNEL_RECORD_VERSION: u8 = 1;

/// Opaque unique channel identifier (uuid-v4 string on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an id received on the wire.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as transmitted in packet headers.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One encrypted group: identity + symmetric key.
///
/// The id is immutable once created. The application layer owns channels and
/// passes them by reference into the message protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Opaque unique identifier, fixed at creation
    pub id: ChannelId,
    /// Human-readable name, shown in message headers
    pub name: String,
    /// ChaCha20-Poly1305 channel key
    pub key: [u8; KEY_SIZE],
}

impl Channel {
    /// Create a locally originated channel with a fresh id and key.
    pub fn create(name: impl Into<String>) -> Self {
        Self {
            id: ChannelId::new(),
            name: name.into(),
            key: ChannelCrypto::generate_key(),
        }
    }

    /// Reconstruct a channel from a decoded invite response.
    pub fn from_record(record: ChannelRecord) -> Self {
        Self {
            id: ChannelId::from_string(record.id),
            name: record.name,
            key: record.key,
        }
    }

    /// Snapshot this channel into its invite-transit wire form.
    pub fn to_record(&self) -> ChannelRecord {
        ChannelRecord {
            version: CHANNEL_RECORD_VERSION,
            id: self.id.as_str().to_string(),
            name: self.name.clone(),
            key: self.key,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Search a channel list by name.
pub fn channel_search<'a>(channels: &'a [Channel], name: &str) -> Option<&'a Channel> {
    channels.iter().find(|c| c.name == name)
}

/// Versioned serialization schema for channel state in transit inside an
/// invite response. Field order is the wire order; the version byte comes
/// first so unknown future layouts are rejected before any field is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Schema version (currently 1)
    pub version: u8,
    /// Channel id string
    pub id: String,
    /// Channel name
    pub name: String,
    /// Symmetric channel key
    pub key: [u8; KEY_SIZE],
}

impl ChannelRecord {
    /// Encode to bytes using postcard.
    pub fn encode(&self) -> ChannelResult<Vec<u8>> {
        postcard::to_stdvec(self)
            .map_err(|e| ChannelError::Serialization(format!("Failed to encode channel: {}", e)))
    }

    /// Decode from bytes, rejecting unknown schema versions.
    pub fn decode(bytes: &[u8]) -> ChannelResult<Self> {
        let record: ChannelRecord = postcard::from_bytes(bytes)
            .map_err(|e| ChannelError::Serialization(format!("Invalid channel data: {}", e)))?;

        if record.version != CHANNEL_RECORD_VERSION {
            return Err(ChannelError::Serialization(format!(
                "Unsupported channel record version: {}",
                record.version
            )));
        }

        Ok(record)
    }
}
