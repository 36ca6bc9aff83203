//! Transport contract for the public message feed
//!
//! The platform is a black box that supports exactly two operations: a
//! limit-bounded "fetch last N records" with no cursor, and a
//! fire-and-forget text-plus-files send. Everything the protocol knows about
//! the feed goes through the [`Transport`] trait so that the sync engine and
//! both packet protocols stay independent of the HTTP layer.
//!
//! Destination selection across mirror channels is an independent uniform
//! random choice per send, used for load spreading only; no affinity is kept
//! between a request and its eventual response destination.

pub mod memory;

use crate::error::{ChannelError, ChannelResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;

/// Identifier of one public mirror channel on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorId(String);

impl MirrorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MirrorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a file attachment hosted by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    /// Filename as stored on the platform
    pub filename: String,
    /// Opaque download locator
    pub url: String,
}

/// A file queued for outbound transmission.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// One raw record fetched from a mirror channel.
///
/// Attachment slots are optional: a `None` slot is a tombstone left behind
/// when the oversized-payload carrier rehydrates a record, keeping
/// position-based indexing into the remaining attachments valid.
#[derive(Debug, Clone)]
pub struct Record {
    /// Platform-assigned unique record id
    pub id: String,
    /// Visible text content (opaque ciphertext for protocol traffic)
    pub content: String,
    /// Platform-reported timestamp
    pub timestamp: DateTime<Utc>,
    /// Which mirror this record was fetched from
    pub mirror: MirrorId,
    /// Attachment slots, `None` marking a consumed carrier slot
    pub attachments: Vec<Option<AttachmentRef>>,
}

/// Black-box fetch/send interface to the platform.
///
/// `fetch` returns records newest-first, at most `limit` of them; returning
/// fewer than requested signals that the start of the channel's history was
/// reached. `send` is fire-and-forget: no delivery acknowledgment reaches
/// the protocol layer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, mirror: &MirrorId, limit: usize) -> ChannelResult<Vec<Record>>;

    async fn send(
        &self,
        mirror: &MirrorId,
        text: &str,
        files: Vec<OutgoingFile>,
    ) -> ChannelResult<()>;

    async fn download(&self, attachment: &AttachmentRef) -> ChannelResult<Vec<u8>>;
}

/// Pick an outbound destination uniformly at random among the mirrors.
pub fn choose_mirror(mirrors: &[MirrorId]) -> ChannelResult<&MirrorId> {
    mirrors
        .choose(&mut rand::rng())
        .ok_or_else(|| ChannelError::Transport("No mirror channels configured".to_string()))
}

/// Sort a pooled batch by platform timestamp (record id as tiebreaker).
///
/// The sync engine does not guarantee cross-mirror ordering; consumers call
/// this before any order-sensitive processing to get a deterministic,
/// monotonic view of the multi-channel fan-in.
pub fn sort_by_timestamp(records: &mut [Record]) {
    records.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
}
