//! In-memory transport double
//!
//! An append-only feed with the exact semantics the protocol relies on:
//! newest-first fetches, limit capping, and "fewer returned than requested"
//! when a mirror's history is shorter than the probe. Used by the unit and
//! integration tests; a real deployment supplies an HTTP-backed [`Transport`]
//! instead.
//!
//! [`Transport`]: super::Transport

use super::{AttachmentRef, MirrorId, OutgoingFile, Record, Transport};
use crate::error::{ChannelError, ChannelResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct FeedState {
    /// Per-mirror histories, oldest-first
    feeds: HashMap<MirrorId, Vec<Record>>,
    /// Attachment payloads keyed by locator
    blobs: HashMap<String, Vec<u8>>,
    /// Monotonic id source for records and attachment locators
    next_id: u64,
}

/// In-memory append-only message feed.
pub struct MemoryTransport {
    state: Mutex<FeedState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FeedState::default()),
        }
    }

    /// Append a record with an explicit platform timestamp.
    ///
    /// Returns the assigned record id. Tests use this to script freshness
    /// and TTL scenarios; [`Transport::send`] posts at the current time.
    pub fn post_at(
        &self,
        mirror: &MirrorId,
        text: &str,
        files: Vec<OutgoingFile>,
        timestamp: DateTime<Utc>,
    ) -> String {
        let mut state = self.state.lock();

        state.next_id += 1;
        let record_id = state.next_id.to_string();

        let mut attachments = Vec::with_capacity(files.len());
        for file in files {
            state.next_id += 1;
            let url = format!("mem://{}", state.next_id);
            state.blobs.insert(url.clone(), file.bytes);
            attachments.push(Some(AttachmentRef {
                filename: file.filename,
                url,
            }));
        }

        let record = Record {
            id: record_id.clone(),
            content: text.to_string(),
            timestamp,
            mirror: mirror.clone(),
            attachments,
        };
        state.feeds.entry(mirror.clone()).or_default().push(record);

        record_id
    }

    /// Number of records posted to a mirror so far.
    pub fn len(&self, mirror: &MirrorId) -> usize {
        self.state
            .lock()
            .feeds
            .get(mirror)
            .map(|f| f.len())
            .unwrap_or(0)
    }

    /// Whether a mirror has no records.
    pub fn is_empty(&self, mirror: &MirrorId) -> bool {
        self.len(mirror) == 0
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(&self, mirror: &MirrorId, limit: usize) -> ChannelResult<Vec<Record>> {
        let state = self.state.lock();
        let feed = match state.feeds.get(mirror) {
            Some(feed) => feed,
            None => return Ok(Vec::new()),
        };

        // Newest-first, capped at limit
        Ok(feed.iter().rev().take(limit).cloned().collect())
    }

    async fn send(
        &self,
        mirror: &MirrorId,
        text: &str,
        files: Vec<OutgoingFile>,
    ) -> ChannelResult<()> {
        self.post_at(mirror, text, files, Utc::now());
        Ok(())
    }

    async fn download(&self, attachment: &AttachmentRef) -> ChannelResult<Vec<u8>> {
        self.state
            .lock()
            .blobs
            .get(&attachment.url)
            .cloned()
            .ok_or_else(|| {
                ChannelError::Transport(format!("Unknown attachment locator: {}", attachment.url))
            })
    }
}
