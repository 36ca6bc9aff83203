//! Oversized-payload carrier and encrypted file attachments
//!
//! The platform caps visible text at a fixed character budget. When a fully
//! encoded transmission exceeds it, the whole text is uploaded as a file
//! attachment instead and a fixed sentinel string goes out as the visible
//! content. On receive, a sentinel record is rehydrated: the first
//! attachment is downloaded and substituted for the content, and its slot is
//! tombstoned (`None`, not removed) so position-based indexing into the
//! message's other, legitimate attachments stays valid.
//!
//! User attachments are each encrypted independently under the channel key
//! with their own random IV, so a single attachment can be fetched and
//! decrypted without touching its siblings.

use crate::crypto::{ChannelCrypto, IV_SIZE, KEY_SIZE};
use crate::error::{ChannelError, ChannelResult};
use crate::transport::{OutgoingFile, Record, Transport};

/// Standard-sized transmission character limit
pub const TEXT_LIMIT: usize = 2000;

/// Visible content of an oversized transmission
pub const ATTACHMENT_SENTINEL: &str = "<attachment>";

/// Filename of the carrier attachment holding the real transmission text
const CARRIER_FILENAME: &str = "data.txt";

/// Suffix appended to encrypted attachment filenames
const ENCODED_SUFFIX: &str = ".enc";

/// Append the encoded-file suffix to a filename.
pub fn name_encode(filename: &str) -> String {
    format!("{}{}", filename, ENCODED_SUFFIX)
}

/// Strip the encoded-file suffix from a filename.
pub fn name_decode(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => filename.to_string(),
    }
}

/// Reroute an over-budget transmission through a carrier attachment.
///
/// Returns the visible content and the final outbound file list. Within
/// budget, both pass through unchanged; over budget, the transmission text
/// becomes the primary (first) attachment and the sentinel becomes the
/// visible content.
pub fn prepare_transmission(
    transmission: String,
    mut files: Vec<OutgoingFile>,
) -> (String, Vec<OutgoingFile>) {
    if transmission.chars().count() <= TEXT_LIMIT {
        return (transmission, files);
    }

    files.insert(
        0,
        OutgoingFile {
            filename: CARRIER_FILENAME.to_string(),
            bytes: transmission.into_bytes(),
        },
    );

    (ATTACHMENT_SENTINEL.to_string(), files)
}

/// Rehydrate an oversized record in place.
///
/// Only records whose content exactly equals the sentinel are touched: the
/// designated (first) attachment is downloaded, decoded as UTF-8, and
/// substituted for the record's content; the carrier slot becomes a
/// tombstone.
pub async fn rehydrate(record: &mut Record, transport: &dyn Transport) -> ChannelResult<()> {
    if record.content != ATTACHMENT_SENTINEL {
        return Ok(());
    }

    let carrier = record
        .attachments
        .first()
        .and_then(|slot| slot.as_ref())
        .ok_or_else(|| {
            ChannelError::MalformedPacket("Sentinel record has no carrier attachment".to_string())
        })?;

    let bytes = transport.download(carrier).await?;
    record.content = String::from_utf8(bytes).map_err(|e| {
        ChannelError::MalformedPacket(format!("Carrier payload is not UTF-8: {}", e))
    })?;
    record.attachments[0] = None;

    Ok(())
}

/// A user-supplied file attachment with its own encryption IV.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub iv: [u8; IV_SIZE],
}

impl Attachment {
    /// Wrap raw file bytes with a fresh random IV.
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
            iv: ChannelCrypto::generate_iv(),
        }
    }

    /// Encrypt for transmission under the channel key.
    pub fn encode(&self, key: &[u8; KEY_SIZE]) -> ChannelResult<OutgoingFile> {
        let crypto = ChannelCrypto::new(key);
        let encrypted = crypto.encrypt_with_iv(&self.bytes, &self.iv)?;
        Ok(OutgoingFile {
            filename: name_encode(&self.filename),
            bytes: encrypted,
        })
    }
}

/// Fetch and decrypt one attachment of a received record by slot index.
///
/// `ivs` is the packet's attachment-IV list, ordered to match the record's
/// non-tombstone slots; the IV for a slot is found by counting the occupied
/// slots before it. Returns the original filename (suffix stripped) and the
/// decrypted bytes. Sibling attachments are never downloaded or decrypted.
pub async fn extract_attachment(
    record: &Record,
    index: usize,
    ivs: &[[u8; IV_SIZE]],
    key: &[u8; KEY_SIZE],
    transport: &dyn Transport,
) -> ChannelResult<(String, Vec<u8>)> {
    let slot = record
        .attachments
        .get(index)
        .ok_or_else(|| {
            ChannelError::MalformedPacket(format!("No attachment slot at index {}", index))
        })?
        .as_ref()
        .ok_or_else(|| {
            ChannelError::MalformedPacket(format!("Attachment slot {} is a tombstone", index))
        })?;

    let iv_index = record.attachments[..index]
        .iter()
        .filter(|s| s.is_some())
        .count();
    let iv = ivs.get(iv_index).ok_or_else(|| {
        ChannelError::MalformedPacket(format!("No IV carried for attachment slot {}", index))
    })?;

    let encrypted = transport.download(slot).await?;
    let crypto = ChannelCrypto::new(key);
    let bytes = crypto.decrypt_with_iv(&encrypted, iv)?;

    Ok((name_decode(&slot.filename), bytes))
}
