//! Symmetric channel message protocol
//!
//! ## Wire Format
//!
//! ```text
//! [channel-name] channel-id
//! base64(iv) base64(ciphertext)
//! base64(iv1) base64(iv2) ...        <- only when file attachments exist
//! ```
//!
//! The pre-encryption plaintext layout is `<unixTimestamp> <tag>: <body>`
//! with the timestamp in float seconds.
//!
//! ## Decode order
//!
//! Prefix filter, header channel-id match, decrypt, then the two guards in
//! fixed order: replay first (the IV is recorded before any further
//! processing), freshness second (inclusive 60-second skew bound against the
//! platform-reported timestamp).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::carrier::{self, Attachment};
use crate::channel::Channel;
use crate::crypto::{decode_iv, encode_iv, ChannelCrypto, IV_SIZE, KEY_SIZE};
use crate::error::{ChannelError, ChannelResult};
use crate::sync::{RecordSink, SyncEngine};
use crate::transport::{choose_mirror, sort_by_timestamp, MirrorId, Record, Transport};

/// Symmetric-message identifying start symbol
pub const MESSAGE_PREFIX: &str = "[";

/// Maximum allowed shift between platform and embedded timestamps (seconds);
/// a skew of exactly this value is still accepted
pub const MAX_TIMESTAMP_SKEW: f64 = 60.0;

/// Current time as float unix seconds, the plaintext timestamp format.
pub fn now_unix() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Unbounded append-only set of previously observed message IVs.
///
/// Scoped per channel: one set per [`MessageService`]. Once recorded an IV
/// is never evicted, so replays are rejected for the lifetime of the
/// process. Membership is O(1) amortized.
#[derive(Debug, Default)]
pub struct SeenIvSet {
    ivs: Mutex<HashSet<String>>,
}

impl SeenIvSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the IV if seen before, record it otherwise.
    pub fn check_and_record(&self, iv: &str) -> ChannelResult<()> {
        let mut ivs = self.ivs.lock();
        if !ivs.insert(iv.to_string()) {
            return Err(ChannelError::Replay(iv.to_string()));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ivs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ivs.lock().is_empty()
    }
}

/// Encoder for one outbound channel message.
pub struct MessageEncoder<'a> {
    channel: &'a Channel,
    tag: String,
    message: String,
    iv: [u8; IV_SIZE],
    attachment_ivs: Vec<[u8; IV_SIZE]>,
}

impl<'a> MessageEncoder<'a> {
    /// Prepare an encoder with a fresh message IV.
    pub fn new(
        channel: &'a Channel,
        tag: impl Into<String>,
        message: impl Into<String>,
        attachments: &[Attachment],
    ) -> Self {
        Self {
            channel,
            tag: tag.into(),
            message: message.into(),
            iv: ChannelCrypto::generate_iv(),
            attachment_ivs: attachments.iter().map(|a| a.iv).collect(),
        }
    }

    /// The message IV chosen for this packet.
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Header line: `"[" + name + "] " + id`.
    pub fn header(&self) -> String {
        format!(
            "{}{}] {}",
            MESSAGE_PREFIX,
            self.channel.name,
            self.channel.id.as_str()
        )
    }

    /// Encode the packet body with an explicit embedded timestamp.
    pub fn encode_at(&self, timestamp: f64) -> ChannelResult<String> {
        let plaintext = format!("{} {}: {}", timestamp, self.tag, self.message);

        let crypto = ChannelCrypto::new(&self.channel.key);
        let mut body = format!(
            "{} {}",
            encode_iv(&self.iv),
            crypto.encrypt_text(&plaintext, &self.iv)?
        );

        if !self.attachment_ivs.is_empty() {
            let ivs: Vec<String> = self.attachment_ivs.iter().map(encode_iv).collect();
            body.push('\n');
            body.push_str(&ivs.join(" "));
        }

        Ok(body)
    }

    /// Full transmission text (header + body) stamped with the current time.
    pub fn transmission(&self) -> ChannelResult<String> {
        self.transmission_at(now_unix())
    }

    /// Full transmission text with an explicit embedded timestamp.
    pub fn transmission_at(&self, timestamp: f64) -> ChannelResult<String> {
        Ok(format!("{}\n{}", self.header(), self.encode_at(timestamp)?))
    }
}

/// Decoder for one received channel message packet.
pub struct MessageDecoder {
    header: String,
    body: String,
    /// Attachment IVs from the optional trailing line, in attachment order
    pub attachment_ivs: Vec<[u8; IV_SIZE]>,
}

impl MessageDecoder {
    /// Split a packet into header, body, and the optional attachment-IV line.
    pub fn parse(packet: &str) -> ChannelResult<Self> {
        if !packet.starts_with(MESSAGE_PREFIX) {
            return Err(ChannelError::MalformedPacket(
                "Missing symmetric message prefix".to_string(),
            ));
        }

        let (header, rest) = packet.split_once('\n').ok_or_else(|| {
            ChannelError::MalformedPacket("Packet has no body line".to_string())
        })?;

        // A trailing newline-separated line, when present, carries the
        // attachment IVs; the body itself is a single line.
        let (body, attachment_ivs) = match rest.rsplit_once('\n') {
            Some((body, iv_line)) => {
                let ivs = iv_line
                    .split(' ')
                    .filter(|t| !t.is_empty())
                    .map(decode_iv)
                    .collect::<ChannelResult<Vec<_>>>()?;
                (body.to_string(), ivs)
            }
            None => (rest.to_string(), Vec::new()),
        };

        Ok(Self {
            header: header.to_string(),
            body,
            attachment_ivs,
        })
    }

    /// Channel id from the header (the token after the last space).
    pub fn channel_id(&self) -> ChannelResult<&str> {
        self.header
            .rsplit_once(' ')
            .map(|(_, id)| id)
            .ok_or_else(|| ChannelError::MalformedPacket("Header has no channel id".to_string()))
    }

    /// Raw ciphertext token, kept for error-report context.
    pub fn ciphertext(&self) -> &str {
        self.body.split_once(' ').map(|(_, ct)| ct).unwrap_or("")
    }

    /// Decrypt the body under the channel key.
    ///
    /// Returns the base64 IV string alongside the plaintext so validation
    /// can record it in the seen set.
    pub fn decrypt(&self, key: &[u8; KEY_SIZE]) -> ChannelResult<(String, String)> {
        let (encoded_iv, ciphertext) = self.body.split_once(' ').ok_or_else(|| {
            ChannelError::MalformedPacket("Body has no IV field".to_string())
        })?;

        let iv = decode_iv(encoded_iv)?;
        let crypto = ChannelCrypto::new(key);
        let plaintext = crypto.decrypt_text(ciphertext, &iv)?;

        Ok((encoded_iv.to_string(), plaintext))
    }
}

/// A decrypted, validated channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Base64 message IV, already recorded in the seen set
    pub iv: String,
    /// Embedded timestamp (float unix seconds)
    pub timestamp: f64,
    /// Sender tag
    pub tag: String,
    /// Message body
    pub body: String,
    /// Display text: `<tag>: <body>`
    pub text: String,
}

impl DecodedMessage {
    /// Re-split decrypted plaintext into its fields.
    pub fn parse(iv: String, plaintext: &str) -> ChannelResult<Self> {
        let (timestamp, text) = plaintext.split_once(' ').ok_or_else(|| {
            ChannelError::MalformedPacket("Plaintext has no timestamp field".to_string())
        })?;
        let timestamp: f64 = timestamp.parse().map_err(|_| {
            ChannelError::MalformedPacket(format!("Invalid plaintext timestamp: {}", timestamp))
        })?;

        let (tag, body) = text.split_once(": ").ok_or_else(|| {
            ChannelError::MalformedPacket("Plaintext has no tag delimiter".to_string())
        })?;

        Ok(Self {
            iv,
            timestamp,
            tag: tag.to_string(),
            body: body.to_string(),
            text: text.to_string(),
        })
    }

    /// Run the replay and freshness guards, in that order.
    ///
    /// The IV is recorded before any further processing; the freshness bound
    /// is inclusive (a skew of exactly the limit passes).
    pub fn validate(&self, platform_timestamp: f64, seen: &SeenIvSet) -> ChannelResult<()> {
        seen.check_and_record(&self.iv)?;

        let skew = (platform_timestamp - self.timestamp).abs();
        if skew > MAX_TIMESTAMP_SKEW {
            return Err(ChannelError::Freshness {
                skew,
                limit: MAX_TIMESTAMP_SKEW,
            });
        }

        Ok(())
    }
}

/// What to do with a decoded message; implemented per call site.
pub trait MessageSink: Send + Sync {
    fn on_message(&self, message: &DecodedMessage, record: &Record);
}

/// Default renderer: prints timestamped messages and attachment download
/// codes to stdout.
pub struct ConsoleSink {
    channel_id: String,
}

impl ConsoleSink {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
        }
    }
}

impl MessageSink for ConsoleSink {
    fn on_message(&self, message: &DecodedMessage, record: &Record) {
        println!("[{}]\n{}\n", record.timestamp, message.text);

        for (index, slot) in record.attachments.iter().enumerate() {
            let Some(attachment) = slot else {
                continue;
            };
            let filename = carrier::name_decode(&attachment.filename);
            println!(
                "<attachment \"{}\">\n{}/{}/{}.{}\n",
                filename, self.channel_id, record.mirror, record.id, index
            );
        }
    }
}

/// Receipt and transmission service for one channel.
///
/// Implements [`RecordSink`], so it plugs straight into
/// [`SyncEngine::run`]. Per-record failures are logged with channel
/// identity, best-effort ciphertext, and both timestamps, and never abort
/// the rest of the batch or the polling loop.
pub struct MessageService<T> {
    transport: Arc<T>,
    mirrors: Vec<MirrorId>,
    channel: Channel,
    seen_ivs: SeenIvSet,
    sink: Arc<dyn MessageSink>,
}

impl<T: Transport> MessageService<T> {
    pub fn new(
        transport: Arc<T>,
        mirrors: Vec<MirrorId>,
        channel: Channel,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            transport,
            mirrors,
            channel,
            seen_ivs: SeenIvSet::new(),
            sink,
        }
    }

    /// The channel this service reads and writes.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Encrypt and transmit a message to a uniformly random mirror.
    pub async fn send(
        &self,
        tag: &str,
        message: &str,
        attachments: Vec<Attachment>,
    ) -> ChannelResult<()> {
        let encoder = MessageEncoder::new(&self.channel, tag, message, &attachments);
        let transmission = encoder.transmission()?;

        let files = attachments
            .iter()
            .map(|a| a.encode(&self.channel.key))
            .collect::<ChannelResult<Vec<_>>>()?;

        let (content, files) = carrier::prepare_transmission(transmission, files);
        let mirror = choose_mirror(&self.mirrors)?;
        self.transport.send(mirror, &content, files).await
    }

    /// Decode, validate, and dispatch a batch of raw records.
    ///
    /// The batch is sorted by platform timestamp first so replay recording
    /// sees a deterministic, monotonic view despite multi-mirror fan-in.
    pub async fn process(&self, mut records: Vec<Record>) {
        sort_by_timestamp(&mut records);

        for mut record in records {
            let platform_timestamp = record.timestamp;
            if let Err(e) = self.process_record(&mut record).await {
                match e {
                    ChannelError::MalformedPacket(_) => {
                        // Foreign chatter is expected on a shared feed
                        debug!(record = %record.id, error = %e, "Skipping unparseable record");
                    }
                    _ => {
                        warn!(
                            channel = %self.channel.name,
                            ciphertext = %best_effort_ciphertext(&record),
                            service_timestamp = %Utc::now(),
                            server_timestamp = %platform_timestamp,
                            error = %e,
                            "Message processing error"
                        );
                    }
                }
            }
        }
    }

    async fn process_record(&self, record: &mut Record) -> ChannelResult<()> {
        carrier::rehydrate(record, self.transport.as_ref()).await?;

        if !record.content.starts_with(MESSAGE_PREFIX) {
            return Ok(());
        }

        let decoder = MessageDecoder::parse(&record.content)?;
        if decoder.channel_id()? != self.channel.id.as_str() {
            // Not ours: never attempt decryption against a foreign channel
            return Ok(());
        }

        let (iv, plaintext) = decoder.decrypt(&self.channel.key)?;
        let message = DecodedMessage::parse(iv, &plaintext)?;

        let platform_timestamp = record.timestamp.timestamp_micros() as f64 / 1_000_000.0;
        message.validate(platform_timestamp, &self.seen_ivs)?;

        self.sink.on_message(&message, record);
        Ok(())
    }

    /// Render the backlog, then run the live receive loop.
    pub async fn start(&self, engine: &mut SyncEngine<T>) -> ChannelResult<()> {
        let history = engine.read_history().await?;
        self.process(history).await;
        engine.run(self).await
    }
}

fn best_effort_ciphertext(record: &Record) -> String {
    MessageDecoder::parse(&record.content)
        .map(|d| d.ciphertext().to_string())
        .unwrap_or_else(|_| "N/A".to_string())
}

#[async_trait]
impl<T: Transport> RecordSink for MessageService<T> {
    async fn on_batch(&self, records: Vec<Record>) -> bool {
        self.process(records).await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::AttachmentRef;
    use chrono::TimeZone;

    fn test_record(content: &str, secs: i64) -> Record {
        Record {
            id: "1".to_string(),
            content: content.to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            mirror: MirrorId::new("m1"),
            attachments: Vec::new(),
        }
    }

    fn decode_and_validate(
        packet: &str,
        channel: &Channel,
        platform_ts: f64,
        seen: &SeenIvSet,
    ) -> ChannelResult<DecodedMessage> {
        let decoder = MessageDecoder::parse(packet)?;
        assert_eq!(decoder.channel_id()?, channel.id.as_str());
        let (iv, plaintext) = decoder.decrypt(&channel.key)?;
        let message = DecodedMessage::parse(iv, &plaintext)?;
        message.validate(platform_ts, seen)?;
        Ok(message)
    }

    #[test]
    fn test_roundtrip_recovers_triple() {
        let channel = Channel::create("ops");
        let encoder = MessageEncoder::new(&channel, "alice", "hello", &[]);
        let packet = encoder.transmission_at(1000.0).unwrap();
        let seen = SeenIvSet::new();

        let message = decode_and_validate(&packet, &channel, 1000.0, &seen).unwrap();
        assert_eq!(message.tag, "alice");
        assert_eq!(message.body, "hello");
        assert_eq!(message.text, "alice: hello");
        assert_eq!(message.timestamp, 1000.0);

        // The encode IV is the one recorded as seen
        assert_eq!(message.iv, encode_iv(encoder.iv()));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_replay_rejected_on_second_decode() {
        let channel = Channel::create("ops");
        let packet = MessageEncoder::new(&channel, "alice", "hello", &[])
            .transmission_at(1000.0)
            .unwrap();
        let seen = SeenIvSet::new();

        decode_and_validate(&packet, &channel, 1000.0, &seen).unwrap();
        let result = decode_and_validate(&packet, &channel, 1000.0, &seen);
        assert!(matches!(result, Err(ChannelError::Replay(_))));
    }

    #[test]
    fn test_freshness_boundary_inclusive() {
        let channel = Channel::create("ops");
        let seen = SeenIvSet::new();

        // Exactly at the skew limit: accepted
        let packet = MessageEncoder::new(&channel, "a", "x", &[])
            .transmission_at(1000.0 + MAX_TIMESTAMP_SKEW)
            .unwrap();
        decode_and_validate(&packet, &channel, 1000.0, &seen).unwrap();

        // One past the limit: rejected
        let packet = MessageEncoder::new(&channel, "a", "x", &[])
            .transmission_at(1000.0 + MAX_TIMESTAMP_SKEW + 1.0)
            .unwrap();
        let result = decode_and_validate(&packet, &channel, 1000.0, &seen);
        assert!(matches!(result, Err(ChannelError::Freshness { .. })));
    }

    #[test]
    fn test_replay_checked_before_freshness() {
        let channel = Channel::create("ops");
        let seen = SeenIvSet::new();

        // A stale packet still burns its IV...
        let packet = MessageEncoder::new(&channel, "a", "x", &[])
            .transmission_at(5000.0)
            .unwrap();
        let result = decode_and_validate(&packet, &channel, 1000.0, &seen);
        assert!(matches!(result, Err(ChannelError::Freshness { .. })));

        // ...so replaying it reports replay, not freshness
        let result = decode_and_validate(&packet, &channel, 1000.0, &seen);
        assert!(matches!(result, Err(ChannelError::Replay(_))));
    }

    #[test]
    fn test_attachment_iv_line_roundtrip() {
        let channel = Channel::create("ops");
        let attachments = vec![
            Attachment::new("a.txt", vec![1]),
            Attachment::new("b.txt", vec![2]),
        ];
        let encoder = MessageEncoder::new(&channel, "alice", "files", &attachments);
        let packet = encoder.transmission_at(1.0).unwrap();

        let decoder = MessageDecoder::parse(&packet).unwrap();
        assert_eq!(decoder.attachment_ivs.len(), 2);
        assert_eq!(decoder.attachment_ivs[0], attachments[0].iv);
        assert_eq!(decoder.attachment_ivs[1], attachments[1].iv);

        // Body still decrypts with the IV line present
        let (_, plaintext) = decoder.decrypt(&channel.key).unwrap();
        assert!(plaintext.ends_with("alice: files"));
    }

    #[test]
    fn test_header_format() {
        let channel = Channel::create("drop-site");
        let encoder = MessageEncoder::new(&channel, "a", "x", &[]);
        assert_eq!(
            encoder.header(),
            format!("[drop-site] {}", channel.id.as_str())
        );
    }

    #[test]
    fn test_parse_rejects_foreign_prefix() {
        let result = MessageDecoder::parse("(join) some-id\nbody");
        assert!(matches!(result, Err(ChannelError::MalformedPacket(_))));
    }

    #[test]
    fn test_parse_rejects_headerless_packet() {
        let result = MessageDecoder::parse("[ops] id-without-body");
        assert!(matches!(result, Err(ChannelError::MalformedPacket(_))));
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let channel = Channel::create("ops");
        let packet = MessageEncoder::new(&channel, "a", "x", &[])
            .transmission_at(1.0)
            .unwrap();

        let decoder = MessageDecoder::parse(&packet).unwrap();
        let wrong_key = ChannelCrypto::generate_key();
        assert!(matches!(
            decoder.decrypt(&wrong_key),
            Err(ChannelError::Decryption(_))
        ));
    }

    struct CollectMessages {
        messages: Mutex<Vec<DecodedMessage>>,
    }

    impl MessageSink for CollectMessages {
        fn on_message(&self, message: &DecodedMessage, _record: &Record) {
            self.messages.lock().push(message.clone());
        }
    }

    #[tokio::test]
    async fn test_service_send_and_process() {
        let transport = Arc::new(MemoryTransport::new());
        let mirrors = vec![MirrorId::new("m1")];
        let channel = Channel::create("ops");

        let sink = Arc::new(CollectMessages {
            messages: Mutex::new(Vec::new()),
        });
        let service = MessageService::new(
            transport.clone(),
            mirrors.clone(),
            channel.clone(),
            sink.clone(),
        );

        service.send("alice", "rendezvous at dawn", Vec::new()).await.unwrap();

        let records = transport.fetch(&mirrors[0], 10).await.unwrap();
        service.process(records).await;

        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "alice: rendezvous at dawn");
    }

    #[tokio::test]
    async fn test_service_skips_foreign_channel_traffic() {
        let transport = Arc::new(MemoryTransport::new());
        let mirrors = vec![MirrorId::new("m1")];
        let ours = Channel::create("ours");
        let theirs = Channel::create("theirs");

        let sink = Arc::new(CollectMessages {
            messages: Mutex::new(Vec::new()),
        });
        let service = MessageService::new(
            transport.clone(),
            mirrors.clone(),
            ours,
            sink.clone(),
        );

        // A packet for a different channel plus plain chatter
        let foreign = MessageEncoder::new(&theirs, "bob", "hi", &[])
            .transmission()
            .unwrap();
        transport.send(&mirrors[0], &foreign, Vec::new()).await.unwrap();
        transport
            .send(&mirrors[0], "just a bystander", Vec::new())
            .await
            .unwrap();

        let records = transport.fetch(&mirrors[0], 10).await.unwrap();
        service.process(records).await;

        assert!(sink.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_service_survives_corrupted_packet() {
        let transport = Arc::new(MemoryTransport::new());
        let mirrors = vec![MirrorId::new("m1")];
        let channel = Channel::create("ops");

        let sink = Arc::new(CollectMessages {
            messages: Mutex::new(Vec::new()),
        });
        let service = MessageService::new(
            transport.clone(),
            mirrors.clone(),
            channel.clone(),
            sink.clone(),
        );

        // Corrupted packet addressed to our channel, then a valid one
        let corrupted = format!("[ops] {}\nnot-an-iv garbage", channel.id.as_str());
        transport.send(&mirrors[0], &corrupted, Vec::new()).await.unwrap();
        service.send("alice", "still here", Vec::new()).await.unwrap();

        let records = transport.fetch(&mirrors[0], 10).await.unwrap();
        service.process(records).await;

        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "still here");
    }

    #[test]
    fn test_console_sink_lists_attachments() {
        // Smoke test: rendering must tolerate tombstoned slots
        let sink = ConsoleSink::new("channel-id");
        let mut record = test_record("x", 1);
        record.attachments = vec![
            None,
            Some(AttachmentRef {
                filename: "doc.pdf.enc".to_string(),
                url: "mem://1".to_string(),
            }),
        ];
        let message = DecodedMessage {
            iv: "iv".to_string(),
            timestamp: 1.0,
            tag: "a".to_string(),
            body: "x".to_string(),
            text: "a: x".to_string(),
        };
        sink.on_message(&message, &record);
    }
}
