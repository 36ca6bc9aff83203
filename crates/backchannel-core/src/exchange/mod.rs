//! Asymmetric key-exchange workflows for channel invitations
//!
//! A joiner broadcasts a `(join)` request carrying a fresh ephemeral public
//! key and keeps a background scanner alive watching for an `(invite)`
//! response keyed to the request id. A member scans the feed for active
//! requests (lazy TTL filter, no persistent pending store) and answers
//! exactly one of them with channel state sealed to the requester's key.
//!
//! The response proves only that the encrypting party saw the public key the
//! requester broadcast in the clear; there is no responder authentication.

pub mod packets;
pub mod sealed;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use x25519_dalek::StaticSecret as X25519StaticSecret;

use crate::channel::Channel;
use crate::config::SyncConfig;
use crate::error::{ChannelError, ChannelResult};
use crate::sync::{RecordSink, SyncEngine};
use crate::transport::{choose_mirror, sort_by_timestamp, MirrorId, Record, Transport};

use packets::{
    InviteResponseDecoder, InviteResponseEncoder, JoinRequestDecoder, JoinRequestEncoder,
    RESPONSE_PREFIX, REQUEST_PREFIX,
};
use sealed::ExchangeKeyPair;

/// Join-request expiry window in seconds; a request aged exactly this much
/// is still active
pub const REQUEST_TTL: f64 = 600.0;

/// A decoded, not-yet-expired join request.
///
/// Exists only as a transient scan result; nothing is persisted, and expiry
/// is evaluated lazily at read time against the platform-reported creation
/// timestamp.
#[derive(Debug, Clone)]
pub struct PendingInviteRequest {
    /// Request id from the packet header
    pub id: String,
    /// Requester's display tag
    pub tag: String,
    /// Free-form introduction message
    pub message: String,
    /// Requester's ephemeral public key
    pub public_key: [u8; 32],
    /// Platform-reported timestamp of the request record
    pub created_at: DateTime<Utc>,
}

impl PendingInviteRequest {
    /// Age in seconds relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds() as f64 / 1000.0
    }

    /// TTL check: expired strictly past the window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > REQUEST_TTL
    }
}

/// Scan the full visible history of the mirrors for active join requests.
///
/// Expired requests are filtered silently (logged at debug level); malformed
/// ones are logged and skipped. Duplicate request ids keep the latest
/// occurrence. Results are sorted oldest-first.
pub async fn scan_requests<T: Transport>(
    transport: Arc<T>,
    mirrors: &[MirrorId],
    config: &SyncConfig,
) -> ChannelResult<Vec<PendingInviteRequest>> {
    let mut engine = SyncEngine::new(
        transport,
        mirrors.to_vec(),
        config.clone(),
        CancellationToken::new(),
    );
    let history = engine.read_history().await?;

    let now = Utc::now();
    let mut requests: HashMap<String, PendingInviteRequest> = HashMap::new();

    for record in &history {
        if !record.content.starts_with(REQUEST_PREFIX) {
            continue;
        }

        match decode_request(record, now) {
            Ok(request) => {
                requests.insert(request.id.clone(), request);
            }
            Err(e @ ChannelError::ExpiredRequest { .. }) => {
                debug!(record = %record.id, error = %e, "Skipping expired join request");
            }
            Err(e) => {
                warn!(
                    message = %record.content,
                    timestamp = %record.timestamp,
                    error = %e,
                    "Request scan error"
                );
            }
        }
    }

    let mut active: Vec<PendingInviteRequest> = requests.into_values().collect();
    active.sort_by_key(|r| r.created_at);
    Ok(active)
}

fn decode_request(record: &Record, now: DateTime<Utc>) -> ChannelResult<PendingInviteRequest> {
    // TTL is checked against the platform-reported timestamp before any
    // decoding work happens
    let age = (now - record.timestamp).num_milliseconds() as f64 / 1000.0;
    if age > REQUEST_TTL {
        return Err(ChannelError::ExpiredRequest {
            age,
            ttl: REQUEST_TTL,
        });
    }

    let decoder = JoinRequestDecoder::parse(&record.content)?;
    let body = decoder.decode()?;

    Ok(PendingInviteRequest {
        id: decoder.request_id().to_string(),
        tag: body.tag,
        message: body.message,
        public_key: body.public_key,
        created_at: record.timestamp,
    })
}

/// Answer one pending request: seal the channel to the requester's key and
/// broadcast the response to a uniformly random mirror.
pub async fn send_invite<T: Transport>(
    transport: &T,
    mirrors: &[MirrorId],
    request: &PendingInviteRequest,
    tag: &str,
    channel: &Channel,
) -> ChannelResult<()> {
    let encoder = InviteResponseEncoder::new(&request.id, tag, channel, &request.public_key)?;
    let mirror = choose_mirror(mirrors)?;

    info!(request = %request.id, channel = %channel.name, "Sending channel invite");
    transport.send(mirror, &encoder.transmission(), Vec::new()).await
}

/// What to do with a decoded invite; implemented per call site.
///
/// Returning `true` accepts the invite and terminates the scan; `false`
/// declines it but leaves the scan alive, so further responses to the same
/// request may still be offered.
pub trait InviteSink: Send + Sync {
    fn on_invite(&self, tag: &str, channel: Channel) -> bool;
}

/// Watches incoming traffic for responses to one outstanding request.
struct ResponseScanner {
    request_id: String,
    secret: X25519StaticSecret,
    sink: Arc<dyn InviteSink>,
}

impl ResponseScanner {
    /// Returns `Ok(true)` when an offered invite was accepted.
    fn try_record(&self, record: &Record) -> ChannelResult<bool> {
        if !record.content.starts_with(RESPONSE_PREFIX) {
            return Ok(false);
        }

        let decoder = InviteResponseDecoder::parse(&record.content)?;
        if decoder.request_id() != self.request_id {
            return Ok(false);
        }

        let body = decoder.decode(&self.secret)?;
        info!(request = %self.request_id, channel = %body.channel.name, "Invite response received");
        Ok(self.sink.on_invite(&body.tag, body.channel))
    }
}

#[async_trait]
impl RecordSink for ResponseScanner {
    async fn on_batch(&self, mut records: Vec<Record>) -> bool {
        sort_by_timestamp(&mut records);

        for record in records {
            match self.try_record(&record) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        message = %record.content,
                        timestamp = %record.timestamp,
                        error = %e,
                        "Invite scan error"
                    );
                }
            }
        }

        false
    }
}

/// Handle to a background invite-response scan.
///
/// The scan terminates on its own when an invite is accepted; `cancel`
/// stops it explicitly on decline-with-stop or application shutdown.
pub struct InviteScan {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl InviteScan {
    /// Stop the scan.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }

    /// Whether the scan task has exited (accepted, cancelled, or failed).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the scan task to exit.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Broadcast a join request and start the background response scan.
///
/// Generates an ephemeral keypair and a fresh request id, sends the encoded
/// request to a uniformly random mirror, and spawns a scanner that seeds
/// itself from history and then watches live traffic for a response whose
/// header id matches. Returns the request id and the scan handle.
pub async fn send_join_request<T: Transport + 'static>(
    transport: Arc<T>,
    mirrors: Vec<MirrorId>,
    config: SyncConfig,
    tag: &str,
    message: &str,
    sink: Arc<dyn InviteSink>,
) -> ChannelResult<(String, InviteScan)> {
    let keypair = ExchangeKeyPair::generate()?;
    let request_id = Uuid::new_v4().to_string();

    let encoder = JoinRequestEncoder::new(tag, message, &keypair.public_bytes());
    let transmission = encoder.transmission(&request_id);

    let cancel = CancellationToken::new();
    let scanner = ResponseScanner {
        request_id: request_id.clone(),
        secret: keypair.secret().clone(),
        sink,
    };
    let mut engine = SyncEngine::new(
        transport.clone(),
        mirrors.clone(),
        config,
        cancel.clone(),
    );

    let scan_id = request_id.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = engine.read_history().await {
            warn!(request = %scan_id, error = %e, "Invite scan failed to seed history");
            return;
        }
        if let Err(e) = engine.run(&scanner).await {
            warn!(request = %scan_id, error = %e, "Invite scan loop failed");
        }
    });

    let mirror = choose_mirror(&mirrors)?;
    info!(request = %request_id, "Sending channel join request");
    transport.send(mirror, &transmission, Vec::new()).await?;

    Ok((request_id, InviteScan { cancel, handle }))
}
