//! Join-request and invite-response packet codecs
//!
//! ## Wire Format
//!
//! Request:
//!
//! ```text
//! (join) request-id
//! base64(tag) base64(message)
//! base64(ephemeral-public-key)
//! ```
//!
//! Response:
//!
//! ```text
//! (invite) request-id
//! base64(tag) sealed-envelope
//! ```
//!
//! where the sealed envelope is the asymmetric encryption, under the
//! requester's ephemeral public key, of the versioned channel record.

use crate::channel::{Channel, ChannelRecord};
use crate::error::{ChannelError, ChannelResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use x25519_dalek::StaticSecret as X25519StaticSecret;

use super::sealed::{parse_public_key, serialize_public_key, SealedEnvelope};

/// Channel join request identifying start text
pub const REQUEST_PREFIX: &str = "(join)";

/// Channel invite (join response) identifying start text
pub const RESPONSE_PREFIX: &str = "(invite)";

fn encode_field(value: &str) -> String {
    BASE64.encode(value.as_bytes())
}

fn decode_field(encoded: &str, what: &str) -> ChannelResult<String> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| ChannelError::MalformedPacket(format!("Invalid base64 {}: {}", what, e)))?;
    String::from_utf8(bytes)
        .map_err(|e| ChannelError::MalformedPacket(format!("{} is not UTF-8: {}", what, e)))
}

/// Split a packet into its header line and body, returning the id token.
fn split_packet(packet: &str, prefix: &str) -> ChannelResult<(String, String)> {
    if !packet.starts_with(prefix) {
        return Err(ChannelError::MalformedPacket(format!(
            "Missing {} prefix",
            prefix
        )));
    }
    let (header, body) = packet.split_once('\n').ok_or_else(|| {
        ChannelError::MalformedPacket("Packet has no body".to_string())
    })?;
    let (_, id) = header.rsplit_once(' ').ok_or_else(|| {
        ChannelError::MalformedPacket("Header has no request id".to_string())
    })?;
    Ok((id.to_string(), body.to_string()))
}

/// Encoder for an outbound join request.
pub struct JoinRequestEncoder {
    tag: String,
    message: String,
    public_key: String,
}

impl JoinRequestEncoder {
    pub fn new(tag: &str, message: &str, public_key: &[u8; 32]) -> Self {
        Self {
            tag: encode_field(tag),
            message: encode_field(message),
            public_key: serialize_public_key(public_key),
        }
    }

    /// Header line: `"(join) " + request_id`.
    pub fn header(&self, request_id: &str) -> String {
        format!("{} {}", REQUEST_PREFIX, request_id)
    }

    /// Body: sender info line, then the serialized public key.
    pub fn encode(&self) -> String {
        format!("{} {}\n{}", self.tag, self.message, self.public_key)
    }

    /// Full transmission text.
    pub fn transmission(&self, request_id: &str) -> String {
        format!("{}\n{}", self.header(request_id), self.encode())
    }
}

/// Decoded join-request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequestBody {
    pub tag: String,
    pub message: String,
    pub public_key: [u8; 32],
}

/// Decoder for a received join request.
pub struct JoinRequestDecoder {
    request_id: String,
    body: String,
}

impl JoinRequestDecoder {
    pub fn parse(packet: &str) -> ChannelResult<Self> {
        let (request_id, body) = split_packet(packet, REQUEST_PREFIX)?;
        Ok(Self { request_id, body })
    }

    /// Request id from the header.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Decode tag, message, and ephemeral public key.
    pub fn decode(&self) -> ChannelResult<JoinRequestBody> {
        let (sender_info, public_key) = self.body.split_once('\n').ok_or_else(|| {
            ChannelError::MalformedPacket("Request body has no public key line".to_string())
        })?;
        let (tag, message) = sender_info.split_once(' ').ok_or_else(|| {
            ChannelError::MalformedPacket("Request body has no message field".to_string())
        })?;

        Ok(JoinRequestBody {
            tag: decode_field(tag, "tag")?,
            message: decode_field(message, "message")?,
            public_key: parse_public_key(public_key)?,
        })
    }
}

/// Encoder for an outbound invite response.
pub struct InviteResponseEncoder {
    request_id: String,
    tag: String,
    sealed_channel: String,
}

impl InviteResponseEncoder {
    /// Seal the channel record to the requester's ephemeral public key.
    pub fn new(
        request_id: &str,
        tag: &str,
        channel: &Channel,
        requester_pk: &[u8; 32],
    ) -> ChannelResult<Self> {
        let record = channel.to_record().encode()?;
        let sealed = SealedEnvelope::seal(&record, requester_pk)?;

        Ok(Self {
            request_id: request_id.to_string(),
            tag: encode_field(tag),
            sealed_channel: sealed.encode()?,
        })
    }

    /// Header line: `"(invite) " + request_id`.
    pub fn header(&self) -> String {
        format!("{} {}", RESPONSE_PREFIX, self.request_id)
    }

    /// Body: tag field, then the sealed channel ciphertext.
    pub fn encode(&self) -> String {
        format!("{} {}", self.tag, self.sealed_channel)
    }

    /// Full transmission text.
    pub fn transmission(&self) -> String {
        format!("{}\n{}", self.header(), self.encode())
    }
}

/// Decoded invite-response body.
#[derive(Debug, Clone)]
pub struct InviteResponseBody {
    pub tag: String,
    pub channel: Channel,
}

/// Decoder for a received invite response.
pub struct InviteResponseDecoder {
    request_id: String,
    body: String,
}

impl InviteResponseDecoder {
    pub fn parse(packet: &str) -> ChannelResult<Self> {
        let (request_id, body) = split_packet(packet, RESPONSE_PREFIX)?;
        Ok(Self { request_id, body })
    }

    /// Request id from the header; a requester only decrypts responses whose
    /// id matches its own outstanding request.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Open the sealed channel with the requester's ephemeral private key.
    pub fn decode(&self, secret: &X25519StaticSecret) -> ChannelResult<InviteResponseBody> {
        let (tag, sealed) = self.body.split_once(' ').ok_or_else(|| {
            ChannelError::MalformedPacket("Response body has no ciphertext field".to_string())
        })?;

        let envelope = SealedEnvelope::decode(sealed)?;
        let record_bytes = envelope.open(secret)?;
        let record = ChannelRecord::decode(&record_bytes)?;

        Ok(InviteResponseBody {
            tag: decode_field(tag, "tag")?,
            channel: Channel::from_record(record),
        })
    }
}
