//! Backchannel Core Library
//!
//! Covert multi-party messaging tunneled through a public, append-only
//! message feed. The feed (a "mirror") offers only two primitives: append a
//! record, and fetch the newest N records. Everything else is built on top:
//!
//! - **Sync**: a linear self-terminating probe turns limit-only queries into
//!   an exactly-once live feed of new records ([`sync::SyncEngine`])
//! - **Channels**: named symmetric keys; messages are ChaCha20-Poly1305
//!   packets hidden among ordinary feed traffic ([`message`])
//! - **Invitations**: ephemeral X25519 key exchange over the same feed lets
//!   a stranger request and receive channel state without any side channel
//!   ([`exchange`])
//! - **Attachments**: encrypted files and an oversized-text carrier keep
//!   arbitrary payloads within the platform's text budget ([`carrier`])
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use backchannel_core::{
//!     Channel, ConsoleSink, MessageService, MirrorId, SyncConfig, SyncEngine,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(transport: Arc<impl backchannel_core::Transport>) -> backchannel_core::ChannelResult<()> {
//! let channel = Channel::create("ops");
//! let mirrors = vec![MirrorId::new("general")];
//!
//! let sink = Arc::new(ConsoleSink::new(channel.id.as_str()));
//! let service = MessageService::new(transport.clone(), mirrors.clone(), channel, sink);
//!
//! service.send("alice", "rendezvous at dawn", Vec::new()).await?;
//!
//! let mut engine = SyncEngine::new(
//!     transport,
//!     mirrors,
//!     SyncConfig::default(),
//!     CancellationToken::new(),
//! );
//! service.start(&mut engine).await?;
//! # Ok(())
//! # }
//! ```

pub mod carrier;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod exchange;
pub mod message;
pub mod sync;
pub mod transport;

// Re-exports
pub use carrier::{Attachment, ATTACHMENT_SENTINEL, TEXT_LIMIT};
pub use channel::{Channel, ChannelId, ChannelRecord};
pub use config::SyncConfig;
pub use crypto::ChannelCrypto;
pub use error::{ChannelError, ChannelResult};
pub use exchange::{
    scan_requests, send_invite, send_join_request, InviteScan, InviteSink, PendingInviteRequest,
};
pub use message::{
    ConsoleSink, DecodedMessage, MessageDecoder, MessageEncoder, MessageService, MessageSink,
    SeenIvSet,
};
pub use sync::{MessageLog, RecordSink, SyncEngine};
pub use transport::{memory::MemoryTransport, AttachmentRef, MirrorId, OutgoingFile, Record, Transport};
