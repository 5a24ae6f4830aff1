//! Line protocol stack for both broker planes.
//!
//! Providers and subscribers both speak newline-delimited UTF-8 text over
//! Unix domain sockets; the planes differ only in vocabulary and socket
//! permissions.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Commands / Replies           │  command
//! ├─────────────────────────────────────────┤
//! │          Line framing (8 KiB max)       │  LinesCodec
//! ├─────────────────────────────────────────┤
//! │          UDS transport (dual)           │  socket_manager
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`error`]: Protocol error types ([`ProtocolError`], [`ProtocolResult`])
//! - [`command`]: Command parsing and reply rendering for both planes
//! - [`outbox`]: Per-session bounded outbound queues ([`SessionOutbox`])
//! - [`socket_manager`]: Dual-socket bind/accept ([`SocketManager`])

pub mod command;
pub mod error;
pub mod outbox;
pub mod socket_manager;

// Re-export commonly used types at module level
pub use command::{
    error_line, parse_provider_line, parse_subscriber_line, providers_reply, push_line,
    value_reply, ProviderCommand, SubscriberCommand,
};
pub use error::{MAX_LINE_LENGTH, ProtocolError, ProtocolResult};
pub use outbox::{frame, ChannelSink, SessionOutbox, SessionSender, SessionSink, TrySendResult};
pub use socket_manager::{SocketManager, SocketManagerConfig, SocketType};
