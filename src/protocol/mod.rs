//! Protocol module - Defines the wire protocol for FrameNet communication
//!
//! Every message travels as a fixed header followed by a raw body:
//! - 4 bytes message kind ordinal (host byte order)
//! - 4 bytes body length (host byte order)
//! - `body length` bytes of payload
//!
//! Before any message flows, the server screens the peer with an
//! 8-byte challenge/response exchange (see [`handshake`]).

mod codec;
pub mod handshake;
mod message;

pub use codec::*;
pub use message::*;

/// Default port for FrameNet endpoints
pub const DEFAULT_PORT: u16 = 60000;

/// Size of the framed message header: kind(4) + length(4)
pub const HEADER_SIZE: usize = 8;

/// First connection id handed out by a server
pub const DEFAULT_ID_BASE: u64 = 10000;

/// Default upper bound for a single message body (10 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
