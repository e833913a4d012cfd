//! FrameNet - message-oriented TCP endpoints
//!
//! A process acts as a multi-connection [`Server`] or a single-connection
//! [`Client`]. Both exchange typed, size-prefixed [`Message`]s and screen
//! peers with a short challenge/response handshake before any message
//! flows. Socket I/O runs on one background thread per endpoint; the
//! application pumps received messages on its own thread.

pub mod config;
pub mod network;
pub mod protocol;
pub mod sync;

pub use network::{
    AddressCounter, Client, ClientError, Connection, ConnectionId, ConnectionState, NetworkConfig,
    OwnedMessage, Server, ServerError, ServerHooks,
};
pub use protocol::{Message, MessageError, MessageKind, OversizePolicy};
pub use sync::ThreadSafeQueue;
