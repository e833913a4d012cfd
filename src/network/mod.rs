//! Network module - Handles TCP communication between endpoints
//!
//! Provides:
//! - Server for accepting incoming connections
//! - Client for connecting to servers
//! - Connection management and message routing

mod client;
mod connection;
mod event_loop;
mod limiter;
mod server;

pub use client::*;
pub use connection::*;
pub use limiter::*;
pub use server::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{FrameLimits, OversizePolicy, DEFAULT_ID_BASE, DEFAULT_MAX_MESSAGE_SIZE};

/// Messages a connection may queue before its handshake completes
pub const DEFAULT_MAX_PENDING_UNVALIDATED: usize = 64;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Address the server binds to
    pub bind_address: String,
    /// First id handed out by a server
    pub id_base: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Handshake timeout in milliseconds; `None` waits forever
    pub handshake_timeout_ms: Option<u64>,
    /// Maximum message body size
    pub max_message_size: usize,
    /// What to do with bodies above `max_message_size`
    pub oversize_policy: OversizePolicy,
    /// Outbound messages held for a peer that has not finished the
    /// handshake; later sends are dropped
    pub max_pending_unvalidated: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            id_base: DEFAULT_ID_BASE,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            oversize_policy: OversizePolicy::Reject,
            max_pending_unvalidated: DEFAULT_MAX_PENDING_UNVALIDATED,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_handshake_timeout(mut self, timeout_ms: u64) -> Self {
        self.handshake_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_limits(mut self, max_message_size: usize, policy: OversizePolicy) -> Self {
        self.max_message_size = max_message_size;
        self.oversize_policy = policy;
        self
    }

    pub fn with_pending_limit(mut self, max_pending_unvalidated: usize) -> Self {
        self.max_pending_unvalidated = max_pending_unvalidated;
        self
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_message_size: self.max_message_size,
            oversize_policy: self.oversize_policy,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            limits: self.frame_limits(),
            handshake_timeout: self.handshake_timeout(),
            max_pending_unvalidated: self.max_pending_unvalidated,
        }
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
