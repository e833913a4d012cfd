//! FrameNet Client
//!
//! Connects to a FrameNet server and handles message exchange. Received
//! messages land in the queue returned by [`Client::incoming`]; the caller
//! drains it on its own thread.

use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;

use super::connection::{Connection, OwnedMessage, Role};
use super::event_loop::EventLoop;
use super::{resolve_host, NetworkConfig};
use crate::protocol::{Message, MessageKind};
use crate::sync::ThreadSafeQueue;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// FrameNet Client
pub struct Client<T: MessageKind> {
    /// Client configuration
    config: NetworkConfig,
    inbound: Arc<ThreadSafeQueue<OwnedMessage<T>>>,
    connection: Option<Connection<T>>,
    event_loop: Option<EventLoop>,
}

impl<T: MessageKind> Client<T> {
    /// Create a new client
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            inbound: Arc::new(ThreadSafeQueue::new()),
            connection: None,
            event_loop: None,
        }
    }

    /// Connect to a server by hostname.
    ///
    /// Returns once the TCP connection is established; the handshake then
    /// completes in the background. No retry is attempted.
    pub fn connect(&mut self, host: &str, port: u16) -> ClientResult<()> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }
        // Clear out a connection the server has already dropped
        self.disconnect();

        let event_loop = EventLoop::start("framenet-client")?;
        let timeout = self.config.connect_timeout();
        let host = host.to_string();

        let (stream, addr) = event_loop
            .block_on(async move {
                let addr = resolve_host(&host, port).await?;
                tracing::info!("Connecting to {}", addr);

                let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| ClientError::Timeout)??;
                Ok::<_, ClientError>((stream, addr))
            })
            .ok_or(ClientError::NotConnected)??;

        let options = self.config.connection_options();
        let conn = Connection::with_pending_limit(Role::Client, addr, options.max_pending_unvalidated);
        event_loop.spawn(conn.clone().run(stream, self.inbound.clone(), options, None));

        tracing::info!("Connected to {}", addr);
        self.connection = Some(conn);
        self.event_loop = Some(event_loop);
        Ok(())
    }

    /// Close the connection and stop the event loop.
    ///
    /// Safe to call more than once; also runs on drop.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.disconnect();
        }
        if let Some(mut event_loop) = self.event_loop.take() {
            event_loop.stop();
            tracing::info!("Client disconnected");
        }
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map_or(false, |conn| conn.is_connected())
    }

    /// Send a message to the server. Does nothing when not connected.
    pub fn send(&self, message: Message<T>) {
        match &self.connection {
            Some(conn) => conn.send(message),
            None => tracing::debug!("Not connected, dropping {}", message),
        }
    }

    /// Queue of messages received from the server
    pub fn incoming(&self) -> Arc<ThreadSafeQueue<OwnedMessage<T>>> {
        self.inbound.clone()
    }

    /// Handle to the current connection, if any
    pub fn connection(&self) -> Option<&Connection<T>> {
        self.connection.as_ref()
    }
}

impl<T: MessageKind> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
