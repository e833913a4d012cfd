//! Connection handling for FrameNet
//!
//! Manages individual peer connections, including:
//! - The challenge/response handshake
//! - The framed read loop feeding the endpoint's inbound queue
//! - The in-order write loop draining the private outbound queue
//! - Connection state management
//!
//! A [`Connection`] is a cheap handle. The socket itself is owned by the
//! connection's I/O task on the event loop, so closing never races with an
//! in-flight read or write: the task observes the close signal and drops
//! the socket on the event-loop thread.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};

use super::DEFAULT_MAX_PENDING_UNVALIDATED;
use crate::protocol::handshake::{self, Challenge, CHALLENGE_LEN};
use crate::protocol::{CodecError, Decoder, Encoder, FrameLimits, Message, MessageKind};
use crate::sync::ThreadSafeQueue;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Server-assigned connection identifier
pub type ConnectionId = u64;

/// Which side of the handshake a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a server; authenticates the peer
    Server,
    /// Opened by a client; answers the server's challenge
    Client,
}

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket established, handshake not started
    Connecting,
    /// Challenge sent, waiting for the peer's response
    AwaitingValidation,
    /// Handshake complete, messages flowing
    Streaming,
    /// Socket closed; terminal
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// A received message together with the connection it arrived on.
///
/// `origin` is `None` for messages received by a client endpoint.
#[derive(Debug, Clone)]
pub struct OwnedMessage<T: MessageKind> {
    pub origin: Option<Connection<T>>,
    pub message: Message<T>,
}

impl<T: MessageKind> fmt::Display for OwnedMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.message, f)
    }
}

pub(crate) type Inbound<T> = Arc<ThreadSafeQueue<OwnedMessage<T>>>;

/// Invoked once on the event-loop thread after a server-side handshake succeeds
pub(crate) type ValidatedHook<T> = Box<dyn FnOnce(&Connection<T>) + Send>;

/// Per-connection settings derived from the endpoint configuration
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionOptions {
    pub limits: FrameLimits,
    pub handshake_timeout: Option<Duration>,
    /// Outbound queue cap until the handshake completes
    pub max_pending_unvalidated: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            limits: FrameLimits::default(),
            handshake_timeout: None,
            max_pending_unvalidated: DEFAULT_MAX_PENDING_UNVALIDATED,
        }
    }
}

struct Inner<T: MessageKind> {
    id: AtomicU64,
    role: Role,
    remote_addr: SocketAddr,
    state: Mutex<ConnectionState>,
    validated: AtomicBool,
    outbound: ThreadSafeQueue<Message<T>>,
    max_pending_unvalidated: usize,
    writer_wake: Notify,
    closed: watch::Sender<bool>,
    stats: StatCounters,
}

/// Handle to one peer connection
pub struct Connection<T: MessageKind> {
    inner: Arc<Inner<T>>,
}

impl<T: MessageKind> Connection<T> {
    #[cfg(test)]
    pub(crate) fn new(role: Role, remote_addr: SocketAddr) -> Self {
        Self::with_pending_limit(role, remote_addr, DEFAULT_MAX_PENDING_UNVALIDATED)
    }

    /// A connection whose outbound queue holds at most
    /// `max_pending_unvalidated` messages until the handshake completes
    pub(crate) fn with_pending_limit(
        role: Role,
        remote_addr: SocketAddr,
        max_pending_unvalidated: usize,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: AtomicU64::new(0),
                role,
                remote_addr,
                state: Mutex::new(ConnectionState::Connecting),
                validated: AtomicBool::new(false),
                outbound: ThreadSafeQueue::new(),
                max_pending_unvalidated,
                writer_wake: Notify::new(),
                closed,
                stats: StatCounters::default(),
            }),
        }
    }

    /// Connection id (0 until a server assigns one)
    pub fn id(&self) -> ConnectionId {
        self.inner.id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_id(&self, id: ConnectionId) {
        self.inner.id.store(id, Ordering::SeqCst);
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// True once the peer has passed the handshake (server role only)
    pub fn is_validated(&self) -> bool {
        self.inner.validated.load(Ordering::SeqCst)
    }

    /// Check if the underlying socket is still open
    pub fn is_connected(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    /// Messages queued but not yet written
    pub fn pending_messages(&self) -> usize {
        self.inner.outbound.len()
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        let stats = &self.inner.stats;
        ConnectionStats {
            messages_sent: stats.messages_sent.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: stats.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Queue a message for sending.
    ///
    /// Messages are written in queue order once the handshake completes.
    /// Until then at most `max_pending_unvalidated` messages are held and
    /// further ones are dropped. Sending on a closed connection is a no-op.
    pub fn send(&self, message: Message<T>) {
        let limit = match self.state() {
            ConnectionState::Closed => {
                tracing::debug!("Dropping {} for closed connection {}", message, self.id());
                return;
            }
            ConnectionState::Streaming => usize::MAX,
            ConnectionState::Connecting | ConnectionState::AwaitingValidation => {
                self.inner.max_pending_unvalidated
            }
        };

        match self.inner.outbound.push_back_bounded(message, limit) {
            Ok(true) => self.inner.writer_wake.notify_one(),
            Ok(false) => {}
            Err(message) => tracing::warn!(
                "[{}] Dropping {}: {} messages already queued before validation",
                self.id(),
                message,
                limit
            ),
        }
    }

    /// Close the connection.
    ///
    /// The socket is released by the I/O task on the event loop. Safe to
    /// call more than once.
    pub fn disconnect(&self) {
        if self.close() {
            tracing::info!("Connection {} ({}) disconnected", self.id(), self.remote_addr());
        }
    }

    /// Move to Closed, returning false if already closed
    fn close(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
        }
        self.inner.closed.send_replace(true);
        self.inner.outbound.clear();
        true
    }

    /// Advance the state unless the connection has already closed
    fn advance(&self, next: ConnectionState) {
        let mut state = self.inner.state.lock();
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    /// Drive the connection: handshake, then the read and write loops.
    ///
    /// Runs on the event loop until the peer goes away, an I/O error
    /// occurs, or `disconnect` is called.
    pub(crate) async fn run<S>(
        self,
        mut stream: S,
        inbound: Inbound<T>,
        options: ConnectionOptions,
        on_validated: Option<ValidatedHook<T>>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _guard = CloseGuard(self.clone());
        let mut closed = self.inner.closed.subscribe();

        let outcome = tokio::select! {
            outcome = self.handshake(&mut stream, options.handshake_timeout) => outcome,
            _ = wait_closed(&mut closed) => return,
        };

        if let Err(e) = outcome {
            match self.role() {
                Role::Server => tracing::debug!(
                    "Connection {} ({}) rejected: {}",
                    self.id(),
                    self.remote_addr(),
                    e
                ),
                Role::Client => tracing::warn!("Handshake with {} failed: {}", self.remote_addr(), e),
            }
            return;
        }

        if let Some(hook) = on_validated {
            hook(&self);
        }
        self.advance(ConnectionState::Streaming);

        let (reader, writer) = tokio::io::split(stream);
        tokio::join!(
            self.read_loop(reader, &inbound, options.limits, closed.clone()),
            self.write_loop(writer, options.limits, closed),
        );
    }

    async fn handshake<S>(&self, stream: &mut S, timeout: Option<Duration>) -> ConnectionResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            match self.role() {
                Role::Server => self.handshake_server(stream).await,
                Role::Client => self.handshake_client(stream).await,
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| ConnectionError::Timeout)?,
            None => exchange.await,
        }
    }

    /// Perform the server-side handshake
    pub(crate) async fn handshake_server<S>(&self, stream: &mut S) -> ConnectionResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let challenge = handshake::generate_challenge();
        stream.write_all(&challenge).await?;
        stream.flush().await?;
        self.advance(ConnectionState::AwaitingValidation);

        let mut response: Challenge = [0u8; CHALLENGE_LEN];
        stream.read_exact(&mut response).await?;

        if !handshake::verify(&challenge, &response) {
            return Err(ConnectionError::HandshakeFailed(
                "Challenge response mismatch".to_string(),
            ));
        }

        self.inner.validated.store(true, Ordering::SeqCst);
        tracing::info!("Connection {} ({}) validated", self.id(), self.remote_addr());
        Ok(())
    }

    /// Perform the client-side handshake
    pub(crate) async fn handshake_client<S>(&self, stream: &mut S) -> ConnectionResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut challenge: Challenge = [0u8; CHALLENGE_LEN];
        stream.read_exact(&mut challenge).await?;

        stream.write_all(&handshake::transform(&challenge)).await?;
        stream.flush().await?;

        tracing::info!("Handshake complete with {}", self.remote_addr());
        Ok(())
    }

    async fn read_loop<R>(
        &self,
        mut reader: R,
        inbound: &ThreadSafeQueue<OwnedMessage<T>>,
        limits: FrameLimits,
        mut closed: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut decoder = Decoder::new(limits);
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(message)) => self.deliver(inbound, message),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("[{}] Read failed: {}", self.id(), e);
                        self.close();
                        return;
                    }
                }
            }

            let read = tokio::select! {
                read = reader.read_buf(&mut buf) => read,
                _ = wait_closed(&mut closed) => return,
            };

            match read {
                Ok(0) => {
                    tracing::info!("Connection {} closed by peer", self.id());
                    self.close();
                    return;
                }
                Ok(n) => {
                    self.inner
                        .stats
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!("[{}] Read failed: {}", self.id(), e);
                    self.close();
                    return;
                }
            }
        }
    }

    fn deliver(&self, inbound: &ThreadSafeQueue<OwnedMessage<T>>, message: Message<T>) {
        self.inner
            .stats
            .messages_received
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!("[{}] Received {}", self.id(), message);

        let origin = match self.role() {
            Role::Server => Some(self.clone()),
            Role::Client => None,
        };
        inbound.push_back(OwnedMessage { origin, message });
    }

    async fn write_loop<W>(&self, mut writer: W, limits: FrameLimits, mut closed: watch::Receiver<bool>)
    where
        W: AsyncWrite + Unpin,
    {
        let encoder = Encoder::new(limits);
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            buf.clear();
            let encoded = self
                .inner
                .outbound
                .with_front(|message| encoder.encode(message, &mut buf));

            match encoded {
                None => {
                    tokio::select! {
                        _ = self.inner.writer_wake.notified() => continue,
                        _ = wait_closed(&mut closed) => return,
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("[{}] Dropping outbound message: {}", self.id(), e);
                    self.inner.outbound.pop_front();
                }
                Some(Ok(())) => {
                    let written = tokio::select! {
                        written = write_frame(&mut writer, &buf) => written,
                        _ = wait_closed(&mut closed) => return,
                    };

                    if let Err(e) = written {
                        tracing::warn!("[{}] Write failed: {}", self.id(), e);
                        self.close();
                        return;
                    }

                    self.inner.outbound.pop_front();
                    let stats = &self.inner.stats;
                    stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    stats.bytes_sent.fetch_add(buf.len() as u64, Ordering::Relaxed);
                }
            }
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Marks the connection closed when its I/O task ends or is dropped
struct CloseGuard<T: MessageKind>(Connection<T>);

impl<T: MessageKind> Drop for CloseGuard<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl<T: MessageKind> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: MessageKind> PartialEq for Connection<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: MessageKind> Eq for Connection<T> {}

impl<T: MessageKind> Hash for Connection<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl<T: MessageKind> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("remote_addr", &self.remote_addr())
            .field("state", &self.state())
            .finish()
    }
}
