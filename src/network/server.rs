//! FrameNet Server
//!
//! The server accepts connections from clients, screens them with the
//! challenge handshake, and hands their messages to the application
//! through [`Server::update`]. Policy lives in a [`ServerHooks`]
//! implementation supplied at construction.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;

use super::connection::{
    Connection, ConnectionId, ConnectionOptions, Inbound, OwnedMessage, Role, ValidatedHook,
};
use super::event_loop::EventLoop;
use super::NetworkConfig;
use crate::protocol::{Message, MessageKind};
use crate::sync::ThreadSafeQueue;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Application callbacks invoked by a [`Server`]
///
/// `on_client_connect`, `on_client_validated` and sometimes
/// `on_client_disconnect` run on the event-loop thread and must not block.
/// `on_message` runs on whichever thread calls [`Server::update`].
pub trait ServerHooks<T: MessageKind>: Send + Sync + 'static {
    /// Decide whether to keep a freshly accepted socket.
    ///
    /// Runs before the handshake and before an id is assigned. Messages
    /// sent here are written once the handshake succeeds.
    fn on_client_connect(&self, _connection: &Connection<T>) -> bool {
        true
    }

    /// The peer answered the challenge correctly
    fn on_client_validated(&self, _connection: &Connection<T>) {}

    /// A dead connection was removed from the server. Fires once per
    /// registered connection, including ones that failed the handshake.
    fn on_client_disconnect(&self, _connection: &Connection<T>) {}

    /// An inbound message dispatched by [`Server::update`]
    fn on_message(&self, _server: &Server<T>, _origin: &Connection<T>, _message: Message<T>) {}
}

impl<T: MessageKind, H: ServerHooks<T>> ServerHooks<T> for Arc<H> {
    fn on_client_connect(&self, connection: &Connection<T>) -> bool {
        (**self).on_client_connect(connection)
    }

    fn on_client_validated(&self, connection: &Connection<T>) {
        (**self).on_client_validated(connection)
    }

    fn on_client_disconnect(&self, connection: &Connection<T>) {
        (**self).on_client_disconnect(connection)
    }

    fn on_message(&self, server: &Server<T>, origin: &Connection<T>, message: Message<T>) {
        (**self).on_message(server, origin, message)
    }
}

/// Hooks that accept every client and ignore every event
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl<T: MessageKind> ServerHooks<T> for AcceptAll {}

/// State shared between the server handle and its accept loop
struct Shared<T: MessageKind> {
    hooks: Box<dyn ServerHooks<T>>,
    connections: Mutex<BTreeMap<ConnectionId, Connection<T>>>,
    inbound: Inbound<T>,
    next_id: AtomicU64,
    options: ConnectionOptions,
}

impl<T: MessageKind> Shared<T> {
    /// Split the table into live handles, removing and reporting dead ones
    fn live_connections(&self) -> Vec<Connection<T>> {
        let mut live = Vec::new();
        let mut dead = Vec::new();
        {
            let connections = self.connections.lock();
            for conn in connections.values() {
                if conn.is_connected() {
                    live.push(conn.clone());
                } else {
                    dead.push(conn.clone());
                }
            }
        }
        self.remove_dead(dead);
        live
    }

    fn purge(&self) {
        let mut dead = Vec::new();
        self.connections.lock().retain(|_, conn| {
            if conn.is_connected() {
                return true;
            }
            dead.push(conn.clone());
            false
        });
        self.report_disconnected(&dead);
    }

    /// Remove the given connections if they are still registered
    fn remove_dead(&self, dead: Vec<Connection<T>>) {
        if dead.is_empty() {
            return;
        }
        let mut removed = Vec::with_capacity(dead.len());
        {
            let mut connections = self.connections.lock();
            for conn in dead {
                if connections.get(&conn.id()) == Some(&conn) {
                    connections.remove(&conn.id());
                    removed.push(conn);
                }
            }
        }
        self.report_disconnected(&removed);
    }

    // Hooks run with the table unlocked so they may call back into the server.
    fn report_disconnected(&self, removed: &[Connection<T>]) {
        for conn in removed {
            tracing::info!("Client {} ({}) removed", conn.id(), conn.remote_addr());
            self.hooks.on_client_disconnect(conn);
        }
    }
}

/// Assign the next id, add the connection to the table and build its
/// validation callback
fn register<T: MessageKind>(shared: &Arc<Shared<T>>, conn: &Connection<T>) -> ValidatedHook<T> {
    conn.set_id(shared.next_id.fetch_add(1, Ordering::SeqCst));
    shared.connections.lock().insert(conn.id(), conn.clone());

    let shared = Arc::clone(shared);
    Box::new(move |conn: &Connection<T>| shared.hooks.on_client_validated(conn))
}

/// FrameNet Server
pub struct Server<T: MessageKind> {
    /// Server configuration
    config: NetworkConfig,
    shared: Arc<Shared<T>>,
    event_loop: Option<EventLoop>,
    local_addr: Option<SocketAddr>,
}

impl<T: MessageKind> Server<T> {
    /// Create a new server
    pub fn new(config: NetworkConfig, hooks: impl ServerHooks<T>) -> Self {
        let shared = Arc::new(Shared {
            hooks: Box::new(hooks),
            connections: Mutex::new(BTreeMap::new()),
            inbound: Arc::new(ThreadSafeQueue::new()),
            next_id: AtomicU64::new(config.id_base),
            options: config.connection_options(),
        });

        Self {
            config,
            shared,
            event_loop: None,
            local_addr: None,
        }
    }

    /// Bind to `port` and start accepting connections.
    ///
    /// Port 0 picks a free port; the bound address is returned.
    pub fn start(&mut self, port: u16) -> ServerResult<SocketAddr> {
        if self.event_loop.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let event_loop = EventLoop::start("framenet-server")?;

        let bind_addr = format!("{}:{}", self.config.bind_address, port);
        let listener = event_loop
            .block_on({
                let bind_addr = bind_addr.clone();
                async move { TcpListener::bind(bind_addr).await }
            })
            .ok_or(ServerError::NotRunning)?
            .map_err(|e| ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        event_loop.spawn(accept_loop(listener, self.shared.clone()));

        self.event_loop = Some(event_loop);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop the server.
    ///
    /// Closes every connection and joins the event-loop thread. Dead
    /// connections are reported to `on_client_disconnect` before returning.
    pub fn stop(&mut self) {
        if let Some(mut event_loop) = self.event_loop.take() {
            event_loop.stop();
            self.local_addr = None;
            self.shared.purge();
            tracing::info!("Server stopped");
        }
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.event_loop.is_some()
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of registered connections, live or not yet purged
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Look up a registered connection by id
    pub fn get_client(&self, id: ConnectionId) -> Option<Connection<T>> {
        self.shared.connections.lock().get(&id).cloned()
    }

    /// Send a message to a specific client.
    ///
    /// A dead connection is removed instead and reported to
    /// `on_client_disconnect`.
    pub fn send_to_client(&self, connection: &Connection<T>, message: Message<T>) {
        if connection.is_connected() {
            connection.send(message);
            return;
        }
        self.shared.remove_dead(vec![connection.clone()]);
    }

    /// Send `message` to every live connection in `targets`.
    ///
    /// With `ignore_initiator`, `initiator` is skipped. Dead connections
    /// met along the way are purged once the pass has finished.
    pub fn broadcast_message(
        &self,
        message: &Message<T>,
        targets: &[Connection<T>],
        initiator: Option<&Connection<T>>,
        ignore_initiator: bool,
    ) {
        let mut dead = Vec::new();
        {
            let connections = self.shared.connections.lock();
            for conn in connections.values() {
                if !conn.is_connected() {
                    dead.push(conn.clone());
                    continue;
                }
                if ignore_initiator && initiator == Some(conn) {
                    continue;
                }
                if targets.contains(conn) {
                    conn.send(message.clone());
                }
            }
        }
        self.shared.remove_dead(dead);
    }

    /// Snapshot of live connections, ordered by id
    pub fn get_online_clients(&self) -> Vec<Connection<T>> {
        self.shared.live_connections()
    }

    /// Snapshot of live connection ids
    pub fn get_online_clients_id(&self) -> BTreeSet<ConnectionId> {
        self.shared
            .live_connections()
            .iter()
            .map(Connection::id)
            .collect()
    }

    /// Dispatch up to `max_messages` inbound messages to `on_message`.
    ///
    /// With `wait`, blocks until at least one message is queued. Returns the
    /// number of messages dispatched.
    pub fn update(&self, max_messages: usize, wait: bool) -> usize {
        if wait {
            self.shared.inbound.wait();
        }

        self.shared.purge();

        let mut dispatched = 0;
        while dispatched < max_messages {
            let Some(OwnedMessage { origin, message }) = self.shared.inbound.pop_front() else {
                break;
            };
            dispatched += 1;

            match origin {
                Some(origin) => self.shared.hooks.on_message(self, &origin, message),
                None => tracing::warn!("Dropping {} with no origin", message),
            }
        }

        self.shared.purge();
        dispatched
    }

    /// Inbound messages not yet dispatched
    pub fn pending_messages(&self) -> usize {
        self.shared.inbound.len()
    }
}

impl<T: MessageKind> Drop for Server<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Delay before accepting again after a failed accept (e.g. EMFILE)
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

async fn accept_loop<T: MessageKind>(listener: TcpListener, shared: Arc<Shared<T>>) {
    let listener = &listener;
    loop {
        let (stream, addr) = accept_with_retry(move || listener.accept()).await;
        shared.purge();
        tracing::info!("New connection from {}", addr);

        let conn = Connection::with_pending_limit(
            Role::Server,
            addr,
            shared.options.max_pending_unvalidated,
        );
        if !shared.hooks.on_client_connect(&conn) {
            tracing::warn!("Connection from {} denied", addr);
            continue;
        }

        let on_validated = register(&shared, &conn);
        tracing::info!("Connection {} established with {}", conn.id(), addr);

        tokio::spawn(conn.run(
            stream,
            shared.inbound.clone(),
            shared.options,
            Some(on_validated),
        ));
    }
}

/// Keep calling `accept` until it succeeds, pausing after each error
async fn accept_with_retry<S, F, Fut>(mut accept: F) -> S
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<S>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::{self, CHALLENGE_LEN};
    use crate::protocol::HEADER_SIZE;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        deny: AtomicBool,
        connects: AtomicUsize,
        validated: Mutex<Vec<ConnectionId>>,
        disconnected: Mutex<Vec<ConnectionId>>,
        received: Mutex<Vec<(ConnectionId, u32, Vec<u8>)>>,
        echo: AtomicBool,
    }

    impl ServerHooks<u32> for Recorder {
        fn on_client_connect(&self, _connection: &Connection<u32>) -> bool {
            self.connects.fetch_add(1, Ordering::SeqCst);
            !self.deny.load(Ordering::SeqCst)
        }

        fn on_client_validated(&self, connection: &Connection<u32>) {
            self.validated.lock().push(connection.id());
        }

        fn on_client_disconnect(&self, connection: &Connection<u32>) {
            self.disconnected.lock().push(connection.id());
        }

        fn on_message(&self, server: &Server<u32>, origin: &Connection<u32>, message: Message<u32>) {
            self.received
                .lock()
                .push((origin.id(), message.kind(), message.body().to_vec()));
            if self.echo.load(Ordering::SeqCst) {
                server.send_to_client(origin, message);
            }
        }
    }

    fn start_server(recorder: &Arc<Recorder>) -> (Server<u32>, SocketAddr) {
        start_server_with(recorder, NetworkConfig::default())
    }

    fn start_server_with(recorder: &Arc<Recorder>, config: NetworkConfig) -> (Server<u32>, SocketAddr) {
        let config = NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            ..config
        };
        let mut server = Server::new(config, recorder.clone());
        let addr = server.start(0).unwrap();
        (server, addr)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "Condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Connect a raw socket and answer the challenge
    fn raw_client(addr: SocketAddr, correct: bool) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut challenge = [0u8; CHALLENGE_LEN];
        stream.read_exact(&mut challenge).unwrap();
        let mut response = handshake::transform(&challenge);
        if !correct {
            response[0] ^= 0xFF;
        }
        stream.write_all(&response).unwrap();
        stream
    }

    fn write_frame(stream: &mut TcpStream, kind: u32, body: &[u8]) {
        let mut frame = Vec::new();
        frame.extend_from_slice(&kind.to_ne_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        frame.extend_from_slice(body);
        stream.write_all(&frame).unwrap();
    }

    fn read_frame(stream: &mut TcpStream) -> (u32, Vec<u8>) {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).unwrap();
        let kind = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        (kind, body)
    }

    fn connection_for(server: &Server<u32>, stream: &TcpStream) -> Connection<u32> {
        let local = stream.local_addr().unwrap();
        server
            .get_online_clients()
            .into_iter()
            .find(|conn| conn.remote_addr() == local)
            .unwrap()
    }

    fn message(kind: u32, body: &[u8]) -> Message<u32> {
        Message::from_parts(kind, body.to_vec()).unwrap()
    }

    #[test]
    fn test_start_and_stop() {
        let recorder = Arc::new(Recorder::default());
        let (mut server, addr) = start_server(&recorder);

        assert!(server.is_running());
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(server.start(0), Err(ServerError::AlreadyRunning)));

        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
        server.stop();
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let recorder = Arc::new(Recorder::default());
        let (_server, addr) = start_server(&recorder);

        let config = NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        };
        let mut second: Server<u32> = Server::new(config, AcceptAll);
        assert!(matches!(second.start(addr.port()), Err(ServerError::BindFailed(_))));
        assert!(!second.is_running());
    }

    #[test]
    fn test_valid_client_is_validated_with_first_id() {
        let recorder = Arc::new(Recorder::default());
        let (server, addr) = start_server(&recorder);

        let _client = raw_client(addr, true);
        wait_for(|| recorder.validated.lock().len() == 1);

        assert_eq!(*recorder.validated.lock(), vec![10000]);
        assert_eq!(server.get_online_clients_id(), BTreeSet::from([10000]));
        let conn = server.get_client(10000).unwrap();
        assert!(conn.is_validated());
    }

    #[test]
    fn test_wrong_response_is_closed_and_purged_once() {
        let recorder = Arc::new(Recorder::default());
        let (server, addr) = start_server(&recorder);

        let mut client = raw_client(addr, false);
        // May race with the server closing the socket
        let _ = client.write_all(&[1, 0, 0, 0, 0, 0, 0, 0]);

        // Server closes without sending anything
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest);
        assert!(rest.is_empty());

        wait_for(|| server.get_online_clients().is_empty());
        server.get_online_clients();
        server.update(usize::MAX, false);

        assert!(recorder.validated.lock().is_empty());
        assert_eq!(*recorder.disconnected.lock(), vec![10000]);
        assert!(recorder.received.lock().is_empty());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_denied_client_never_gets_a_challenge() {
        let recorder = Arc::new(Recorder::default());
        recorder.deny.store(true, Ordering::SeqCst);
        let (server, addr) = start_server(&recorder);

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; CHALLENGE_LEN];
        let read = client.read(&mut buf).unwrap_or(0);

        assert_eq!(read, 0);
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
        assert_eq!(server.connection_count(), 0);
        assert!(recorder.disconnected.lock().is_empty());
    }

    #[test]
    fn test_update_respects_message_budget() {
        let recorder = Arc::new(Recorder::default());
        let (server, addr) = start_server(&recorder);

        let mut client = raw_client(addr, true);
        for i in 0..5u32 {
            write_frame(&mut client, i, &i.to_ne_bytes());
        }
        wait_for(|| server.pending_messages() == 5);

        assert_eq!(server.update(2, true), 2);
        assert_eq!(server.update(10, false), 3);
        assert_eq!(server.update(10, false), 0);

        let received = recorder.received.lock();
        let kinds: Vec<u32> = received.iter().map(|(_, kind, _)| *kind).collect();
        assert_eq!(kinds, vec![0, 1, 2, 3, 4]);
        assert!(received.iter().all(|(id, _, _)| *id == 10000));
    }

    #[test]
    fn test_echo_through_on_message() {
        let recorder = Arc::new(Recorder::default());
        recorder.echo.store(true, Ordering::SeqCst);
        let (server, addr) = start_server(&recorder);

        let mut client = raw_client(addr, true);
        let stamp = 123_456_789u64.to_ne_bytes();
        write_frame(&mut client, 2, &stamp);

        assert_eq!(server.update(usize::MAX, true), 1);
        assert_eq!(read_frame(&mut client), (2, stamp.to_vec()));
    }

    #[test]
    fn test_broadcast_skips_initiator() {
        let recorder = Arc::new(Recorder::default());
        let (server, addr) = start_server(&recorder);

        let mut a = raw_client(addr, true);
        let mut b = raw_client(addr, true);
        let mut c = raw_client(addr, true);
        wait_for(|| recorder.validated.lock().len() == 3);

        let conn_a = connection_for(&server, &a);
        let targets = server.get_online_clients();
        server.broadcast_message(&message(7, b"all"), &targets, Some(&conn_a), true);
        // Marker sent only to A: it must be the first thing A sees
        server.send_to_client(&conn_a, message(8, b"marker"));

        assert_eq!(read_frame(&mut b), (7, b"all".to_vec()));
        assert_eq!(read_frame(&mut c), (7, b"all".to_vec()));
        assert_eq!(read_frame(&mut a), (8, b"marker".to_vec()));
    }

    #[test]
    fn test_broadcast_includes_initiator_when_not_ignored() {
        let recorder = Arc::new(Recorder::default());
        let (server, addr) = start_server(&recorder);

        let mut a = raw_client(addr, true);
        let mut b = raw_client(addr, true);
        wait_for(|| recorder.validated.lock().len() == 2);

        let conn_a = connection_for(&server, &a);
        let conn_b = connection_for(&server, &b);
        server.broadcast_message(&message(3, b"x"), &[conn_a.clone()], Some(&conn_a), false);
        server.send_to_client(&conn_b, message(4, b"only-b"));

        assert_eq!(read_frame(&mut a), (3, b"x".to_vec()));
        // B was not a target
        assert_eq!(read_frame(&mut b), (4, b"only-b".to_vec()));
    }

    #[test]
    fn test_dropped_client_is_purged_once() {
        let recorder = Arc::new(Recorder::default());
        let (server, addr) = start_server(&recorder);

        let a = raw_client(addr, true);
        let mut b = raw_client(addr, true);
        wait_for(|| recorder.validated.lock().len() == 2);
        let conn_a = connection_for(&server, &a);

        drop(a);
        wait_for(|| !conn_a.is_connected());

        let targets = vec![conn_a.clone()];
        server.broadcast_message(&message(1, b""), &targets, None, false);
        server.send_to_client(&conn_a, message(1, b""));
        assert_eq!(server.get_online_clients().len(), 1);
        server.update(usize::MAX, false);

        assert_eq!(*recorder.disconnected.lock(), vec![conn_a.id()]);

        // The survivor still works
        let conn_b = connection_for(&server, &b);
        server.send_to_client(&conn_b, message(2, b"alive"));
        assert_eq!(read_frame(&mut b), (2, b"alive".to_vec()));
    }

    #[test]
    fn test_send_to_dead_client_removes_it_once() {
        let recorder = Arc::new(Recorder::default());
        let (server, addr) = start_server(&recorder);

        let a = raw_client(addr, true);
        wait_for(|| recorder.validated.lock().len() == 1);
        let conn_a = connection_for(&server, &a);

        drop(a);
        wait_for(|| !conn_a.is_connected());
        // Closed but not yet purged
        assert_eq!(server.connection_count(), 1);

        server.send_to_client(&conn_a, message(1, b"late"));
        assert_eq!(*recorder.disconnected.lock(), vec![conn_a.id()]);
        assert_eq!(server.connection_count(), 0);

        server.send_to_client(&conn_a, message(1, b"later"));
        server.update(usize::MAX, false);
        assert_eq!(recorder.disconnected.lock().len(), 1);
    }

    #[test]
    fn test_silent_peer_queue_stays_capped() {
        let recorder = Arc::new(Recorder::default());
        let config = NetworkConfig::default().with_pending_limit(8);
        let (server, addr) = start_server_with(&recorder, config);

        // Never answers the challenge
        let mut silent = TcpStream::connect(addr).unwrap();
        silent
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        wait_for(|| server.connection_count() == 1);

        let payload = message(5, &[0xAB; 1024]);
        for _ in 0..1000 {
            let targets = server.get_online_clients();
            server.broadcast_message(&payload, &targets, None, false);
        }

        let conn = server.get_client(10000).unwrap();
        assert!(conn.is_connected());
        assert!(!conn.is_validated());
        assert_eq!(conn.pending_messages(), 8);

        // Answering late still delivers what was held
        let mut challenge = [0u8; CHALLENGE_LEN];
        silent.read_exact(&mut challenge).unwrap();
        silent.write_all(&handshake::transform(&challenge)).unwrap();
        for _ in 0..8 {
            assert_eq!(read_frame(&mut silent), (5, vec![0xAB; 1024]));
        }
        wait_for(|| conn.pending_messages() == 0);
    }

    #[tokio::test]
    async fn test_accept_errors_back_off_before_retrying() {
        let mut failures = 2;
        let start = Instant::now();

        let accepted = accept_with_retry(|| {
            let result = if failures > 0 {
                failures -= 1;
                Err(std::io::Error::from_raw_os_error(24))
            } else {
                Ok(7u32)
            };
            async move { result }
        })
        .await;

        assert_eq!(accepted, 7);
        assert_eq!(failures, 0);
        assert!(start.elapsed() >= ACCEPT_RETRY_DELAY * 2);
    }

    #[test]
    fn test_stop_reports_every_connection() {
        let recorder = Arc::new(Recorder::default());
        let (mut server, addr) = start_server(&recorder);

        let _a = raw_client(addr, true);
        let _b = raw_client(addr, true);
        wait_for(|| recorder.validated.lock().len() == 2);

        server.stop();
        let mut disconnected = recorder.disconnected.lock().clone();
        disconnected.sort_unstable();
        assert_eq!(disconnected, vec![10000, 10001]);
        assert_eq!(server.connection_count(), 0);
    }
}
