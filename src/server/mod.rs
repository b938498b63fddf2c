//! Completion-driven TCP server.
//!
//! A [`Server`] accepts connections on one dedicated thread and multiplexes them over a
//! fixed table of [`Session`]s. Socket operations finish on a shared
//! [`CompletionPort`]; a [`WorkerPool`] sized to the machine drains it, reassembles
//! frames from whatever partial reads arrive, and queues them in a [`PacketRing`].
//!
//! # Overview
//!
//! The application drives the server by polling:
//!
//! - [`Server::process_connect_user_sessions`]: newly admitted sessions.
//! - [`Server::process_received_packet`]: decoded frames, in arrival order.
//! - [`Server::process_disconnect_user_sessions`]: sessions whose socket failed or
//!   closed. The callback runs before the session is torn down and its ID reused.
//!
//! Each call drains its queue under a short lock and runs the callback outside it, so
//! callbacks may freely send, broadcast or close sessions.
//!
//! # Admission control
//!
//! Session IDs come from a free-list of `max_sessions` entries. When it is empty a new
//! connection is closed as soon as it is accepted and never reported.
//!
//! # Example
//! ```rust,no_run
//! use ringnet::config::ServerConfig;
//! use ringnet::protocol::Header;
//! use ringnet::server::Server;
//!
//! let mut server = Server::start(ServerConfig::default()).unwrap();
//! loop {
//!     server.process_connect_user_sessions(|session| {
//!         println!("session {} connected", session.id());
//!     });
//!     server.process_received_packet(|session, frame| {
//!         let header = Header::new(frame.kind(), frame.payload().len()).unwrap();
//!         let _ = session.send(header, frame.payload());
//!     });
//!     server.process_disconnect_user_sessions(|session| {
//!         println!("session {} gone", session.id());
//!     });
//!     # break;
//! }
//! server.shutdown();
//! ```
//!
//! # See Also
//! - [`protocol`](crate::protocol): Framing of every packet.
//! - [`memory`](crate::memory): Pools and the packet ring used here.
pub mod port;
pub mod session;
mod thread;

use std::{
    collections::{BTreeSet, VecDeque},
    io,
    mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    config::{ConfigError, ServerConfig},
    memory::{BufferPool, Lease, MemoryError, PacketRing, Pool, PoolStats, Recycle},
    protocol::{Frame, FrameError, Header, encode_frame},
};

use port::{Completion, CompletionKey, CompletionPort, OperationKind, Overlapped};
use thread::Dispatch;

pub use session::{Session, SessionError, UserData};
pub use thread::WorkerPool;

/// Index into the session table.
pub type SessionId = usize;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: io::Error,
    },
    #[error("failed to start server threads: {0}")]
    Spawn(io::Error),
    #[error("invalid packet: {0}")]
    Frame(#[from] FrameError),
    #[error("no buffer for packet: {0}")]
    Memory(#[from] MemoryError),
}

/// Pools shared by every session of one server.
pub(crate) struct Pools {
    operations: Pool<Overlapped>,
    send_buffers: BufferPool,
    receive_buffers: BufferPool,
    max_packet_size: u32,
    receive_buffer_size: usize,
}

impl Pools {
    fn new(config: &ServerConfig) -> Self {
        let sizing = config.pool_config();
        Self {
            operations: Pool::new("operations", sizing, Overlapped::default),
            send_buffers: BufferPool::buffers("send", config.send_buffer_size(), sizing),
            receive_buffers: BufferPool::buffers("receive", config.receive_buffer_size, sizing),
            max_packet_size: config.max_packet_size,
            receive_buffer_size: config.receive_buffer_size,
        }
    }
}

/// Leases from `pool`. Exhaustion means the pools were provisioned too small: it
/// panics in debug builds and drops the operation otherwise.
fn provision<T: Recycle>(pool: &Pool<T>) -> Result<Lease<T>, MemoryError> {
    pool.allocate().inspect_err(|e| {
        error!("{e}; raise pool_max_chunks");
        debug_assert!(false, "{e}");
    })
}

/// Snapshot of every pool a server owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerPoolStats {
    pub operations: PoolStats,
    pub send_buffers: PoolStats,
    pub receive_buffers: PoolStats,
}

struct Inner {
    config: ServerConfig,
    pools: Arc<Pools>,
    sessions: Vec<Session>,
    free_ids: Mutex<VecDeque<SessionId>>,
    active: Mutex<BTreeSet<SessionId>>,
    connected: Mutex<Vec<SessionId>>,
    disconnected: Mutex<Vec<CompletionKey>>,
    incoming: Mutex<PacketRing<CompletionKey>>,
    /// Emptied ring swapped in for `incoming` on the next drain.
    spare: Mutex<Option<PacketRing<CompletionKey>>>,
    port: CompletionPort,
    running: AtomicBool,
}

pub struct Server {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
    workers: WorkerPool,
}

impl Server {
    /// Binds the listener and starts the accept and worker threads.
    pub fn start(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(config.address).map_err(|source| ServerError::Bind {
            address: config.address,
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            address: config.address,
            source,
        })?;

        let pools = Arc::new(Pools::new(&config));
        let sessions = (0..config.max_sessions)
            .map(|id| Session::new(id, Arc::clone(&pools)))
            .collect();
        let inner = Arc::new(Inner {
            free_ids: Mutex::new((0..config.max_sessions).collect()),
            active: Mutex::new(BTreeSet::new()),
            connected: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
            incoming: Mutex::new(PacketRing::new(config.ring_capacity)),
            spare: Mutex::new(Some(PacketRing::new(config.ring_capacity))),
            port: CompletionPort::new(),
            running: AtomicBool::new(true),
            sessions,
            pools,
            config,
        });

        let worker_count = inner.config.worker_count();
        let mut workers = WorkerPool::new(worker_count, &inner.port, Arc::clone(&inner))
            .map_err(ServerError::Spawn)?;

        let acceptor = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("ringnet-accept".into())
                .spawn(move || inner.accept_loop(listener))
        };
        let acceptor = match acceptor {
            Ok(handle) => handle,
            Err(e) => {
                workers.shutdown(&inner.port);
                return Err(ServerError::Spawn(e));
            }
        };

        info!(
            "listening at {local_addr} with {worker_count} workers and {} session slots",
            inner.config.max_sessions
        );
        Ok(Self {
            inner,
            local_addr,
            acceptor: Some(acceptor),
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Session slots still available for new connections.
    pub fn free_session_count(&self) -> usize {
        self.inner.free_ids.lock().len()
    }

    /// Sessions currently connected.
    pub fn active_session_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// The session at `id`, if it is connected.
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.inner
            .sessions
            .get(id)
            .filter(|session| session.is_connected())
    }

    /// Sends one packet to session `id`.
    pub fn send(&self, id: SessionId, header: Header, payload: &[u8]) -> Result<(), SessionError> {
        self.session(id)
            .ok_or(SessionError::NotConnected(id))?
            .send(header, payload)
    }

    /// Sends one packet to every connected session, encoding it once.
    /// Returns the number of sessions it was queued for.
    pub fn broadcast(&self, header: Header, payload: &[u8]) -> Result<usize, ServerError> {
        header.validate(self.inner.config.max_packet_size)?;

        let mut buffer = provision(&self.inner.pools.send_buffers)?;
        let len = encode_frame(header, payload, buffer.as_mut_slice())?;
        buffer.set_len(len);
        let buffer = buffer.freeze();

        let ids: Vec<SessionId> = self.inner.active.lock().iter().copied().collect();
        let mut sent = 0;
        for id in ids {
            match self.inner.sessions[id].send_buffer(&buffer) {
                Ok(()) => sent += 1,
                Err(e) => debug!("broadcast skipped session {id}: {e}"),
            }
        }
        trace!("broadcast {len} bytes to {sent} sessions");
        Ok(sent)
    }

    /// Closes the socket of session `id`. It is reported through
    /// [`Server::process_disconnect_user_sessions`] like any other disconnect.
    pub fn close_session(&self, id: SessionId) {
        if let Some(session) = self.session(id) {
            session.close();
        }
    }

    /// Drains newly connected sessions.
    pub fn process_connect_user_sessions<F>(&self, mut f: F)
    where
        F: FnMut(&Session),
    {
        let ids = mem::take(&mut *self.inner.connected.lock());
        for id in ids {
            f(&self.inner.sessions[id]);
        }
    }

    /// Drains sessions pending disconnect. `f` runs first; the session is then torn
    /// down and only afterwards is its ID returned to the free-list.
    pub fn process_disconnect_user_sessions<F>(&self, mut f: F)
    where
        F: FnMut(&Session),
    {
        let keys = mem::take(&mut *self.inner.disconnected.lock());
        for key in keys {
            let session = &self.inner.sessions[key.session];
            if session.key() != key {
                debug!("skipping disconnect of stale session {}", key.session);
                continue;
            }
            f(session);
            self.inner.release(session);
        }
    }

    /// Drains received frames in arrival order. Frames from connections that have
    /// since been torn down are skipped.
    pub fn process_received_packet<F>(&self, mut f: F)
    where
        F: FnMut(&Session, Frame<'_>),
    {
        let spare = self.inner.spare.lock().take();
        let spare = spare.unwrap_or_else(|| PacketRing::new(self.inner.config.ring_capacity));
        let mut batch = mem::replace(&mut *self.inner.incoming.lock(), spare);

        while let Some((key, frame)) = batch.front() {
            let session = &self.inner.sessions[key.session];
            if session.key() == key {
                f(session, frame);
            } else {
                debug!("dropping frame from stale session {}", key.session);
            }
            batch.pop();
        }
        *self.inner.spare.lock() = Some(batch);
    }

    pub fn pool_stats(&self) -> ServerPoolStats {
        let pools = &self.inner.pools;
        ServerPoolStats {
            operations: pools.operations.stats(),
            send_buffers: pools.send_buffers.stats(),
            receive_buffers: pools.receive_buffers.stats(),
        }
    }

    /// Stops accepting, closes every session and joins all threads.
    pub fn shutdown(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };
        info!("shutting down server at {}", self.local_addr);

        self.inner.running.store(false, Ordering::Release);
        if let Err(e) = TcpStream::connect(wake_address(self.local_addr)) {
            warn!("failed to wake accept thread: {e}");
        }
        if acceptor.join().is_err() {
            error!("accept thread panicked");
        }

        for session in &self.inner.sessions {
            session.disconnect();
        }
        self.workers.shutdown(&self.inner.port);

        let inner = &self.inner;
        inner.active.lock().clear();
        inner.connected.lock().clear();
        inner.disconnected.lock().clear();
        *inner.free_ids.lock() = (0..inner.config.max_sessions).collect();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn accept_loop(&self, listener: TcpListener) {
        for stream in listener.incoming() {
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            match stream {
                Ok(stream) => self.admit(stream),
                Err(e) => warn!("accept failed: {e} (os error {:?})", e.raw_os_error()),
            }
        }
        debug!("accept thread exiting");
    }

    fn admit(&self, stream: TcpStream) {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                warn!("dropping connection without peer address: {e}");
                return;
            }
        };
        let Some(id) = self.free_ids.lock().pop_front() else {
            info!("session table full, refusing {peer}");
            return;
        };

        let session = &self.sessions[id];
        self.active.lock().insert(id);
        match session.connect(stream, peer, &self.port) {
            Ok(()) => {
                info!("session {id} connected from {peer}");
                self.connected.lock().push(id);
            }
            Err(e) => {
                warn!("session {id}: failed to start {peer}: {e}");
                self.release(session);
            }
        }
    }

    fn release(&self, session: &Session) {
        self.active.lock().remove(&session.id());
        session.disconnect();
        self.free_ids.lock().push_back(session.id());
        debug!("session {} returned to the free-list", session.id());
    }

    /// Queues the connection identified by `key` for disconnect. Requests for an
    /// earlier connection on the same slot are ignored.
    fn request_disconnect(&self, session: &Session, key: CompletionKey) {
        if session.mark_closing(key) {
            debug!("session {} queued for disconnect", key.session);
            self.disconnected.lock().push(key);
        }
    }

    fn complete_receive(&self, session: &Session, key: CompletionKey, operation: Lease<Overlapped>) {
        session.receive(key, operation.received());
        let spare = session.process_received(key, |frame| {
            if let Err(e) = self.incoming.lock().push_frame(key, frame) {
                debug!("session {}: frame not queued: {e}", key.session);
            }
        });
        let Some(spare) = spare else {
            trace!("discarding receive for torn down session {}", key.session);
            return;
        };

        if spare == 0 {
            warn!("session {}: receive buffer full without a frame", key.session);
            self.request_disconnect(session, key);
            return;
        }
        if let Err(e) = session.arm_receive(key, Some(operation), spare) {
            debug!("session {}: receive not re-armed: {e}", key.session);
            self.request_disconnect(session, key);
        }
    }
}

impl Dispatch for Inner {
    fn dispatch(&self, completion: Completion) {
        let Completion {
            key,
            result,
            operation,
        } = completion;

        let Some(session) = self.sessions.get(key.session) else {
            warn!("completion for unknown session {}", key.session);
            return;
        };
        if session.key() != key {
            trace!("discarding stale completion for session {}", key.session);
            return;
        }

        match (result, operation.kind()) {
            (Err(e), kind) => {
                debug!("session {} {kind:?} failed: {e}", key.session);
                self.request_disconnect(session, key);
            }
            (Ok(0), kind) => {
                debug!("session {} {kind:?} closed by peer", key.session);
                self.request_disconnect(session, key);
            }
            (Ok(n), OperationKind::Send) => {
                trace!("session {} sent {n} bytes", key.session);
            }
            (Ok(n), OperationKind::Receive) => {
                trace!("session {} received {n} bytes", key.session);
                self.complete_receive(session, key, operation);
            }
            (Ok(_), OperationKind::Idle) => {
                warn!("session {}: completion for idle operation", key.session);
            }
        }
    }
}

/// Address the accept thread can be reached at, for waking it on shutdown.
fn wake_address(local: SocketAddr) -> SocketAddr {
    match local {
        SocketAddr::V4(addr) if addr.ip().is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))
        }
        SocketAddr::V6(addr) if addr.ip().is_unspecified() => {
            SocketAddr::from((Ipv6Addr::LOCALHOST, addr.port()))
        }
        addr => addr,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        time::{Duration, Instant},
    };

    use crate::protocol::HEADER_SIZE;

    use super::*;

    fn config(max_sessions: usize) -> ServerConfig {
        ServerConfig {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            max_sessions,
            max_packet_size: 64,
            receive_buffer_size: 128,
            ring_capacity: 1024,
            workers: 2,
            pool_max_chunks: 64,
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn wake_address_targets_loopback() {
        let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9000));
        assert_eq!(
            wake_address(any),
            SocketAddr::from((Ipv4Addr::LOCALHOST, 9000))
        );
        let fixed = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 9000));
        assert_eq!(wake_address(fixed), fixed);
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = config(1);
        config.max_sessions = 0;
        assert!(matches!(
            Server::start(config),
            Err(ServerError::Config(ConfigError::NoSessions))
        ));
    }

    #[test]
    fn bind_failure_is_reported() {
        let first = Server::start(config(1)).unwrap();
        let mut taken = config(1);
        taken.address = first.local_addr();
        assert!(matches!(
            Server::start(taken),
            Err(ServerError::Bind { .. })
        ));
    }

    #[test]
    fn echo_round_trip() {
        let server = Server::start(config(2)).unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();

        let mut connected = Vec::new();
        assert!(wait_for(|| {
            server.process_connect_user_sessions(|s| connected.push(s.id()));
            !connected.is_empty()
        }));
        assert_eq!(server.free_session_count(), 1);

        let header = Header::new(42, 3).unwrap();
        let mut frame = [0u8; HEADER_SIZE + 3];
        encode_frame(header, b"abc", &mut frame).unwrap();
        client.write_all(&frame).unwrap();

        let mut echoed = 0;
        assert!(wait_for(|| {
            server.process_received_packet(|session, frame| {
                session.send(frame.header(), frame.payload()).unwrap();
                echoed += 1;
            });
            echoed == 1
        }));

        let mut got = [0u8; HEADER_SIZE + 3];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, frame);
    }

    #[test]
    fn disconnect_is_deferred_until_processed() {
        let server = Server::start(config(1)).unwrap();
        let client = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_for(|| server.active_session_count() == 1));
        drop(client);

        let mut gone = Vec::new();
        assert!(wait_for(|| {
            server.process_disconnect_user_sessions(|session| {
                assert!(session.is_connected());
                assert_eq!(server.free_session_count(), 0);
                gone.push(session.id());
            });
            !gone.is_empty()
        }));
        assert_eq!(gone, vec![0]);
        assert_eq!(server.free_session_count(), 1);
        assert_eq!(server.active_session_count(), 0);
    }

    #[test]
    fn shutdown_releases_everything() {
        let mut server = Server::start(config(2)).unwrap();
        let _client = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_for(|| server.active_session_count() == 1));

        server.shutdown();
        let stats = server.pool_stats();
        assert_eq!(stats.operations.in_use, 0);
        assert_eq!(stats.receive_buffers.in_use, 0);
        assert_eq!(server.active_session_count(), 0);
        assert_eq!(server.free_session_count(), 2);
        assert!(server.session(0).is_none());
        server.shutdown();
    }

    #[test]
    fn callback_can_drain_again() {
        let server = Server::start(config(1)).unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_for(|| server.active_session_count() == 1));

        let mut frame = [0u8; HEADER_SIZE];
        encode_frame(Header::new(1, 0).unwrap(), &[], &mut frame).unwrap();
        client.write_all(&frame).unwrap();

        let mut outer = Vec::new();
        let mut inner = Vec::new();
        assert!(wait_for(|| {
            server.process_received_packet(|_, frame| {
                outer.push(frame.kind());
                let mut second = [0u8; HEADER_SIZE];
                encode_frame(Header::new(2, 0).unwrap(), &[], &mut second).unwrap();
                client.write_all(&second).unwrap();
                wait_for(|| {
                    server.process_received_packet(|_, frame| inner.push(frame.kind()));
                    !inner.is_empty()
                });
            });
            !outer.is_empty()
        }));

        assert_eq!(outer, vec![1]);
        assert_eq!(inner, vec![2]);
    }

    #[test]
    fn stale_disconnect_request_is_ignored() {
        let server = Server::start(config(1)).unwrap();
        let first = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_for(|| server.active_session_count() == 1));
        let session = &server.inner.sessions[0];
        let stale = session.key();

        drop(first);
        let mut gone = 0;
        assert!(wait_for(|| {
            server.process_disconnect_user_sessions(|_| gone += 1);
            gone == 1
        }));

        let _second = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_for(|| session.is_connected()));
        assert_ne!(session.key(), stale);

        server.inner.request_disconnect(session, stale);
        server.inner.disconnected.lock().push(stale);
        server.process_disconnect_user_sessions(|_| gone += 1);

        assert_eq!(gone, 1);
        assert!(session.is_connected());
        assert_eq!(server.active_session_count(), 1);
    }
}
