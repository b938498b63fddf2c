//! Per-connection server state.
//!
//! A [`Session`] occupies one fixed slot of the server's session table for the whole
//! life of the server. Between an accept and the matching disconnect it holds the
//! socket (through its port [`Association`]), the receive accumulator, and exactly one
//! outstanding receive operation.
use std::{
    any::Any,
    fmt,
    net::{SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use log::{debug, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    memory::{Lease, MemoryError, SharedBuffer},
    protocol::{Assembler, Frame, FrameError, Header, encode_frame},
};

use super::{
    Pools, SessionId,
    port::{Association, CompletionKey, CompletionPort, Overlapped},
    provision,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is not connected")]
    NotConnected(SessionId),
    #[error("invalid packet: {0}")]
    Frame(#[from] FrameError),
    #[error("no buffer for packet: {0}")]
    Memory(#[from] MemoryError),
}

pub type UserData = Arc<dyn Any + Send + Sync>;

struct Link {
    association: Association,
    peer: SocketAddr,
}

/// Receive side state. Only the worker completing the session's single outstanding
/// receive touches it while connected.
struct Inbox {
    generation: u32,
    assembler: Option<Assembler>,
}

pub struct Session {
    id: SessionId,
    pools: Arc<Pools>,
    generation: AtomicU32,
    closing: AtomicBool,
    link: Mutex<Option<Link>>,
    inbox: Mutex<Inbox>,
    user_data: Mutex<Option<UserData>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, pools: Arc<Pools>) -> Self {
        Self {
            id,
            pools,
            generation: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            link: Mutex::new(None),
            inbox: Mutex::new(Inbox {
                generation: 0,
                assembler: None,
            }),
            user_data: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> CompletionKey {
        CompletionKey {
            session: self.id,
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.lock().as_ref().map(|link| link.peer)
    }

    pub fn set_user_data(&self, data: Option<UserData>) {
        *self.user_data.lock() = data;
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.user_data.lock().clone()
    }

    /// Copies one frame into a fresh send buffer and queues it on the socket.
    pub fn send(&self, header: Header, payload: &[u8]) -> Result<(), SessionError> {
        header.validate(self.pools.max_packet_size)?;

        let mut buffer = provision(&self.pools.send_buffers)?;
        let len = encode_frame(header, payload, buffer.as_mut_slice())?;
        buffer.set_len(len);
        self.send_buffer(&buffer.freeze())
    }

    /// Queues an already encoded buffer, taking one more reference to it.
    pub fn send_buffer(&self, buffer: &SharedBuffer) -> Result<(), SessionError> {
        let mut operation = provision(&self.pools.operations)?;
        operation.prepare_send(buffer.clone());

        let link = self.link.lock();
        let link = link.as_ref().ok_or(SessionError::NotConnected(self.id))?;
        link.association
            .send(operation)
            .map_err(|_| SessionError::NotConnected(self.id))
    }

    /// Shuts the socket down. The failure completions that follow are routed
    /// through the server's disconnect queue.
    pub fn close(&self) {
        if let Some(link) = self.link.lock().as_ref() {
            link.association.shutdown();
        }
    }

    /// Appends `bytes` at the end of the receive accumulator.
    pub fn receive(&self, key: CompletionKey, bytes: &[u8]) -> usize {
        let mut inbox = self.inbox.lock();
        if inbox.generation != key.generation {
            return 0;
        }
        let pools = &self.pools;
        inbox
            .assembler
            .get_or_insert_with(|| {
                Assembler::new(pools.receive_buffer_size, pools.max_packet_size)
            })
            .receive(bytes)
    }

    /// Hands every fully assembled frame to `deliver`, oldest first, removing each
    /// from the accumulator. Returns the free space left for the next receive, or
    /// `None` if `key` belongs to an earlier connection.
    pub fn process_received<F>(&self, key: CompletionKey, mut deliver: F) -> Option<usize>
    where
        F: FnMut(Frame<'_>),
    {
        let mut inbox = self.inbox.lock();
        if inbox.generation != key.generation {
            return None;
        }
        let Some(assembler) = inbox.assembler.as_mut() else {
            return Some(self.pools.receive_buffer_size);
        };

        while let Some(frame) = assembler.received_packet() {
            deliver(frame);
            assembler.pop_received_packet();
        }
        Some(assembler.spare())
    }

    /// Binds an accepted socket to `port` and arms the first receive.
    pub(crate) fn connect(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        port: &CompletionPort,
    ) -> Result<(), SessionError> {
        let key = self.key();
        let association = port
            .associate(stream, key)
            .map_err(|e| {
                warn!("session {}: failed to bind socket: {e}", self.id);
                SessionError::NotConnected(self.id)
            })?;

        {
            let mut link = self.link.lock();
            self.closing.store(false, Ordering::Release);
            *link = Some(Link { association, peer });
        }
        self.arm_receive(key, None, self.pools.receive_buffer_size)
    }

    /// Submits the session's receive, reusing `operation` when given.
    pub(crate) fn arm_receive(
        &self,
        key: CompletionKey,
        operation: Option<Lease<Overlapped>>,
        requested: usize,
    ) -> Result<(), SessionError> {
        let mut operation = match operation {
            Some(operation) => operation,
            None => provision(&self.pools.operations)?,
        };
        let buffer = if operation.has_receive_buffer() {
            None
        } else {
            Some(provision(&self.pools.receive_buffers)?)
        };
        operation.prepare_receive(buffer, requested);

        let link = self.link.lock();
        match link.as_ref() {
            Some(link) if link.association.key() == key => link
                .association
                .receive(operation)
                .map_err(|_| SessionError::NotConnected(self.id)),
            _ => Err(SessionError::NotConnected(self.id)),
        }
    }

    /// Flags the connection identified by `key` for disconnect. Returns `true` only
    /// for the first caller, and never once `key` belongs to an earlier connection.
    pub(crate) fn mark_closing(&self, key: CompletionKey) -> bool {
        let link = self.link.lock();
        match link.as_ref() {
            Some(link) if link.association.key() == key => {
                !self.closing.swap(true, Ordering::AcqRel)
            }
            _ => false,
        }
    }

    /// Tears the connection down: closes the socket, waits for outstanding
    /// operations to surface, drops receive state and moves to the next generation.
    /// Returns `false` if the session was not connected.
    pub(crate) fn disconnect(&self) -> bool {
        let Some(link) = self.link.lock().take() else {
            return false;
        };
        debug!("session {} disconnecting from {}", self.id, link.peer);
        drop(link);

        let mut inbox = self.inbox.lock();
        inbox.assembler = None;
        inbox.generation = inbox.generation.wrapping_add(1);
        self.generation.store(inbox.generation, Ordering::Release);
        drop(inbox);

        *self.user_data.lock() = None;
        trace!("session {} now at generation {}", self.id, self.key().generation);
        true
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("peer", &self.peer_addr())
            .finish()
    }
}
