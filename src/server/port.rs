//! Shared completion facility.
//!
//! Every socket associated with a [`CompletionPort`] gets a pair of submission threads,
//! one per direction. Each of them blocks on its socket for the operation at the head
//! of its queue and, once the operation finishes, posts a [`Completion`] carrying
//! `(bytes transferred, session key, operation)` to the single queue shared by all
//! workers. Workers never touch sockets; they only drain completions.
//!
//! Closing an [`Association`] shuts the socket down, which surfaces any outstanding
//! operation as a failed or zero-length completion before its threads exit.
use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
};

use log::{debug, trace};
use parking_lot::Mutex;
use thiserror::Error;

use crate::memory::{IoBuffer, Lease, Recycle, SharedBuffer};

use super::SessionId;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("operation submitted to a closed association")]
    Closed,
    #[error("{kind:?} operation is missing its buffer")]
    MissingBuffer { kind: OperationKind },
}

/// Identifies the connection an operation belongs to.
///
/// The generation changes every time a session slot is reclaimed, so completions
/// from a previous connection on the same slot can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionKey {
    pub session: SessionId,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OperationKind {
    #[default]
    Idle,
    Receive,
    Send,
}

/// Operation descriptor: what was requested and the buffer it targets.
#[derive(Debug, Default)]
pub struct Overlapped {
    kind: OperationKind,
    receive: Option<Lease<IoBuffer>>,
    send: Option<SharedBuffer>,
    requested: usize,
}

impl Overlapped {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Arms a receive of at most `requested` bytes into `buffer`.
    /// A buffer left over from an earlier receive is kept.
    pub fn prepare_receive(&mut self, buffer: Option<Lease<IoBuffer>>, requested: usize) {
        self.kind = OperationKind::Receive;
        self.send = None;
        if let Some(buffer) = buffer {
            self.receive = Some(buffer);
        }
        self.requested = requested;
    }

    pub fn has_receive_buffer(&self) -> bool {
        self.receive.is_some()
    }

    pub fn prepare_send(&mut self, buffer: SharedBuffer) {
        self.kind = OperationKind::Send;
        self.receive = None;
        self.requested = buffer.len();
        self.send = Some(buffer);
    }

    /// Bytes delivered by the last receive.
    pub fn received(&self) -> &[u8] {
        self.receive.as_ref().map(|b| b.filled()).unwrap_or_default()
    }

    fn read_from(&mut self, stream: &mut impl Read) -> io::Result<usize> {
        let Some(buffer) = self.receive.as_mut() else {
            return Err(io::Error::other(PortError::MissingBuffer { kind: self.kind }));
        };
        let limit = self.requested.min(buffer.capacity());

        loop {
            match stream.read(&mut buffer.as_mut_slice()[..limit]) {
                Ok(n) => {
                    buffer.set_len(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn write_to(&self, stream: &mut impl Write) -> io::Result<usize> {
        let Some(buffer) = self.send.as_ref() else {
            return Err(io::Error::other(PortError::MissingBuffer { kind: self.kind }));
        };
        stream.write_all(buffer.filled())?;
        Ok(buffer.len())
    }
}

impl Recycle for Overlapped {
    fn recycle(&mut self) {
        self.kind = OperationKind::Idle;
        self.receive = None;
        self.send = None;
        self.requested = 0;
    }
}

/// A finished operation, as seen by a worker.
pub struct Completion {
    pub key: CompletionKey,
    pub result: io::Result<usize>,
    pub operation: Lease<Overlapped>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("key", &self.key)
            .field("result", &self.result)
            .field("kind", &self.operation.kind())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum Event {
    Completion(Completion),
    Shutdown,
}

pub struct CompletionPort {
    sender: mpsc::Sender<Event>,
    receiver: Arc<Mutex<mpsc::Receiver<Event>>>,
}

impl Default for CompletionPort {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionPort {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Queues a completion for the next free worker.
    pub fn post(&self, completion: Completion) {
        // The receiver lives as long as the port.
        let _ = self.sender.send(Event::Completion(completion));
    }

    pub(crate) fn post_shutdown(&self, workers: usize) {
        for _ in 0..workers {
            let _ = self.sender.send(Event::Shutdown);
        }
    }

    pub(crate) fn receiver(&self) -> Arc<Mutex<mpsc::Receiver<Event>>> {
        Arc::clone(&self.receiver)
    }

    /// Binds `stream` to this port under `key`.
    pub fn associate(&self, stream: TcpStream, key: CompletionKey) -> io::Result<Association> {
        let (receive_tx, receive_rx) = mpsc::channel();
        let (send_tx, send_rx) = mpsc::channel();

        let reader = {
            let stream = stream.try_clone()?;
            let port = self.sender.clone();
            thread::Builder::new()
                .name(format!("ringnet-recv-{}", key.session))
                .spawn(move || receive_loop(stream, key, receive_rx, port))?
        };
        let writer = {
            let stream = stream.try_clone()?;
            let port = self.sender.clone();
            thread::Builder::new()
                .name(format!("ringnet-send-{}", key.session))
                .spawn(move || send_loop(stream, key, send_rx, port))
        };
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                let _ = stream.shutdown(Shutdown::Both);
                drop(receive_tx);
                let _ = reader.join();
                return Err(e);
            }
        };

        Ok(Association {
            key,
            stream,
            receives: Some(receive_tx),
            sends: Some(send_tx),
            threads: vec![reader, writer],
        })
    }
}

fn receive_loop(
    mut stream: TcpStream,
    key: CompletionKey,
    operations: mpsc::Receiver<Lease<Overlapped>>,
    port: mpsc::Sender<Event>,
) {
    while let Ok(mut operation) = operations.recv() {
        let result = operation.read_from(&mut stream);
        let finished = !matches!(result, Ok(n) if n > 0);
        trace!("session {} receive completed: {result:?}", key.session);

        let completion = Completion {
            key,
            result,
            operation,
        };
        if port.send(Event::Completion(completion)).is_err() || finished {
            break;
        }
    }
    debug!("session {} receive thread exiting", key.session);
}

fn send_loop(
    mut stream: TcpStream,
    key: CompletionKey,
    operations: mpsc::Receiver<Lease<Overlapped>>,
    port: mpsc::Sender<Event>,
) {
    while let Ok(operation) = operations.recv() {
        let result = operation.write_to(&mut stream);
        let failed = result.is_err();
        trace!("session {} send completed: {result:?}", key.session);

        let completion = Completion {
            key,
            result,
            operation,
        };
        if port.send(Event::Completion(completion)).is_err() || failed {
            break;
        }
    }
    debug!("session {} send thread exiting", key.session);
}

/// A socket bound to a [`CompletionPort`]. Dropping it closes the socket and joins
/// its submission threads.
pub struct Association {
    key: CompletionKey,
    stream: TcpStream,
    receives: Option<mpsc::Sender<Lease<Overlapped>>>,
    sends: Option<mpsc::Sender<Lease<Overlapped>>>,
    threads: Vec<JoinHandle<()>>,
}

impl Association {
    pub fn key(&self) -> CompletionKey {
        self.key
    }

    /// Submits a receive. Its completion is posted to the port.
    pub fn receive(&self, operation: Lease<Overlapped>) -> Result<(), PortError> {
        Self::submit(&self.receives, operation)
    }

    /// Submits a send. Sends are written in submission order.
    pub fn send(&self, operation: Lease<Overlapped>) -> Result<(), PortError> {
        Self::submit(&self.sends, operation)
    }

    /// Shuts the socket down; outstanding operations complete with a failure or zero bytes.
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("session {} shutdown: {e}", self.key.session);
        }
    }

    fn submit(
        queue: &Option<mpsc::Sender<Lease<Overlapped>>>,
        operation: Lease<Overlapped>,
    ) -> Result<(), PortError> {
        queue
            .as_ref()
            .ok_or(PortError::Closed)?
            .send(operation)
            .map_err(|_| PortError::Closed)
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        self.shutdown();
        drop(self.receives.take());
        drop(self.sends.take());

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                debug!("session {} submission thread panicked", self.key.session);
            }
        }
    }
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("key", &self.key)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, time::Duration};

    use crate::memory::{BufferPool, Pool, PoolConfig};

    use super::*;

    fn pools() -> (Pool<Overlapped>, BufferPool) {
        let config = PoolConfig {
            chunk_size: 4,
            max_chunks: 4,
        };
        (
            Pool::new("operations", config, Overlapped::default),
            BufferPool::buffers("buffers", 64, config),
        )
    }

    fn next(port: &CompletionPort) -> Completion {
        let event = port
            .receiver()
            .lock()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        match event {
            Event::Completion(c) => c,
            Event::Shutdown => panic!("unexpected shutdown"),
        }
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn receive_completes_with_bytes() {
        let (server, mut client) = pair();
        let (operations, buffers) = pools();
        let port = CompletionPort::new();
        let key = CompletionKey {
            session: 3,
            generation: 1,
        };
        let association = port.associate(server, key).unwrap();

        let mut op = operations.allocate().unwrap();
        op.prepare_receive(Some(buffers.allocate().unwrap()), 64);
        association.receive(op).unwrap();
        client.write_all(b"hello").unwrap();

        let completion = next(&port);
        assert_eq!(completion.key, key);
        assert_eq!(completion.result.unwrap(), 5);
        assert_eq!(completion.operation.kind(), OperationKind::Receive);
        assert_eq!(completion.operation.received(), b"hello");
    }

    #[test]
    fn send_completes_and_releases_buffer() {
        let (server, mut client) = pair();
        let (operations, buffers) = pools();
        let port = CompletionPort::new();
        let key = CompletionKey {
            session: 0,
            generation: 0,
        };
        let association = port.associate(server, key).unwrap();

        let mut buffer = buffers.allocate().unwrap();
        buffer.as_mut_slice()[..4].copy_from_slice(b"pong");
        buffer.set_len(4);
        let mut op = operations.allocate().unwrap();
        op.prepare_send(buffer.freeze());
        association.send(op).unwrap();

        let completion = next(&port);
        assert_eq!(*completion.result.as_ref().unwrap(), 4);
        drop(completion);
        assert_eq!(buffers.stats().in_use, 0);
        assert_eq!(operations.stats().in_use, 0);

        let mut got = [0u8; 4];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"pong");
    }

    #[test]
    fn shutdown_surfaces_as_zero_length_receive() {
        let (server, _client) = pair();
        let (operations, buffers) = pools();
        let port = CompletionPort::new();
        let key = CompletionKey {
            session: 1,
            generation: 7,
        };
        let association = port.associate(server, key).unwrap();

        let mut op = operations.allocate().unwrap();
        op.prepare_receive(Some(buffers.allocate().unwrap()), 64);
        association.receive(op).unwrap();
        association.shutdown();

        let completion = next(&port);
        assert!(!matches!(completion.result, Ok(n) if n > 0));
        drop(association);
        assert!(matches!(
            port.receiver().lock().try_recv(),
            Err(mpsc::TryRecvError::Empty)
        ));
    }
}
