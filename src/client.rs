//! Blocking client transport.
//!
//! A [`Client`] owns two threads per connection. The receive thread blocks in `read`,
//! reassembles frames exactly as a server session does and queues them in a local
//! [`PacketRing`]. The send thread sleeps on a condition variable until a frame is
//! queued or the client shuts down, then writes queued frames one at a time.
//!
//! # Example
//! ```rust,no_run
//! use ringnet::client::Client;
//! use ringnet::config::ClientConfig;
//! use ringnet::protocol::Header;
//!
//! let mut client = Client::connect("127.0.0.1:7777", ClientConfig::default()).unwrap();
//! client.send(Header::new(1, 5).unwrap(), b"hello").unwrap();
//! client.process_received_packet(|frame| println!("{:?}", frame.payload()));
//! client.disconnect();
//! ```
use std::{
    collections::VecDeque,
    io::{self, Read},
    mem,
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{
    config::{ClientConfig, ConfigError},
    memory::PacketRing,
    protocol::{Assembler, Frame, FrameError, Header, ProtocolTransport, encode_frame},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to connect: {0}")]
    Connect(io::Error),
    #[error("failed to start client threads: {0}")]
    Spawn(io::Error),
    #[error("invalid packet: {0}")]
    Frame(#[from] FrameError),
    #[error("client is disconnected")]
    Disconnected,
}

struct Shared {
    incoming: Mutex<PacketRing>,
    spare: Mutex<Option<PacketRing>>,
    outbox: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    shutdown: AtomicBool,
    connected: AtomicBool,
}

pub struct Client {
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    max_packet_size: u32,
    ring_capacity: usize,
    threads: Vec<JoinHandle<()>>,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(address: A, config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;

        let stream = TcpStream::connect(address).map_err(ClientError::Connect)?;
        let peer = stream.peer_addr().map_err(ClientError::Connect)?;
        let shared = Arc::new(Shared {
            incoming: Mutex::new(PacketRing::new(config.ring_capacity)),
            spare: Mutex::new(Some(PacketRing::new(config.ring_capacity))),
            outbox: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        });

        let mut client = Self {
            shared,
            stream,
            peer,
            max_packet_size: config.max_packet_size,
            ring_capacity: config.ring_capacity,
            threads: Vec::with_capacity(2),
        };
        if let Err(e) = client.spawn(&config) {
            client.disconnect();
            return Err(ClientError::Spawn(e));
        }

        info!("connected to {peer}");
        Ok(client)
    }

    fn spawn(&mut self, config: &ClientConfig) -> io::Result<()> {
        let assembler = Assembler::new(config.receive_buffer_size, config.max_packet_size);
        let stream = self.stream.try_clone()?;
        let shared = Arc::clone(&self.shared);
        self.threads.push(
            thread::Builder::new()
                .name("ringnet-client-recv".into())
                .spawn(move || receive_loop(stream, shared, assembler))?,
        );

        let transport = ProtocolTransport::new(self.stream.try_clone()?, config.max_packet_size);
        let shared = Arc::clone(&self.shared);
        self.threads.push(
            thread::Builder::new()
                .name("ringnet-client-send".into())
                .spawn(move || send_loop(transport, shared))?,
        );
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// `false` once the server closed the connection or [`Client::disconnect`] ran.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire) && !self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Queues one packet for the send thread.
    pub fn send(&self, header: Header, payload: &[u8]) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }
        header.validate(self.max_packet_size)?;

        let mut frame = vec![0; header.length as usize];
        encode_frame(header, payload, &mut frame)?;
        self.shared.outbox.lock().push_back(frame);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Drains received frames in arrival order.
    pub fn process_received_packet<F>(&self, mut f: F)
    where
        F: FnMut(Frame<'_>),
    {
        let spare = self.shared.spare.lock().take();
        let spare = spare.unwrap_or_else(|| PacketRing::new(self.ring_capacity));
        let mut batch = mem::replace(&mut *self.shared.incoming.lock(), spare);

        while let Some(((), frame)) = batch.front() {
            f(frame);
            batch.pop();
        }
        *self.shared.spare.lock() = Some(batch);
    }

    /// Stops both threads and closes the socket. Queued but unsent packets are dropped.
    pub fn disconnect(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown of {}: {e}", self.peer);
        }
        {
            // Taking the lock orders the flag before the send thread's next check.
            let _outbox = self.shared.outbox.lock();
            self.shared.ready.notify_all();
        }

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("client thread panicked");
            }
        }
        info!("disconnected from {}", self.peer);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn receive_loop(mut stream: TcpStream, shared: Arc<Shared>, mut assembler: Assembler) {
    loop {
        match stream.read(assembler.spare_mut()) {
            Ok(0) => {
                debug!("connection closed");
                break;
            }
            Ok(n) => {
                assembler.commit(n);
                while let Some(frame) = assembler.received_packet() {
                    if let Err(e) = shared.incoming.lock().push_frame((), frame) {
                        debug!("frame not queued: {e}");
                    }
                    assembler.pop_received_packet();
                }
                trace!("received {n} bytes, {} pending", assembler.len());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !shared.shutdown.load(Ordering::Acquire) {
                    warn!("receive failed: {e} (os error {:?})", e.raw_os_error());
                }
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::Release);
    let _outbox = shared.outbox.lock();
    shared.ready.notify_all();
}

fn send_loop(mut transport: ProtocolTransport<TcpStream>, shared: Arc<Shared>) {
    loop {
        let frame = {
            let mut outbox = shared.outbox.lock();
            while outbox.is_empty()
                && !shared.shutdown.load(Ordering::Acquire)
                && shared.connected.load(Ordering::Acquire)
            {
                shared.ready.wait(&mut outbox);
            }
            if shared.shutdown.load(Ordering::Acquire) || !shared.connected.load(Ordering::Acquire)
            {
                break;
            }
            outbox.pop_front()
        };

        if let Some(frame) = frame {
            if let Err(e) = transport.write_frame(&frame) {
                warn!("send failed: {e}");
                break;
            }
        }
    }
    debug!("send thread exiting");
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        net::TcpListener,
        time::{Duration, Instant},
    };

    use crate::protocol::{HEADER_SIZE, Packet};

    use super::*;

    fn collect(client: &Client, want: usize) -> Vec<Packet> {
        let mut packets = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while packets.len() < want && Instant::now() < deadline {
            client.process_received_packet(|frame| packets.push(frame.to_packet()));
            thread::sleep(Duration::from_millis(5));
        }
        packets
    }

    #[test]
    fn sends_and_receives_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = Client::connect(listener.local_addr().unwrap(), ClientConfig::default())
            .unwrap();
        let (server, _) = listener.accept().unwrap();
        let mut server = ProtocolTransport::new(server, 1024);

        client.send(Header::new(2, 3).unwrap(), b"abc").unwrap();
        let packet = server.read_packet().unwrap();
        assert_eq!(packet, Packet::new(2, b"abc".to_vec()).unwrap());

        let reply = Packet::new(9, b"reply".to_vec()).unwrap();
        server.write_packet(reply.header, &reply.payload).unwrap();
        assert_eq!(collect(&client, 1), vec![reply]);
    }

    #[test]
    fn callback_can_drain_again() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = Client::connect(listener.local_addr().unwrap(), ClientConfig::default())
            .unwrap();
        let (server, _) = listener.accept().unwrap();
        let mut server = ProtocolTransport::new(server, 1024);

        server.write_packet(Header::new(1, 0).unwrap(), &[]).unwrap();
        let mut outer = Vec::new();
        let mut inner = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while outer.is_empty() && Instant::now() < deadline {
            client.process_received_packet(|frame| {
                outer.push(frame.kind());
                server.write_packet(Header::new(2, 0).unwrap(), &[]).unwrap();
                inner = collect(&client, 1);
            });
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(outer, vec![1]);
        assert_eq!(inner, vec![Packet::new(2, Vec::new()).unwrap()]);
    }

    #[test]
    fn reassembles_split_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = Client::connect(listener.local_addr().unwrap(), ClientConfig::default())
            .unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut bytes = vec![0u8; HEADER_SIZE + 12];
        encode_frame(Header::new(5, 12).unwrap(), b"twelve bytes", &mut bytes).unwrap();
        for chunk in bytes.chunks(3) {
            server.write_all(chunk).unwrap();
            server.flush().unwrap();
            thread::sleep(Duration::from_millis(1));
        }

        let packets = collect(&client, 1);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, b"twelve bytes");
    }

    #[test]
    fn server_close_is_observed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = Client::connect(listener.local_addr().unwrap(), ClientConfig::default())
            .unwrap();
        let (server, _) = listener.accept().unwrap();
        drop(server);

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(Header::new(1, 0).unwrap(), &[]),
            Err(ClientError::Disconnected)
        ));
        client.disconnect();
    }

    #[test]
    fn disconnect_joins_idle_threads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = Client::connect(listener.local_addr().unwrap(), ClientConfig::default())
            .unwrap();
        let _server = listener.accept().unwrap();

        client.disconnect();
        assert!(!client.is_connected());
        client.disconnect();
    }

    #[test]
    fn rejects_oversize_send() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ClientConfig {
            max_packet_size: 16,
            receive_buffer_size: 16,
            ring_capacity: 16,
        };
        let client = Client::connect(listener.local_addr().unwrap(), config).unwrap();

        assert!(matches!(
            client.send(Header::new(1, 20).unwrap(), &[0; 20]),
            Err(ClientError::Frame(FrameError::Oversize { .. }))
        ));
    }
}
