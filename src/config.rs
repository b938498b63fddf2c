//! Construction-time configuration for servers and clients.
//!
//! Nothing here can change once a [`Server`](crate::server::Server) or
//! [`Client`](crate::client::Client) has been built from it.
use std::{
    net::{Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    thread,
};

use thiserror::Error;

use crate::{
    memory::PoolConfig,
    protocol::{DEFAULT_MAX_PACKET_SIZE, HEADER_SIZE},
};

pub const DEFAULT_PORT: u16 = 7777;
pub const DEFAULT_MAX_SESSIONS: usize = 1024;
pub const DEFAULT_POOL_MAX_CHUNKS: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_sessions must be at least 1")]
    NoSessions,

    #[error("max_packet_size {0} cannot hold an 8 byte header")]
    PacketTooSmall(u32),

    #[error("{name} of {size} bytes cannot hold a {max_packet_size} byte packet")]
    BufferTooSmall {
        name: &'static str,
        size: usize,
        max_packet_size: u32,
    },

    #[error("pools provide {capacity} receive operations for {sessions} sessions")]
    PoolTooSmall { capacity: usize, sessions: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub address: SocketAddr,
    /// Size of the session table; connections beyond it are closed on accept.
    pub max_sessions: usize,
    /// Largest frame accepted, header included.
    pub max_packet_size: u32,
    /// Per-session receive accumulation buffer.
    pub receive_buffer_size: usize,
    /// Backing array of the shared packet ring.
    pub ring_capacity: usize,
    /// Completion workers; `0` means one per available core.
    pub workers: usize,
    /// Chunk limit for every buffer and operation pool.
    pub pool_max_chunks: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            receive_buffer_size: DEFAULT_MAX_PACKET_SIZE as usize * 2,
            ring_capacity: 1024 * 1024,
            workers: 0,
            pool_max_chunks: DEFAULT_POOL_MAX_CHUNKS,
        }
    }
}

impl ServerConfig {
    pub fn with_address(address: SocketAddr) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::NoSessions);
        }
        validate_buffers(
            self.max_packet_size,
            self.receive_buffer_size,
            self.ring_capacity,
        )?;

        let pool = self.pool_config();
        let capacity = pool.chunk_size * pool.max_chunks;
        if capacity < self.max_sessions {
            return Err(ConfigError::PoolTooSmall {
                capacity,
                sessions: self.max_sessions,
            });
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        match self.workers {
            0 => thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            n => n,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::for_sessions(self.max_sessions, self.pool_max_chunks)
    }

    /// Send buffers hold exactly one packet.
    pub fn send_buffer_size(&self) -> usize {
        self.max_packet_size as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub max_packet_size: u32,
    pub receive_buffer_size: usize,
    pub ring_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            receive_buffer_size: DEFAULT_MAX_PACKET_SIZE as usize * 2,
            ring_capacity: 256 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_buffers(
            self.max_packet_size,
            self.receive_buffer_size,
            self.ring_capacity,
        )
    }
}

fn validate_buffers(
    max_packet_size: u32,
    receive_buffer_size: usize,
    ring_capacity: usize,
) -> Result<(), ConfigError> {
    if (max_packet_size as usize) < HEADER_SIZE {
        return Err(ConfigError::PacketTooSmall(max_packet_size));
    }
    for (name, size) in [
        ("receive_buffer_size", receive_buffer_size),
        ("ring_capacity", ring_capacity),
    ] {
        if size < max_packet_size as usize {
            return Err(ConfigError::BufferTooSmall {
                name,
                size,
                max_packet_size,
            });
        }
    }
    Ok(())
}
