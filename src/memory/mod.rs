//! Memory management for in-flight I/O.
//!
//! Everything a connection touches between the socket and the application is drawn
//! from this module: a chunked [`Slab`](slab::Slab) that stores pooled objects,
//! [`Pool`](pool::Pool)s of I/O buffers and operation descriptors built on top of it,
//! and the [`PacketRing`](ring::PacketRing) that queues decoded frames until the
//! application drains them.
//!
//! # See Also
//! - [`server`](crate::server): Main consumer of pooled buffers and the packet ring.
pub mod pool;
pub mod ring;
pub mod slab;

use thiserror::Error;

use crate::protocol::FrameError;

pub use pool::{BufferPool, IoBuffer, Lease, Pool, PoolConfig, PoolStats, Recycle, SharedBuffer};
pub use ring::{PacketRing, Placement};
pub use slab::{Slab, SlabKey};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("[pool][{pool}] exhausted at {capacity} objects")]
    Exhausted { pool: &'static str, capacity: usize },

    #[error("[ring] zero-length packet")]
    EmptyPacket,

    #[error("[ring] packet of {length} bytes exceeds ring capacity {capacity}")]
    PacketTooLarge { length: usize, capacity: usize },

    #[error("[ring] {0}")]
    Frame(#[from] FrameError),
}
