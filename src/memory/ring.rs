//! Bounded circular packet buffer.
//!
//! Frames are copied into one contiguous backing array and described by a FIFO queue
//! of descriptors. A frame that does not fit before the end of the array wraps to
//! offset 0, provided that would not overwrite the oldest frame still waiting to be
//! popped. When neither fits, the frame is copied into its own heap block instead
//! (an escape allocation) and queued in order with the rest. Escapes cost an
//! allocation each but never drop a frame or block the producer.
//!
//! # Example
//! ```rust
//! use ringnet::memory::ring::PacketRing;
//! use ringnet::protocol::Header;
//!
//! let mut ring = PacketRing::new(64);
//! let header = Header::new(1, 4).unwrap();
//! ring.push((), header, b"ping").unwrap();
//!
//! let ((), frame) = ring.front().unwrap();
//! assert_eq!(frame.payload(), b"ping");
//! assert!(ring.pop());
//! assert!(ring.is_empty());
//! ```

use std::collections::VecDeque;

use log::warn;

use crate::protocol::{Frame, HEADER_SIZE, Header, encode_frame};

use super::MemoryError;

/// Where a pushed frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Ring { offset: usize },
    Escape,
}

#[derive(Debug)]
enum Storage {
    Ring { offset: usize, len: usize },
    Escape(Box<[u8]>),
}

#[derive(Debug)]
struct Descriptor<O> {
    owner: O,
    header: Header,
    storage: Storage,
}

#[derive(Debug)]
pub struct PacketRing<O = ()> {
    buffer: Box<[u8]>,
    queue: VecDeque<Descriptor<O>>,
    /// `(offset, len)` of ring-backed frames, oldest first.
    extents: VecDeque<(usize, usize)>,
    escapes: u64,
}

impl<O: Copy> PacketRing<O> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            queue: VecDeque::new(),
            extents: VecDeque::new(),
            escapes: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Queued frames, ring-backed and escaped.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Escape allocations made over the ring's lifetime.
    pub fn escapes(&self) -> u64 {
        self.escapes
    }

    /// Queues a frame built from `header` and `payload`.
    pub fn push(
        &mut self,
        owner: O,
        header: Header,
        payload: &[u8],
    ) -> Result<Placement, MemoryError> {
        let len = self.check(header)?;
        self.place(owner, header, len, |dst| {
            encode_frame(header, payload, dst)?;
            Ok(())
        })
    }

    /// Queues an already assembled frame.
    pub fn push_frame(&mut self, owner: O, frame: Frame<'_>) -> Result<Placement, MemoryError> {
        let header = frame.header();
        let len = self.check(header)?;
        self.place(owner, header, len, |dst| {
            dst.copy_from_slice(frame.as_bytes());
            Ok(())
        })
    }

    /// Oldest queued frame and its owner.
    pub fn front(&self) -> Option<(O, Frame<'_>)> {
        let descriptor = self.queue.front()?;
        let bytes = match &descriptor.storage {
            Storage::Ring { offset, len } => &self.buffer[*offset..*offset + *len],
            Storage::Escape(block) => &block[..],
        };
        Some((descriptor.owner, Frame::from_parts(descriptor.header, bytes)))
    }

    /// Drops the oldest frame. Returns `false` if the ring was empty.
    pub fn pop(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(Descriptor {
                storage: Storage::Ring { offset, .. },
                ..
            }) => {
                let released = self.extents.pop_front();
                debug_assert_eq!(released.map(|(o, _)| o), Some(offset));
                true
            }
            Some(Descriptor {
                storage: Storage::Escape(_),
                ..
            }) => true,
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.extents.clear();
    }

    fn check(&self, header: Header) -> Result<usize, MemoryError> {
        let len = header.length as usize;
        if len == 0 {
            return Err(MemoryError::EmptyPacket);
        }
        if len < HEADER_SIZE {
            return Err(MemoryError::Frame(crate::protocol::FrameError::Malformed(
                header.length,
            )));
        }
        if len > self.buffer.len() {
            return Err(MemoryError::PacketTooLarge {
                length: len,
                capacity: self.buffer.len(),
            });
        }
        Ok(len)
    }

    fn place<F>(
        &mut self,
        owner: O,
        header: Header,
        len: usize,
        write: F,
    ) -> Result<Placement, MemoryError>
    where
        F: FnOnce(&mut [u8]) -> Result<(), MemoryError>,
    {
        match self.reserve(len) {
            Some(offset) => {
                write(&mut self.buffer[offset..offset + len])?;
                self.extents.push_back((offset, len));
                self.queue.push_back(Descriptor {
                    owner,
                    header,
                    storage: Storage::Ring { offset, len },
                });
                Ok(Placement::Ring { offset })
            }
            None => {
                let mut block = vec![0; len].into_boxed_slice();
                write(&mut block)?;
                self.escapes += 1;
                warn!(
                    "packet ring full, escaping {len} byte frame to the heap ({} queued, {} escapes)",
                    self.queue.len(),
                    self.escapes
                );
                self.queue.push_back(Descriptor {
                    owner,
                    header,
                    storage: Storage::Escape(block),
                });
                Ok(Placement::Escape)
            }
        }
    }

    /// Finds `len` contiguous bytes that hold no unpopped frame.
    fn reserve(&self, len: usize) -> Option<usize> {
        let Some(&(oldest, _)) = self.extents.front() else {
            return Some(0);
        };
        let &(newest, newest_len) = self.extents.back()?;
        let write = newest + newest_len;

        if newest >= oldest {
            if write + len <= self.buffer.len() {
                Some(write)
            } else if len <= oldest {
                Some(0)
            } else {
                None
            }
        } else if write + len <= oldest {
            Some(write)
        } else {
            None
        }
    }
}
