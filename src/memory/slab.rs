//! Fixed-capacity chunked slab of reusable objects.
//!
//! Objects live in chunks of `chunk_size` slots. [`Slab::allocate`] checks an object
//! out of a free slot, constructing one only if the slot has never held one; when
//! every slot is taken a new chunk is appended. [`Slab::destroy`] parks the object
//! back in its slot, and trailing empty chunks are released (dropping their parked
//! objects) until at most one spare empty chunk remains. Keys stay valid while their
//! object is checked out, since chunks are only released from the tail and only
//! when empty.

use std::mem;

use log::trace;

/// Location of a checked-out object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlabKey {
    chunk: u32,
    slot: u32,
}

#[derive(Debug)]
enum Slot<T> {
    Vacant,
    Parked(T),
    Occupied,
}

#[derive(Debug)]
struct Chunk<T> {
    slots: Vec<Slot<T>>,
    parked: Vec<u32>,
    vacant: Vec<u32>,
}

impl<T> Chunk<T> {
    fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || Slot::Vacant);
        Self {
            slots,
            parked: Vec::new(),
            vacant: (0..size as u32).rev().collect(),
        }
    }

    fn has_free(&self) -> bool {
        !self.parked.is_empty() || !self.vacant.is_empty()
    }

    fn used(&self) -> usize {
        self.slots.len() - self.parked.len() - self.vacant.len()
    }
}

#[derive(Debug)]
pub struct Slab<T> {
    chunks: Vec<Chunk<T>>,
    chunk_size: usize,
    len: usize,
}

impl<T> Slab<T> {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0);

        Self {
            chunks: Vec::new(),
            chunk_size,
            len: 0,
        }
    }

    /// Checks out an object, reusing a parked one when the chosen chunk has one and
    /// calling `create` otherwise. Grows by one chunk if every slot is taken.
    pub fn allocate<F>(&mut self, create: F) -> (SlabKey, T)
    where
        F: FnOnce() -> T,
    {
        let chunk = match self.chunks.iter().position(Chunk::has_free) {
            Some(idx) => idx,
            None => {
                self.chunks.push(Chunk::new(self.chunk_size));
                trace!("slab grew to {} chunks", self.chunks.len());
                self.chunks.len() - 1
            }
        };

        let target = &mut self.chunks[chunk];
        let slot = target
            .parked
            .pop()
            .or_else(|| target.vacant.pop())
            .unwrap_or_default();
        let value = match mem::replace(&mut target.slots[slot as usize], Slot::Occupied) {
            Slot::Parked(value) => value,
            _ => create(),
        };
        self.len += 1;

        (
            SlabKey {
                chunk: chunk as u32,
                slot,
            },
            value,
        )
    }

    /// Parks `value` back in the slot at `key`. Returns `false`, dropping `value`,
    /// if `key` is not checked out.
    pub fn destroy(&mut self, key: SlabKey, value: T) -> bool {
        let Some(chunk) = self.chunks.get_mut(key.chunk as usize) else {
            return false;
        };
        let Some(slot) = chunk.slots.get_mut(key.slot as usize) else {
            return false;
        };
        if !matches!(slot, Slot::Occupied) {
            return false;
        }

        *slot = Slot::Parked(value);
        chunk.parked.push(key.slot);
        self.len -= 1;
        self.shrink();
        true
    }

    /// Number of checked-out objects.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Objects waiting in free slots for reuse.
    pub fn parked(&self) -> usize {
        self.chunks.iter().map(|c| c.parked.len()).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Slots available across all chunks.
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.chunk_size
    }

    fn shrink(&mut self) {
        while let [.., spare, last] = self.chunks.as_slice() {
            if spare.used() > 0 || last.used() > 0 {
                break;
            }
            self.chunks.pop();
            trace!("slab shrank to {} chunks", self.chunks.len());
        }
    }
}
