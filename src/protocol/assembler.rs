use log::{debug, warn};

use super::{Frame, FrameError, HEADER_SIZE, Header};

/// Accumulates stream bytes into whole frames.
///
/// TCP delivers a byte stream, so one read can hold part of a frame, exactly one
/// frame, or the tail of one frame followed by the start of the next. Bytes are
/// appended at the current fill offset and frames are removed from the front,
/// shifting whatever follows down to offset 0.
#[derive(Debug)]
pub struct Assembler {
    buffer: Box<[u8]>,
    filled: usize,
    /// Bytes of a dropped oversize frame that have not arrived yet.
    skip: usize,
    max_packet_size: u32,
}

impl Assembler {
    pub fn new(capacity: usize, max_packet_size: u32) -> Self {
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            filled: 0,
            skip: 0,
            max_packet_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of bytes currently accumulated.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Free space behind the accumulated bytes.
    pub fn spare(&self) -> usize {
        self.buffer.len() - self.filled
    }

    /// Writable region behind the accumulated bytes, for reading straight off a socket.
    /// Follow with [`Assembler::commit`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.filled..]
    }

    /// Marks `n` bytes written through [`Assembler::spare_mut`] as received.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.spare(), "commit past end of receive buffer");
        self.filled = (self.filled + n).min(self.buffer.len());
        self.drain_skip();
    }

    /// Appends `bytes` at the current offset, returning how many fitted.
    pub fn receive(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.spare());
        if n < bytes.len() {
            warn!(
                "receive buffer full, {} of {} bytes discarded",
                bytes.len() - n,
                bytes.len()
            );
        }
        self.buffer[self.filled..self.filled + n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    /// Returns the frame at the front if it has fully arrived.
    ///
    /// Oversize and malformed frames at the front are dropped on the way.
    pub fn received_packet(&mut self) -> Option<Frame<'_>> {
        let header = self.front()?;
        let len = header.length as usize;
        Some(Frame::from_parts(header, &self.buffer[..len]))
    }

    /// Removes one assembled frame from the front. Returns `false` if none is complete.
    pub fn pop_received_packet(&mut self) -> bool {
        match self.front() {
            Some(header) => {
                self.consume(header.length as usize);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.filled = 0;
        self.skip = 0;
    }

    fn front(&mut self) -> Option<Header> {
        loop {
            let header = Header::decode(&self.buffer[..self.filled]).ok()?;
            match header.validate(self.max_packet_size) {
                Ok(()) if self.filled >= header.length as usize => return Some(header),
                Ok(()) => return None,
                Err(FrameError::Oversize { length, max }) => {
                    debug!("dropping frame of {length} bytes, maximum is {max}");
                    let present = (length as usize).min(self.filled);
                    self.consume(present);
                    self.skip = length as usize - present;
                }
                Err(e) => {
                    debug!("dropping header: {e}");
                    self.consume(HEADER_SIZE);
                }
            }
        }
    }

    fn drain_skip(&mut self) {
        if self.skip > 0 {
            let n = self.skip.min(self.filled);
            self.consume(n);
            self.skip -= n;
        }
    }

    fn consume(&mut self, n: usize) {
        self.buffer.copy_within(n..self.filled, 0);
        self.filled -= n;
    }
}
