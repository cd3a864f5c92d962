//! Byte buffers owned by a flow session
//!
//! A `StreamBuffer` is a bounded FIFO of bytes. UDP sessions build theirs in
//! datagram mode, which additionally remembers where each appended chunk ended so
//! that one datagram can be taken at a time. Byte-oriented takes work in both modes
//! and keep the boundary list consistent.
//!
//! Buffers are not synchronized; the session wraps each one in its own lock.

use std::collections::VecDeque;

use crate::error::BufferError;

/// Bounded byte FIFO with optional datagram boundaries
#[derive(Debug)]
pub struct StreamBuffer {
    data: Vec<u8>,
    /// Lengths of the buffered datagrams, front first (datagram mode only)
    boundaries: Option<VecDeque<usize>>,
    limit: usize,
}

impl StreamBuffer {
    /// Byte-stream buffer bounded at `limit` bytes
    pub fn stream(limit: usize) -> Self {
        StreamBuffer {
            data: Vec::new(),
            boundaries: None,
            limit,
        }
    }

    /// Buffer that keeps datagram boundaries
    pub fn datagram(limit: usize) -> Self {
        StreamBuffer {
            data: Vec::new(),
            boundaries: Some(VecDeque::new()),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes that can still be appended before hitting the limit
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.data.len())
    }

    /// Append a whole chunk or nothing
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), BufferError> {
        if chunk.len() > self.remaining() {
            return Err(BufferError::Capacity {
                len: self.data.len(),
                incoming: chunk.len(),
                limit: self.limit,
            });
        }
        self.data.try_reserve(chunk.len()).map_err(BufferError::Alloc)?;
        if let Some(boundaries) = self.boundaries.as_mut() {
            boundaries.try_reserve(1).map_err(BufferError::Alloc)?;
            if !chunk.is_empty() {
                boundaries.push_back(chunk.len());
            }
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    /// Put bytes back in front of whatever is buffered.
    ///
    /// Used for the unwritten tail of a partial socket write, so the limit is not
    /// enforced here: those bytes were already accounted for once.
    pub fn prepend(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut joined = Vec::with_capacity(chunk.len() + self.data.len());
        joined.extend_from_slice(chunk);
        joined.extend_from_slice(&self.data);
        self.data = joined;
        if let Some(boundaries) = self.boundaries.as_mut() {
            boundaries.push_front(chunk.len());
        }
    }

    /// Take everything
    pub fn take_all(&mut self) -> Vec<u8> {
        if let Some(boundaries) = self.boundaries.as_mut() {
            boundaries.clear();
        }
        std::mem::take(&mut self.data)
    }

    /// Take at most `max` bytes from the front; the rest stays buffered
    pub fn take_up_to(&mut self, max: usize) -> Vec<u8> {
        if max >= self.data.len() {
            return self.take_all();
        }
        let rest = self.data.split_off(max);
        let head = std::mem::replace(&mut self.data, rest);
        self.consume_boundaries(head.len());
        head
    }

    /// Take the oldest datagram. In stream mode this is the same as `take_all`.
    pub fn take_datagram(&mut self) -> Option<Vec<u8>> {
        if self.data.is_empty() {
            return None;
        }
        let len = match self.boundaries.as_ref().and_then(|b| b.front().copied()) {
            Some(len) => len,
            None => return Some(self.take_all()),
        };
        Some(self.take_up_to(len))
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.take_all();
    }

    fn consume_boundaries(&mut self, mut taken: usize) {
        let boundaries = match self.boundaries.as_mut() {
            Some(b) => b,
            None => return,
        };
        while taken > 0 {
            match boundaries.front_mut() {
                Some(front) if *front <= taken => {
                    taken -= *front;
                    boundaries.pop_front();
                }
                Some(front) => {
                    *front -= taken;
                    taken = 0;
                }
                None => break,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
