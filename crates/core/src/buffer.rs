//! Byte stack used for every encode/decode on the wire.
//!
//! Writers push bytes onto the end of the stack. Once a frame is complete (or
//! has been received from a socket) it is [`ByteBuffer::flip`]ped, after which
//! [`ByteBuffer::pop`] yields bytes in the order they were originally pushed.

use std::fmt;

/// Binary stack for network IO.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Create an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Build a decode-ready buffer from bytes in wire order.
    pub fn from_wire(bytes: &[u8]) -> Self {
        let mut buffer = Self {
            data: bytes.to_vec(),
        };
        buffer.flip();
        buffer
    }

    /// Reserve space for at least `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Number of bytes currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw view of the stack in push order (wire order before a flip).
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Push a single byte.
    #[inline]
    pub fn push(&mut self, byte: u8) {
        self.data.push(byte);
    }

    /// Push a run of bytes, first byte first.
    pub fn push_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Pop the top byte, or `None` once the buffer is exhausted.
    #[inline]
    pub fn pop(&mut self) -> Option<u8> {
        self.data.pop()
    }

    /// Look at the top byte without removing it.
    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.data.last().copied()
    }

    /// Reverse the stack in place.
    ///
    /// Flipping twice restores the original order.
    pub fn flip(&mut self) {
        self.data.reverse();
    }

    /// Pop `count` bytes into a fresh buffer that is ready to decode.
    ///
    /// Returns `None` (and leaves `self` untouched) if fewer than `count`
    /// bytes remain.
    pub fn pop_buffer(&mut self, count: usize) -> Option<ByteBuffer> {
        if self.data.len() < count {
            return None;
        }
        let split = self.data.len() - count;
        Some(ByteBuffer {
            data: self.data.split_off(split),
        })
    }

    /// Pop `count` bytes and return them in wire order.
    pub fn pop_bytes(&mut self, count: usize) -> Option<Vec<u8>> {
        let mut sub = self.pop_buffer(count)?;
        sub.flip();
        Some(sub.data)
    }

    /// Drop all bytes.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Consume the buffer, returning the stack in push order.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteBuffer({} bytes)", self.data.len())
    }
}
