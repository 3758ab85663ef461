//! Bounds-checked read cursor
//!
//! Every field access checks the remaining length first and fails with
//! [`ClipboardError::NotEnoughBytes`] instead of reading out of bounds.
//! Integers are little-endian.

use bytes::Buf;

use crate::clipboard::error::{ClipboardError, Result};

/// Cursor over a received CLIPRDR message
#[derive(Debug, Clone)]
pub struct ReadCursor<'a> {
    buf: &'a [u8],
    context: &'static str,
}

impl<'a> ReadCursor<'a> {
    /// Create a cursor; `context` names the structure in error messages
    pub fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self { buf, context }
    }

    /// Change the structure name used in subsequent errors
    pub fn set_context(&mut self, context: &'static str) {
        self.context = context;
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Fail unless at least `size` bytes remain
    pub fn ensure(&self, size: usize) -> Result<()> {
        if self.buf.remaining() < size {
            return Err(ClipboardError::NotEnoughBytes {
                context: self.context,
                received: self.buf.remaining(),
                expected: size,
            });
        }
        Ok(())
    }

    /// Read a little-endian u16
    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    /// Read a little-endian u32
    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    /// Skip reserved bytes
    pub fn skip(&mut self, size: usize) -> Result<()> {
        self.ensure(size)?;
        self.buf.advance(size);
        Ok(())
    }

    /// Borrow the next `size` bytes
    pub fn read_slice(&mut self, size: usize) -> Result<&'a [u8]> {
        self.ensure(size)?;
        let (head, tail) = self.buf.split_at(size);
        self.buf = tail;
        Ok(head)
    }

    /// Borrow everything left
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    /// Look at the unread bytes without consuming them
    pub fn peek_remaining(&self) -> &'a [u8] {
        self.buf
    }
}
