//! Growable capture buffer for incremental child output.
//!
//! Reads are amortized with a block-growth strategy: whenever spare capacity
//! drops below half a block, the buffer reserves one more block, then a
//! single read appends whatever the pipe has ready. Headroom stays between
//! half a block and a block and a half, so most readiness events cost one
//! syscall regardless of how chatty the child is.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Growth quantum for capture buffers.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Append-only byte buffer fed from an async pipe.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    bytes: Vec<u8>,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything captured so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Perform one read from `reader`, appending whatever arrives.
    ///
    /// Returns the number of bytes appended; 0 means end of data.
    pub async fn fill_from<R>(&mut self, reader: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let headroom = self.bytes.capacity() - self.bytes.len();
        if headroom < BLOCK_SIZE / 2 {
            self.bytes.reserve(BLOCK_SIZE);
        }
        reader.read_buf(&mut self.bytes).await
    }
}
