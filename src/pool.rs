//! Reusable frame-buffer pool
//!
//! Request serialization reuses `BytesMut` buffers across writes so the
//! steady state allocates nothing per request. Buffers start at 1 KiB and
//! grow with the largest frames they have carried; oversized buffers are
//! still returned to the pool so produce-heavy workloads keep their
//! capacity.

use bytes::BytesMut;
use tokio::sync::Mutex;

/// Initial capacity of a pooled buffer
pub const INITIAL_BUFFER_SIZE: usize = 1024;

/// Default maximum number of pooled buffers
pub const DEFAULT_MAX_BUFFERS: usize = 64;

/// A pool of reusable byte buffers to minimize per-request allocations
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    max_buffers: usize,
}

impl BufferPool {
    /// Create a new buffer pool holding at most `max_buffers` buffers
    pub fn new(max_buffers: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
        }
    }

    /// Get a cleared buffer from the pool or allocate a new one
    pub async fn get(&self) -> BytesMut {
        let mut buffers = self.buffers.lock().await;
        if let Some(mut buf) = buffers.pop() {
            buf.clear();
            buf
        } else {
            BytesMut::with_capacity(INITIAL_BUFFER_SIZE)
        }
    }

    /// Return a buffer to the pool for reuse
    pub async fn put(&self, buf: BytesMut) {
        let mut buffers = self.buffers.lock().await;
        if buffers.len() < self.max_buffers {
            buffers.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERS)
    }
}
