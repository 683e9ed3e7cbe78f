//! Shared buffer pool for framing buffers.
//!
//! A `MessageWriter` rents exactly one buffer for its lifetime; the buffer
//! returns to the pool when the writer is dropped, rather than being freed.
use bytes::BytesMut;
use std::sync::{Arc, Mutex};

/// A pool of fixed-capacity byte buffers.
pub struct BufferPool {
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            free: Mutex::new(Vec::new()),
        })
    }

    /// Rents a buffer, reusing a previously-returned one when available.
    pub fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity));
        PooledBuffer {
            pool: self.clone(),
            buf: Some(buf),
        }
    }
}

/// A rented buffer. Clears and returns itself to the pool on drop.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    buf: Option<BytesMut>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            self.pool.free.lock().unwrap().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_buffer() {
        let pool = BufferPool::new(64);
        {
            let mut buf = pool.checkout();
            buf.extend_from_slice(&[1, 2, 3]);
        }
        assert_eq!(pool.free.lock().unwrap().len(), 1);
        let buf = pool.checkout();
        assert!(buf.is_empty());
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }
}
