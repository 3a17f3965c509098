use std::sync::Mutex;

use tracing::{debug, trace};

/// Reusable byte buffers for response payloads. The pool is an injected collaborator
///  rather than ambient global state so tests can supply a trivial implementation.
pub trait BufferPool: Send + Sync + 'static {
    /// a zeroed buffer of the given length, reusing a pooled allocation when possible
    fn take(&self, len: usize) -> Vec<u8>;

    /// hand a buffer back once its payload has been flushed
    fn reclaim(&self, buffer: Vec<u8>);
}

/// Default [BufferPool]: a bounded stack of reusable `Vec<u8>` allocations.
pub struct VecBufferPool {
    max_pool_size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl VecBufferPool {
    pub fn new(max_pool_size: usize) -> VecBufferPool {
        VecBufferPool {
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }
}

impl BufferPool for VecBufferPool {
    fn take(&self, len: usize) -> Vec<u8> {
        if let Some(mut buffer) = self.buffers.lock().unwrap().pop() {
            trace!("returning buffer from pool");
            buffer.clear();
            buffer.resize(len, 0);
            return buffer;
        }

        debug!("no buffer in pool: creating new buffer");
        vec![0; len]
    }

    fn reclaim(&self, buffer: Vec<u8>) {
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        } else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
