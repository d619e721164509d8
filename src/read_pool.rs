//! The shared pool that stages disk reads for every subpartition view.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{debug, info};

use crate::pool::{PooledSegment, Recycler};
use crate::{Result, ShuffleError};

/// Upper bound on the bytes a single read request may stage.
const REQUEST_BYTES: usize = 8 * 1024 * 1024;

struct ReadPoolState {
    free: Vec<Box<[u8]>>,
    allocated: usize,
    destroyed: bool,
}

/// A byte-bounded pool of read buffers shared by all views.
///
/// Buffers are allocated lazily up to `total_bytes / buffer_size` and cached
/// after their first use.
pub struct ReadBufferPool {
    total_bytes: usize,
    buffer_size: usize,
    num_total_buffers: usize,
    buffers_per_request: usize,
    state: Mutex<ReadPoolState>,
    available: Condvar,
}

impl ReadBufferPool {
    /// Creates a pool holding at most `total_bytes` in buffers of `buffer_size` bytes.
    pub fn new(total_bytes: usize, buffer_size: usize) -> Result<Arc<Self>> {
        if buffer_size == 0 || total_bytes < buffer_size {
            return Err(ShuffleError::InvalidConfiguration(format!(
                "read buffer pool of {} bytes cannot hold buffers of {} bytes",
                total_bytes, buffer_size
            )));
        }

        let num_total_buffers = total_bytes / buffer_size;
        let buffers_per_request = num_total_buffers.min((REQUEST_BYTES / buffer_size).max(1));

        info!(
            total_bytes,
            buffer_size, num_total_buffers, buffers_per_request, "Created read buffer pool"
        );

        Ok(Arc::new(Self {
            total_bytes,
            buffer_size,
            num_total_buffers,
            buffers_per_request,
            state: Mutex::new(ReadPoolState {
                free: Vec::new(),
                allocated: 0,
                destroyed: false,
            }),
            available: Condvar::new(),
        }))
    }

    /// Takes between one and `max.min(buffers_per_request)` buffers.
    ///
    /// Blocks until at least one buffer is free. Fails once the pool is destroyed.
    pub fn request_buffers(self: &Arc<Self>, max: usize) -> Result<Vec<PooledSegment>> {
        let wanted = max.clamp(1, self.buffers_per_request);
        let mut state = self.state.lock();

        loop {
            if state.destroyed {
                return Err(ShuffleError::BufferPoolDestroyed);
            }

            let in_use = state.allocated - state.free.len();
            let available = self.num_total_buffers - in_use;
            if available > 0 {
                let count = wanted.min(available);
                let mut buffers = Vec::with_capacity(count);
                for _ in 0..count {
                    let segment = match state.free.pop() {
                        Some(segment) => segment,
                        None => {
                            state.allocated += 1;
                            vec![0u8; self.buffer_size].into_boxed_slice()
                        }
                    };
                    buffers.push(PooledSegment::new(
                        segment,
                        Arc::clone(self) as Arc<dyn Recycler>,
                    ));
                }
                return Ok(buffers);
            }

            debug!(
                total_buffers = self.num_total_buffers,
                "Read buffer pool exhausted, waiting"
            );
            self.available.wait(&mut state);
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn num_total_buffers(&self) -> usize {
        self.num_total_buffers
    }

    /// Quota of buffers a single read request may take.
    pub fn buffers_per_request(&self) -> usize {
        self.buffers_per_request
    }

    /// Buffers that can be handed out without waiting.
    pub fn num_available_buffers(&self) -> usize {
        let state = self.state.lock();
        if state.destroyed {
            return 0;
        }
        self.num_total_buffers - (state.allocated - state.free.len())
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Frees cached buffers and fails all current and future requests.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            state.destroyed = true;
            let cached = state.free.len();
            state.free.clear();
            state.allocated -= cached;
        }
        self.available.notify_all();
    }
}

impl Recycler for ReadBufferPool {
    fn recycle(&self, segment: Box<[u8]>) {
        let mut state = self.state.lock();
        if state.destroyed {
            state.allocated -= 1;
            return;
        }
        state.free.push(segment);
        drop(state);
        self.available.notify_all();
    }
}
