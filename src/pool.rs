//! Fixed-size memory segments and the bounded pools they are drawn from.
//!
//! A [`GlobalBufferPool`] owns every segment of the process. Result partitions
//! write through a [`BufferPool`], which reserves a fixed number of segments
//! from the global pool and blocks the producer once all of them are in use.
//! Segments travel as [`PooledSegment`]s and return to their originating pool
//! when the last reference is dropped.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::{Result, ShuffleError};

/// Receives segments whose last holder has let go of them.
pub trait Recycler: Send + Sync {
    /// Takes a segment back.
    fn recycle(&self, segment: Box<[u8]>);
}

/// A segment on loan from a pool.
///
/// Writable until it is frozen into [`Bytes`]. Whichever happens last of
/// dropping the segment or dropping the final `Bytes` handle recycles it.
pub struct PooledSegment {
    segment: Option<Box<[u8]>>,
    len: usize,
    recycler: Arc<dyn Recycler>,
}

impl PooledSegment {
    pub(crate) fn new(segment: Box<[u8]>, recycler: Arc<dyn Recycler>) -> Self {
        Self {
            segment: Some(segment),
            len: 0,
            recycler,
        }
    }

    /// Total size of the segment.
    pub fn capacity(&self) -> usize {
        self.segment.as_ref().map_or(0, |s| s.len())
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies as much of `src` as fits and returns the number of bytes copied.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let Some(segment) = self.segment.as_mut() else {
            return 0;
        };
        let n = src.len().min(segment.len() - self.len);
        segment[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Exposes the first `len` bytes for an in-place fill, marking them written.
    pub(crate) fn fill(&mut self, len: usize) -> Option<&mut [u8]> {
        let segment = self.segment.as_mut()?;
        if len > segment.len() {
            return None;
        }
        self.len = len;
        Some(&mut segment[..len])
    }

    /// Freezes the written bytes into an immutable, shareable payload.
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl AsRef<[u8]> for PooledSegment {
    fn as_ref(&self) -> &[u8] {
        match &self.segment {
            Some(segment) => &segment[..self.len],
            None => &[],
        }
    }
}

impl Drop for PooledSegment {
    fn drop(&mut self) {
        if let Some(segment) = self.segment.take() {
            self.recycler.recycle(segment);
        }
    }
}

/// The process-wide pool of fixed-size memory segments.
pub struct GlobalBufferPool {
    segment_size: usize,
    total_segments: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    destroyed: AtomicBool,
}

impl GlobalBufferPool {
    /// Allocates `total_segments` segments of `segment_size` bytes each.
    pub fn new(total_segments: usize, segment_size: usize) -> Result<Arc<Self>> {
        if total_segments == 0 || segment_size == 0 {
            return Err(ShuffleError::InvalidConfiguration(format!(
                "global buffer pool needs a positive segment count and size, got {} x {}",
                total_segments, segment_size
            )));
        }

        let free = (0..total_segments)
            .map(|_| vec![0u8; segment_size].into_boxed_slice())
            .collect();

        info!(
            total_segments,
            segment_size, "Allocated global buffer pool"
        );

        Ok(Arc::new(Self {
            segment_size,
            total_segments,
            free: Mutex::new(free),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Reserves `capacity` segments for a new bounded pool.
    pub fn create_buffer_pool(self: &Arc<Self>, capacity: usize) -> Result<Arc<BufferPool>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ShuffleError::BufferPoolDestroyed);
        }
        if capacity == 0 {
            return Err(ShuffleError::InvalidConfiguration(
                "buffer pool capacity must be positive".to_string(),
            ));
        }

        let reserved = {
            let mut free = self.free.lock();
            if free.len() < capacity {
                return Err(ShuffleError::InsufficientSegments {
                    required: capacity,
                    available: free.len(),
                });
            }
            let at = free.len() - capacity;
            free.split_off(at)
        };

        Ok(Arc::new(BufferPool {
            global: Arc::clone(self),
            capacity,
            state: Mutex::new(PoolState {
                free: reserved,
                destroyed: false,
            }),
            available: Condvar::new(),
        }))
    }

    /// Segments not reserved by any pool nor held by any buffer.
    pub fn num_available_segments(&self) -> usize {
        self.free.lock().len()
    }

    pub fn total_segments(&self) -> usize {
        self.total_segments
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Frees all cached segments; later returns are dropped.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.free.lock().clear();
    }
}

impl Recycler for GlobalBufferPool {
    fn recycle(&self, segment: Box<[u8]>) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.free.lock().push(segment);
        }
    }
}

struct PoolState {
    free: Vec<Box<[u8]>>,
    destroyed: bool,
}

/// A bounded pool of segments used exclusively by one producer.
pub struct BufferPool {
    global: Arc<GlobalBufferPool>,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl BufferPool {
    /// Takes a segment, waiting for one to be recycled if the pool is exhausted.
    pub fn request_segment_blocking(self: &Arc<Self>) -> Result<PooledSegment> {
        let mut state = self.state.lock();
        loop {
            if state.destroyed {
                return Err(ShuffleError::BufferPoolDestroyed);
            }
            if let Some(segment) = state.free.pop() {
                return Ok(self.wrap(segment));
            }
            debug!(capacity = self.capacity, "Buffer pool exhausted, waiting");
            self.available.wait(&mut state);
        }
    }

    /// Takes a segment if one is free.
    pub fn try_request_segment(self: &Arc<Self>) -> Result<Option<PooledSegment>> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(ShuffleError::BufferPoolDestroyed);
        }
        Ok(state.free.pop().map(|segment| self.wrap(segment)))
    }

    fn wrap(self: &Arc<Self>, segment: Box<[u8]>) -> PooledSegment {
        PooledSegment::new(segment, Arc::clone(self) as Arc<dyn Recycler>)
    }

    /// Maximum number of segments this pool hands out at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn segment_size(&self) -> usize {
        self.global.segment_size()
    }

    /// Segments currently free in this pool.
    pub fn num_available_segments(&self) -> usize {
        let state = self.state.lock();
        if state.destroyed { 0 } else { state.free.len() }
    }

    /// Segments currently held by buffers. Zero once destroyed.
    pub fn num_used_buffers(&self) -> usize {
        let state = self.state.lock();
        if state.destroyed {
            0
        } else {
            self.capacity - state.free.len()
        }
    }

    /// True if a request would not block, or the pool no longer holds anything.
    pub fn is_available(&self) -> bool {
        let state = self.state.lock();
        state.destroyed || !state.free.is_empty()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Returns cached segments to the global pool and wakes blocked requesters.
    pub fn destroy(&self) {
        let free = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            std::mem::take(&mut state.free)
        };
        for segment in free {
            self.global.recycle(segment);
        }
        self.available.notify_all();
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Recycler for BufferPool {
    fn recycle(&self, segment: Box<[u8]>) {
        let mut state = self.state.lock();
        if state.destroyed {
            drop(state);
            self.global.recycle(segment);
            return;
        }
        state.free.push(segment);
        drop(state);
        self.available.notify_one();
    }
}
