//! Fixed-capacity frame pools.
//!
//! A pool pre-allocates every frame up front from a [`FrameAllocator`],
//! trying candidate formats in order until one is supported.  Acquired frames
//! are free again once every outside reference is dropped, which is what
//! makes a [`MemoryMapperCache`](crate::cache::MemoryMapperCache) keyed on
//! their handles sound.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::error::{PrismError, Result};
use crate::frame::Frame;
use crate::types::{ImageFormat, MemoryType};

/// Backend allocator producing one frame of a given image format.
pub trait FrameAllocator: Send + Sync {
    fn memory_type(&self) -> MemoryType;

    fn allocate(&self, format: ImageFormat) -> Result<Arc<Frame>>;
}

pub struct FramePool {
    frames: Vec<Arc<Frame>>,
    format: ImageFormat,
    memory_type: MemoryType,
    cursor: AtomicUsize,
}

impl FramePool {
    /// Allocate `capacity` frames in the first of `formats` the allocator
    /// accepts.  A recoverable failure on one format moves on to the next;
    /// the last format's error is returned if none work.
    pub fn new(
        allocator: &dyn FrameAllocator,
        formats: &[ImageFormat],
        capacity: usize,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(PrismError::invalid("frame pool capacity must be non-zero"));
        }
        let Some((&last, candidates)) = formats.split_last() else {
            return Err(PrismError::invalid("frame pool needs at least one format"));
        };

        let mut chosen = None;
        for &format in candidates {
            match allocator.allocate(format) {
                Ok(frame) => {
                    chosen = Some((format, frame));
                    break;
                }
                Err(err) if err.is_recoverable() => {
                    warn!(
                        memory_type = %allocator.memory_type(),
                        format = format.as_str(),
                        error = %err,
                        "Format rejected by allocator, trying next"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        let (format, first) = match chosen {
            Some(found) => found,
            None => (last, allocator.allocate(last)?),
        };

        let mut frames = Vec::with_capacity(capacity);
        frames.push(first);
        for _ in 1..capacity {
            frames.push(allocator.allocate(format)?);
        }

        info!(
            memory_type = %allocator.memory_type(),
            format = format.as_str(),
            capacity,
            "Frame pool allocated"
        );

        Ok(Self {
            frames,
            format,
            memory_type: allocator.memory_type(),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Next frame nobody outside the pool references, reset for reuse.
    pub fn acquire(&self) -> Result<Arc<Frame>> {
        let capacity = self.frames.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for step in 0..capacity {
            let frame = &self.frames[(start + step) % capacity];
            if Arc::strong_count(frame) == 1 {
                frame.clear_metadata();
                frame.clear_regions();
                frame.clear_parent();
                return Ok(Arc::clone(frame));
            }
        }
        debug!(memory_type = %self.memory_type, capacity, "Frame pool exhausted");
        Err(PrismError::PoolExhausted { capacity })
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Frames currently free to acquire.
    pub fn available(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| Arc::strong_count(frame) == 1)
            .count()
    }
}
