//! Splits a file into one contiguous byte range per worker.
//!
//! The file is counted in `chunk_size` units, and each worker gets
//! `ceil(num_chunks / workers)` of them. Ranges are clamped to the file size,
//! so trailing workers may get short or empty ranges, and the last worker
//! always ends exactly at the file size.

use crate::error::PlanError;

/// One worker's share of the file: `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub worker: usize,
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    total_size: u64,
    workers: usize,
    chunk_size: usize,
}

impl TransferPlan {
    pub fn new(total_size: u64, workers: usize, chunk_size: usize) -> Result<Self, PlanError> {
        if workers == 0 {
            return Err(PlanError::ZeroWorkers);
        }
        if chunk_size == 0 {
            return Err(PlanError::ZeroChunkSize);
        }
        Ok(Self {
            total_size,
            workers,
            chunk_size,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// `ceil(total_size / chunk_size)`.
    pub fn num_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size as u64)
    }

    /// `ceil(num_chunks / workers)`, at least 1.
    pub fn chunks_per_worker(&self) -> u64 {
        self.num_chunks().div_ceil(self.workers as u64).max(1)
    }

    /// Bytes assigned to each non-final worker before clamping.
    fn span(&self) -> u64 {
        self.chunks_per_worker()
            .saturating_mul(self.chunk_size as u64)
    }

    /// The range for `worker`, or `None` if it is out of bounds.
    pub fn range_for(&self, worker: usize) -> Option<ByteRange> {
        if worker >= self.workers {
            return None;
        }
        let span = self.span();
        let offset = (worker as u64).saturating_mul(span).min(self.total_size);
        let end = if worker + 1 == self.workers {
            self.total_size
        } else {
            offset.saturating_add(span).min(self.total_size)
        };
        Some(ByteRange {
            worker,
            offset,
            len: end - offset,
        })
    }

    /// All ranges, sorted by worker id.
    pub fn ranges(&self) -> Vec<ByteRange> {
        (0..self.workers).filter_map(|w| self.range_for(w)).collect()
    }
}
