//! Offset planner for a single contiguous memory arena.
//!
//! Placement follows a two-phase protocol: while uncommitted, `alloc`/`free`
//! compute byte offsets in a virtual arena and track the peak number of bytes
//! concurrently in use; [`Allocator::materialize`] then requests one real
//! buffer of exactly that peak size from the provider, after which every
//! further placement request is rejected.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;

use super::{MemoryError, MemoryProvider};

/// Alignment quantum: the size of the widest scalar a tensor can carry.
const DEFAULT_ALIGNMENT: usize = std::mem::size_of::<u64>();

/// Best-fit-by-first-fit offset planner with free-block coalescing.
pub struct Allocator<P: MemoryProvider> {
    provider: Arc<P>,
    alignment: usize,
    used: usize,
    peak: usize,
    /// Free blocks keyed by start offset; entries are non-overlapping and
    /// maximal (no two entries are mutually adjacent).
    free_blocks: BTreeMap<usize, usize>,
    committed: Option<P::Handle>,
}

/// Snapshot of the planner's accounting, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub used: usize,
    pub peak: usize,
}

impl fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "used {} B, peak {} B", self.used, self.peak)
    }
}

impl<P: MemoryProvider> Allocator<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Allocator {
            provider,
            alignment: DEFAULT_ALIGNMENT,
            used: 0,
            peak: 0,
            free_blocks: BTreeMap::new(),
            committed: None,
        }
    }

    /// Rounds `size` up to the next multiple of the alignment quantum.
    pub fn aligned_size(&self, size: usize) -> usize {
        (size + self.alignment - 1) / self.alignment * self.alignment
    }

    /// Plans an allocation of `size` bytes and returns its arena offset.
    ///
    /// Reuses the first free block large enough to hold the request, splitting
    /// off any remainder; otherwise places the block at the current `used`
    /// watermark. Rejected once the arena is committed.
    pub fn alloc(&mut self, size: usize) -> Result<usize, MemoryError> {
        self.ensure_uncommitted()?;
        let size = self.aligned_size(size);

        let reusable = self
            .free_blocks
            .iter()
            .find(|&(_, &len)| len >= size)
            .map(|(&offset, &len)| (offset, len));
        let offset = match reusable {
            Some((offset, len)) => {
                self.free_blocks.remove(&offset);
                if len > size {
                    self.free_blocks.insert(offset + size, len - size);
                }
                offset
            }
            None => self.used,
        };

        self.used += size;
        self.peak = self.peak.max(self.used);
        Ok(offset)
    }

    /// Returns a previously planned block to the free map, merging it with
    /// adjacent free blocks. `size` must be the value passed to `alloc`.
    pub fn free(&mut self, offset: usize, size: usize) -> Result<(), MemoryError> {
        self.ensure_uncommitted()?;
        let size = self.aligned_size(size);
        self.used = self
            .used
            .checked_sub(size)
            .ok_or(MemoryError::FreeUnderflow {
                bytes: size,
                used: self.used,
            })?;

        let mut start = offset;
        let mut len = size;
        if let Some((&prev_start, &prev_len)) = self.free_blocks.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free_blocks.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some((&next_start, &next_len)) = self.free_blocks.range(start + len..).next() {
            if start + len == next_start {
                self.free_blocks.remove(&next_start);
                len += next_len;
            }
        }
        debug_assert!(
            self.free_blocks
                .range(start..start + len)
                .next()
                .is_none(),
            "free block {start}+{len} overlaps an existing entry"
        );
        self.free_blocks.insert(start, len);
        Ok(())
    }

    /// Commits the plan, returning the backing buffer handle.
    ///
    /// The first call requests a buffer of exactly `peak` bytes from the
    /// provider; later calls return the cached handle unchanged. Once this
    /// returns, `alloc`/`free` are rejected.
    pub fn materialize(&mut self) -> Result<P::Handle, MemoryError> {
        if let Some(handle) = &self.committed {
            return Ok(handle.clone());
        }
        let handle = self.provider.allocate(self.peak)?;
        debug!("arena committed: {} B backing buffer ({})", self.peak, self.info());
        self.committed = Some(handle.clone());
        Ok(handle)
    }

    /// Current accounting snapshot; has no effect on state.
    pub fn info(&self) -> MemoryInfo {
        MemoryInfo {
            used: self.used,
            peak: self.peak,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.committed.is_some()
    }

    /// Free blocks in offset order, as `(offset, size)` pairs.
    pub fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_blocks.iter().map(|(&offset, &len)| (offset, len))
    }

    fn ensure_uncommitted(&self) -> Result<(), MemoryError> {
        match self.committed {
            None => Ok(()),
            Some(_) => Err(MemoryError::Committed {
                used: self.used,
                peak: self.peak,
            }),
        }
    }
}

impl<P: MemoryProvider> Drop for Allocator<P> {
    fn drop(&mut self) {
        if let Some(handle) = self.committed.take() {
            self.provider.release(handle);
        }
    }
}
