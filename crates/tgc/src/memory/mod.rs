//! Memory provider seam and arena bindings.
//!
//! The graph core never allocates real memory itself. A [`MemoryProvider`]
//! owns the single backing buffer; the [`Allocator`](crate::memory::Allocator)
//! only plans byte offsets inside a virtual arena and asks the provider for a
//! buffer once, sized to the planned peak. Tensors are then bound to an
//! [`ArenaSlice`] describing their position inside that buffer.

mod allocator;

use std::sync::Arc;

use thiserror::Error;

pub use allocator::{Allocator, MemoryInfo};

/// Failure reported by the placement planner or its backing provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("allocator already committed its buffer (used {used} B, peak {peak} B)")]
    Committed { used: usize, peak: usize },
    #[error("freeing {bytes} B exceeds the {used} B currently in use")]
    FreeUnderflow { bytes: usize, used: usize },
    #[error("backing allocation of {bytes} B failed")]
    Backing { bytes: usize },
}

/// Supplier and owner of raw arena buffers.
///
/// The allocator calls [`allocate`](Self::allocate) at most once per instance
/// (when it commits its plan) and [`release`](Self::release) exactly once at
/// teardown if a buffer was obtained.
pub trait MemoryProvider {
    /// Opaque buffer handle; clones refer to the same underlying buffer.
    type Handle: Clone;

    fn allocate(&self, bytes: usize) -> Result<Self::Handle, MemoryError>;
    fn release(&self, handle: Self::Handle);
}

/// Host-memory provider backed by a zero-filled shared byte buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemoryProvider;

impl MemoryProvider for SystemMemoryProvider {
    type Handle = HostBuffer;

    fn allocate(&self, bytes: usize) -> Result<HostBuffer, MemoryError> {
        Ok(HostBuffer {
            bytes: vec![0u8; bytes].into(),
        })
    }

    fn release(&self, handle: HostBuffer) {
        drop(handle);
    }
}

/// Shared host buffer; all clones observe the same base address.
#[derive(Debug, Clone)]
pub struct HostBuffer {
    bytes: Arc<[u8]>,
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Base address of the arena, stable across clones.
    pub fn base_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}

/// A tensor's committed position inside an arena buffer.
#[derive(Clone)]
pub struct ArenaSlice<H> {
    buffer: H,
    offset: usize,
    len: usize,
}

impl<H> ArenaSlice<H> {
    pub fn new(buffer: H, offset: usize, len: usize) -> Self {
        ArenaSlice {
            buffer,
            offset,
            len,
        }
    }

    pub fn buffer(&self) -> &H {
        &self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ArenaSlice<HostBuffer> {
    /// Address of the first byte of this slice, `base + offset`.
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.base_ptr().wrapping_add(self.offset)
    }
}
