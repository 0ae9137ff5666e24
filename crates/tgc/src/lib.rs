//! Tensor graph compiler core.
//!
//! Represents a computation as a directed acyclic graph of operators and
//! tensors, rewrites it to remove redundant or fusible operations, linearizes
//! it into an execution order, and plans a single contiguous memory arena for
//! every tensor's backing storage. Numeric kernels, real device backends, and
//! model-import front ends are external collaborators consumed through the
//! narrow seams exposed here.

pub mod graph;
pub mod memory;
pub mod ops;
pub mod tensor;

pub use graph::{Fuid, Graph, OpId, TensorId};
pub use memory::{Allocator, MemoryError, MemoryProvider, SystemMemoryProvider};
pub use ops::{ConcatSpec, MatMulSpec, Operation, ShapeError, TransposeSpec};
pub use tensor::{DType, Shape};
