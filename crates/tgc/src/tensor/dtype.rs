//! Enumerates the scalar element types a graph tensor can carry.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared by tensors and the memory planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 64-bit floating point, the widest float the planner aligns for.
    F64,
    /// 16-bit floating point with full mantissa (fp16).
    F16,
    /// 16-bit bfloat16 precision as used by many accelerators.
    BF16,
    /// 32-bit signed integer, primarily for index buffers.
    I32,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit signed integer.
    I64,
    /// 64-bit unsigned integer, the widest scalar currently supported.
    U64,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F64 | DType::I64 | DType::U64 => 8,
        }
    }

    /// Produces a stable tag used when serializing graphs for external tooling.
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F64 => 1,
            DType::F16 => 2,
            DType::BF16 => 3,
            DType::I32 => 4,
            DType::U32 => 5,
            DType::I64 => 6,
            DType::U64 => 7,
        }
    }

    /// Reconstructs a `DType` from its serialized tag representation.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::F64),
            2 => Some(DType::F16),
            3 => Some(DType::BF16),
            4 => Some(DType::I32),
            5 => Some(DType::U32),
            6 => Some(DType::I64),
            7 => Some(DType::U64),
            _ => None,
        }
    }
}
