//! Operator variants and their shape-inference contracts.
//!
//! The graph core dispatches over a closed set of operator kinds. Each kind
//! carries its own attribute struct and knows how to infer its output shapes
//! from input shapes. Structurally invalid inputs surface as a typed
//! [`ShapeError`] so front ends can attach a diagnostic to the offending
//! operator instead of aborting compilation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::Shape;

/// Structural mismatch reported by shape inference.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("operator expects {expected} input(s), got {got}")]
    InputArity { expected: &'static str, got: usize },
    #[error("matmul operands must have rank >= 2, got {lhs} and {rhs}")]
    MatMulRank { lhs: usize, rhs: usize },
    #[error("matmul inner dimensions do not agree: {lhs} vs {rhs}")]
    InnerDimMismatch { lhs: usize, rhs: usize },
    #[error("batch dimensions cannot broadcast: {lhs} vs {rhs}")]
    BatchDimMismatch { lhs: usize, rhs: usize },
    #[error("rank mismatch between operands: expected {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },
    #[error("dimension mismatch at axis {axis}: {lhs} vs {rhs}")]
    DimMismatch { axis: usize, lhs: usize, rhs: usize },
    #[error("axis {axis} is out of range for rank {rank}")]
    AxisOutOfRange { axis: isize, rank: usize },
    #[error("{perm:?} is not a permutation of 0..{rank}")]
    InvalidPermutation { perm: Vec<usize>, rank: usize },
}

/// Attributes of a batched matrix multiplication.
///
/// The `trans_a`/`trans_b` flags logically swap the last two axes of the
/// corresponding operand; the fusion pass toggles them when it folds an
/// adjacent transpose into the matmul.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatMulSpec {
    pub trans_a: bool,
    pub trans_b: bool,
}

/// Attributes of an axis permutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    /// Output axis `i` reads input axis `perm[i]`.
    pub perm: Vec<usize>,
}

/// Attributes of a concatenation along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    /// Concatenation axis; negative values count from the last axis.
    pub axis: isize,
}

/// A graph operator kind together with its attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    MatMul(MatMulSpec),
    Transpose(TransposeSpec),
    Concat(ConcatSpec),
    Relu,
}

impl Operation {
    /// Short kind name used in dumps and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::MatMul(_) => "matmul",
            Operation::Transpose(_) => "transpose",
            Operation::Concat(_) => "concat",
            Operation::Relu => "relu",
        }
    }

    /// Number of output tensors the variant produces.
    pub fn output_count(&self) -> usize {
        1
    }

    /// Checks that `inputs` matches the variant's declared arity.
    pub fn validate_input_arity(&self, inputs: usize) -> Result<(), ShapeError> {
        let ok = match self {
            Operation::MatMul(_) => inputs == 2,
            Operation::Transpose(_) | Operation::Relu => inputs == 1,
            Operation::Concat(_) => inputs >= 1,
        };
        if ok {
            return Ok(());
        }
        let expected = match self {
            Operation::MatMul(_) => "2",
            Operation::Transpose(_) | Operation::Relu => "1",
            Operation::Concat(_) => "at least 1",
        };
        Err(ShapeError::InputArity {
            expected,
            got: inputs,
        })
    }

    /// Infers the output shapes for the given input shapes.
    ///
    /// The returned vector always has exactly [`output_count`](Self::output_count)
    /// entries on success.
    pub fn infer_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        self.validate_input_arity(inputs.len())?;
        match self {
            Operation::MatMul(spec) => infer_matmul(spec, inputs),
            Operation::Transpose(spec) => infer_transpose(spec, inputs),
            Operation::Concat(spec) => infer_concat(spec, inputs),
            Operation::Relu => Ok(vec![inputs[0].clone()]),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::MatMul(spec) => write!(
                f,
                "MatMul({},{})",
                if spec.trans_a { "A^T" } else { "A" },
                if spec.trans_b { "B^T" } else { "B" }
            ),
            Operation::Transpose(spec) => write!(f, "Transpose(perm={:?})", spec.perm),
            Operation::Concat(spec) => write!(f, "Concat(axis={})", spec.axis),
            Operation::Relu => write!(f, "Relu"),
        }
    }
}

/// Resolves a possibly negative axis against `rank`.
pub fn normalize_axis(axis: isize, rank: usize) -> Result<usize, ShapeError> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(ShapeError::AxisOutOfRange { axis, rank });
    }
    Ok(resolved as usize)
}

fn infer_matmul(spec: &MatMulSpec, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
    let mut a = inputs[0].dims().to_vec();
    let mut b = inputs[1].dims().to_vec();
    if a.len() < 2 || b.len() < 2 {
        return Err(ShapeError::MatMulRank {
            lhs: a.len(),
            rhs: b.len(),
        });
    }
    if spec.trans_a {
        let rank = a.len();
        a.swap(rank - 1, rank - 2);
    }
    if spec.trans_b {
        let rank = b.len();
        b.swap(rank - 1, rank - 2);
    }

    let (m, k_lhs) = (a[a.len() - 2], a[a.len() - 1]);
    let (k_rhs, n) = (b[b.len() - 2], b[b.len() - 1]);
    if k_lhs != k_rhs {
        return Err(ShapeError::InnerDimMismatch {
            lhs: k_lhs,
            rhs: k_rhs,
        });
    }

    let mut dims = broadcast_batch(&a[..a.len() - 2], &b[..b.len() - 2])?;
    dims.push(m);
    dims.push(n);
    Ok(vec![Shape::new(dims)])
}

/// Broadcasts batch dimensions right-aligned.
///
/// Paired dims must be equal or one of them 1, with the output taking the
/// larger size. Unpaired leading dims of the longer operand are kept unless
/// they are 1, which carry no batch extent of their own and are squeezed.
fn broadcast_batch(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let mut out = Vec::with_capacity(lhs.len().max(rhs.len()));
    let mut i = lhs.len();
    let mut j = rhs.len();
    while i > 0 && j > 0 {
        i -= 1;
        j -= 1;
        let (l, r) = (lhs[i], rhs[j]);
        if l != r && l != 1 && r != 1 {
            return Err(ShapeError::BatchDimMismatch { lhs: l, rhs: r });
        }
        out.push(l.max(r));
    }
    let rest = if i > 0 { &lhs[..i] } else { &rhs[..j] };
    for &dim in rest.iter().rev() {
        if dim != 1 {
            out.push(dim);
        }
    }
    out.reverse();
    Ok(out)
}

fn infer_transpose(spec: &TransposeSpec, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
    let dims = inputs[0].dims();
    let rank = dims.len();
    if spec.perm.len() != rank {
        return Err(ShapeError::InvalidPermutation {
            perm: spec.perm.clone(),
            rank,
        });
    }
    let mut seen = vec![false; rank];
    let mut out = Vec::with_capacity(rank);
    for &axis in &spec.perm {
        if axis >= rank || seen[axis] {
            return Err(ShapeError::InvalidPermutation {
                perm: spec.perm.clone(),
                rank,
            });
        }
        seen[axis] = true;
        out.push(dims[axis]);
    }
    Ok(vec![Shape::new(out)])
}

fn infer_concat(spec: &ConcatSpec, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
    let rank = inputs[0].rank();
    let axis = normalize_axis(spec.axis, rank)?;
    let mut dims = inputs[0].dims().to_vec();
    for shape in &inputs[1..] {
        if shape.rank() != rank {
            return Err(ShapeError::RankMismatch {
                expected: rank,
                got: shape.rank(),
            });
        }
        for (idx, (&lhs, &rhs)) in dims.iter().zip(shape.dims()).enumerate() {
            if idx != axis && lhs != rhs {
                return Err(ShapeError::DimMismatch {
                    axis: idx,
                    lhs,
                    rhs,
                });
            }
        }
        dims[axis] += shape.dims()[axis];
    }
    Ok(vec![Shape::new(dims)])
}
