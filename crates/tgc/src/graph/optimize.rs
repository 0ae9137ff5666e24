//! Fixpoint fusion rewrites over the operator graph.
//!
//! Each round collects rewrite candidates in a read-only scan, then applies
//! them one at a time with every precondition re-checked against the live
//! graph, so earlier rewrites in a round simply invalidate later stale
//! candidates. Rounds repeat until a scan collects nothing. Every applied
//! rewrite removes at least one operator, which bounds the loop.

use log::debug;

use crate::memory::MemoryProvider;
use crate::ops::Operation;

use super::{Graph, OpId, OpNode};

pub(super) fn run<P: MemoryProvider>(graph: &mut Graph<P>) {
    if !graph.topo_sort() {
        return;
    }
    let mut round = 0usize;
    loop {
        let candidates = collect_candidates(graph);
        if candidates.is_empty() {
            break;
        }
        let mut applied = 0usize;
        for candidate in candidates {
            let ok = match candidate {
                Candidate::CancelTransposePair { first, second } => {
                    apply_cancel(graph, first, second)
                }
                Candidate::FoldTransposeIntoMatMul {
                    matmul,
                    input_index,
                    transpose,
                } => apply_fold(graph, matmul, input_index, transpose),
            };
            if ok {
                applied += 1;
            }
        }
        round += 1;
        debug!("fusion round {round}: applied {applied} rewrite(s)");
        if applied == 0 {
            break;
        }
    }
}

enum Candidate {
    /// Two chained transposes whose composition is the identity.
    CancelTransposePair { first: OpId, second: OpId },
    /// A transpose of the last two axes feeding one matmul operand.
    FoldTransposeIntoMatMul {
        matmul: OpId,
        input_index: usize,
        transpose: OpId,
    },
}

fn collect_candidates<P: MemoryProvider>(graph: &Graph<P>) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for node in graph.operators() {
        match node.operation() {
            Operation::Transpose(_) => {
                if let Some(first) = match_transpose_pair(graph, node) {
                    candidates.push(Candidate::CancelTransposePair {
                        first,
                        second: node.id(),
                    });
                }
            }
            Operation::MatMul(_) => {
                for input_index in 0..node.inputs().len() {
                    if let Some(transpose) = match_matmul_fold(graph, node, input_index) {
                        candidates.push(Candidate::FoldTransposeIntoMatMul {
                            matmul: node.id(),
                            input_index,
                            transpose,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    candidates
}

/// Matches `second` (a transpose) against a producing transpose whose sole
/// consumer it is and whose composition with `second` is the identity.
fn match_transpose_pair<P: MemoryProvider>(graph: &Graph<P>, second: &OpNode) -> Option<OpId> {
    let Operation::Transpose(second_spec) = second.operation() else {
        return None;
    };
    let mid = *second.inputs().first()?;
    let mid_tensor = graph.tensor(mid)?;
    if mid_tensor.targets() != &[second.id()] {
        return None;
    }
    let first = mid_tensor.source()?;
    let first_node = graph.operator(first)?;
    let Operation::Transpose(first_spec) = first_node.operation() else {
        return None;
    };
    let composed = compose_perms(&first_spec.perm, &second_spec.perm)?;
    // A non-identity composition is left in place; replacing the pair with a
    // single fused transpose is a different rewrite and not part of this pass.
    if !is_identity_perm(&composed) {
        return None;
    }
    Some(first)
}

/// Matches one matmul operand against a producing transpose that swaps only
/// the last two axes and feeds nothing else.
fn match_matmul_fold<P: MemoryProvider>(
    graph: &Graph<P>,
    matmul: &OpNode,
    input_index: usize,
) -> Option<OpId> {
    let operand = *matmul.inputs().get(input_index)?;
    let tensor = graph.tensor(operand)?;
    if tensor.targets() != &[matmul.id()] {
        return None;
    }
    let transpose = tensor.source()?;
    let node = graph.operator(transpose)?;
    let Operation::Transpose(spec) = node.operation() else {
        return None;
    };
    if !swaps_last_two_only(&spec.perm) {
        return None;
    }
    Some(transpose)
}

/// Removes a transpose pair that composes to the identity, rewiring every
/// consumer of the second transpose's output to the first transpose's input.
fn apply_cancel<P: MemoryProvider>(graph: &mut Graph<P>, first: OpId, second: OpId) -> bool {
    let (base, mid, out) = {
        let Some(first_node) = graph.operator(first) else {
            return false;
        };
        let Some(second_node) = graph.operator(second) else {
            return false;
        };
        let (Operation::Transpose(first_spec), Operation::Transpose(second_spec)) =
            (first_node.operation(), second_node.operation())
        else {
            return false;
        };
        let identity = compose_perms(&first_spec.perm, &second_spec.perm)
            .map_or(false, |composed| is_identity_perm(&composed));
        if !identity {
            return false;
        }
        let base = first_node.inputs()[0];
        let mid = first_node.outputs()[0];
        let out = second_node.outputs()[0];
        if second_node.inputs() != &[mid] {
            return false;
        }
        match graph.tensor(mid) {
            Some(tensor) if tensor.targets() == &[second] => {}
            _ => return false,
        }
        (base, mid, out)
    };

    let consumers = graph
        .tensor(out)
        .map(|t| t.targets().to_vec())
        .unwrap_or_default();
    for consumer in consumers {
        graph.replace_operator_input(consumer, out, base);
    }
    graph.remove_operator(first);
    graph.remove_operator(second);
    graph.remove_tensor(mid);
    graph.remove_tensor(out);
    graph.rederive_op_edges();
    true
}

/// Folds a last-two-axes transpose into a matmul operand by toggling the
/// corresponding transpose flag.
fn apply_fold<P: MemoryProvider>(
    graph: &mut Graph<P>,
    matmul: OpId,
    input_index: usize,
    transpose: OpId,
) -> bool {
    let (operand, base) = {
        let Some(matmul_node) = graph.operator(matmul) else {
            return false;
        };
        if !matches!(matmul_node.operation(), Operation::MatMul(_)) {
            return false;
        }
        let Some(&operand) = matmul_node.inputs().get(input_index) else {
            return false;
        };
        let Some(transpose_node) = graph.operator(transpose) else {
            return false;
        };
        let Operation::Transpose(spec) = transpose_node.operation() else {
            return false;
        };
        if transpose_node.outputs() != &[operand] || !swaps_last_two_only(&spec.perm) {
            return false;
        }
        match graph.tensor(operand) {
            Some(tensor)
                if tensor.source() == Some(transpose) && tensor.targets() == &[matmul] => {}
            _ => return false,
        }
        (operand, transpose_node.inputs()[0])
    };

    if let Some(node) = graph.operator_mut(matmul) {
        if let Operation::MatMul(spec) = node.operation_mut() {
            if input_index == 0 {
                spec.trans_a = !spec.trans_a;
            } else {
                spec.trans_b = !spec.trans_b;
            }
        }
    }
    graph.set_operator_input(matmul, input_index, base);
    // The same tensor can feed both matmul operands; only retire the
    // transpose once nothing reads its output anymore.
    let dangling = graph
        .tensor(operand)
        .map_or(false, |t| t.targets().is_empty());
    if dangling {
        graph.remove_operator(transpose);
        graph.remove_tensor(operand);
    }
    graph.rederive_op_edges();
    true
}

fn is_identity_perm(perm: &[usize]) -> bool {
    perm.iter().copied().eq(0..perm.len())
}

/// Composes two permutations: apply `first`, then `second`.
fn compose_perms(first: &[usize], second: &[usize]) -> Option<Vec<usize>> {
    if first.len() != second.len() {
        return None;
    }
    let mut result = Vec::with_capacity(first.len());
    for &axis in second {
        if axis >= first.len() {
            return None;
        }
        result.push(first[axis]);
    }
    Some(result)
}

/// True when `perm` swaps the last two axes and fixes every other axis.
fn swaps_last_two_only(perm: &[usize]) -> bool {
    let rank = perm.len();
    if rank < 2 {
        return false;
    }
    perm[..rank - 2].iter().copied().eq(0..rank - 2)
        && perm[rank - 2] == rank - 1
        && perm[rank - 1] == rank - 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_perm_detection() {
        assert!(is_identity_perm(&[]));
        assert!(is_identity_perm(&[0, 1, 2]));
        assert!(!is_identity_perm(&[0, 2, 1]));
    }

    #[test]
    fn perm_composition() {
        assert_eq!(
            compose_perms(&[0, 1, 3, 2], &[0, 1, 3, 2]),
            Some(vec![0, 1, 2, 3])
        );
        assert_eq!(compose_perms(&[1, 0], &[0, 1, 2]), None);
        assert_eq!(compose_perms(&[2, 0, 1], &[1, 2, 0]), Some(vec![0, 1, 2]));
    }

    #[test]
    fn last_two_swap_detection() {
        assert!(swaps_last_two_only(&[1, 0]));
        assert!(swaps_last_two_only(&[0, 1, 3, 2]));
        assert!(!swaps_last_two_only(&[0, 2, 1, 3]));
        assert!(!swaps_last_two_only(&[1, 0, 3, 2]));
        assert!(!swaps_last_two_only(&[0]));
    }
}
