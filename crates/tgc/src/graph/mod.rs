//! Operator-graph ownership, edge maintenance, ordering, and memory planning.
//!
//! ## Architecture
//!
//! ```text
//! Graph (sole owner of tensor/operator nodes)
//!   |
//!   +-- edge maintenance (producer/consumer, derived pred/succ)
//!   +-- topo_sort (cached execution order)
//!   +-- optimize (fusion rewrites, graph/optimize.rs)
//!   +-- shape_infer (per-operator dispatch, ops module)
//!   +-- data_malloc (drives the Allocator, binds ArenaSlices)
//! ```
//!
//! Nodes live in id-keyed maps plus insertion-order vectors; every edge is a
//! plain id resolved through the graph. Predecessor/successor sets are derived
//! data, kept consistent with the tensor producer/consumer edges they come
//! from.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};

use crate::memory::{Allocator, ArenaSlice, MemoryProvider, SystemMemoryProvider};
use crate::ops::Operation;
use crate::tensor::{DType, Shape};

mod ids;
mod optimize;

pub use ids::{Fuid, OpId, TensorId};

/// A typed, shaped data node owned by a [`Graph`].
pub struct TensorNode<P: MemoryProvider> {
    id: TensorId,
    fuid: Fuid,
    shape: Shape,
    dtype: DType,
    source: Option<OpId>,
    targets: Vec<OpId>,
    data: Option<ArenaSlice<P::Handle>>,
}

impl<P: MemoryProvider> TensorNode<P> {
    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn fuid(&self) -> Fuid {
        self.fuid
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The producing operator, if any.
    pub fn source(&self) -> Option<OpId> {
        self.source
    }

    /// Consuming operators, in first-use order.
    pub fn targets(&self) -> &[OpId] {
        &self.targets
    }

    /// Arena binding assigned by [`Graph::data_malloc`].
    pub fn data(&self) -> Option<&ArenaSlice<P::Handle>> {
        self.data.as_ref()
    }

    /// Byte footprint of this tensor's storage.
    pub fn num_bytes(&self) -> usize {
        self.shape.num_bytes(self.dtype)
    }

    fn add_target(&mut self, op: OpId) {
        if !self.targets.contains(&op) {
            self.targets.push(op);
        }
    }

    fn remove_target(&mut self, op: OpId) {
        self.targets.retain(|&t| t != op);
    }
}

/// An operator node owned by a [`Graph`].
pub struct OpNode {
    id: OpId,
    op: Operation,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    predecessors: Vec<OpId>,
    successors: Vec<OpId>,
}

impl OpNode {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn operation(&self) -> &Operation {
        &self.op
    }

    pub(crate) fn operation_mut(&mut self) -> &mut Operation {
        &mut self.op
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn predecessors(&self) -> &[OpId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[OpId] {
        &self.successors
    }

    fn add_predecessor(&mut self, op: OpId) {
        if !self.predecessors.contains(&op) {
            self.predecessors.push(op);
        }
    }

    fn add_successor(&mut self, op: OpId) {
        if !self.successors.contains(&op) {
            self.successors.push(op);
        }
    }
}

/// Owner of the full tensor/operator sets and driver of the compilation
/// pipeline: wiring, ordering, optimization, shape inference, and planning.
pub struct Graph<P: MemoryProvider = SystemMemoryProvider> {
    tensors: HashMap<TensorId, TensorNode<P>>,
    tensor_order: Vec<TensorId>,
    ops: HashMap<OpId, OpNode>,
    op_order: Vec<OpId>,
    sorted: bool,
    allocator: Allocator<P>,
}

impl Graph<SystemMemoryProvider> {
    /// A graph planning into host memory.
    pub fn new() -> Self {
        Graph::with_provider(Arc::new(SystemMemoryProvider))
    }
}

impl Default for Graph<SystemMemoryProvider> {
    fn default() -> Self {
        Graph::new()
    }
}

impl<P: MemoryProvider> Graph<P> {
    pub fn with_provider(provider: Arc<P>) -> Self {
        Graph {
            tensors: HashMap::new(),
            tensor_order: Vec::new(),
            ops: HashMap::new(),
            op_order: Vec::new(),
            sorted: false,
            allocator: Allocator::new(provider),
        }
    }

    /// Creates an unbound tensor node and returns its id.
    pub fn add_tensor(&mut self, shape: impl Into<Shape>, dtype: DType) -> TensorId {
        let id = TensorId::fresh();
        let node = TensorNode {
            id,
            fuid: Fuid::fresh(),
            shape: shape.into(),
            dtype,
            source: None,
            targets: Vec::new(),
            data: None,
        };
        self.tensors.insert(id, node);
        self.tensor_order.push(id);
        id
    }

    /// Appends an operator and wires all producer/consumer and
    /// predecessor/successor edges. Must be called exactly once per operator,
    /// after its tensors exist in the graph.
    pub fn add_operator(
        &mut self,
        op: Operation,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Result<OpId> {
        op.validate_input_arity(inputs.len())
            .with_context(|| format!("cannot add {} operator", op.kind()))?;
        ensure!(
            outputs.len() == op.output_count(),
            "{} operator produces {} output(s), got {}",
            op.kind(),
            op.output_count(),
            outputs.len()
        );
        for id in inputs.iter().chain(outputs.iter()) {
            ensure!(
                self.tensors.contains_key(id),
                "tensor {id} is not part of this graph"
            );
        }
        for id in &outputs {
            ensure!(
                self.tensors[id].source.is_none(),
                "tensor {id} already has a producer"
            );
        }

        self.sorted = false;
        let id = OpId::fresh();
        let mut links: Vec<(OpId, OpId)> = Vec::new();
        for tid in &inputs {
            let tensor = self.tensors.get_mut(tid).expect("validated above");
            tensor.add_target(id);
            if let Some(pred) = tensor.source {
                links.push((pred, id));
            }
        }
        for tid in &outputs {
            let tensor = self.tensors.get_mut(tid).expect("validated above");
            tensor.source = Some(id);
            for &succ in &tensor.targets {
                links.push((id, succ));
            }
        }

        self.ops.insert(
            id,
            OpNode {
                id,
                op,
                inputs,
                outputs,
                predecessors: Vec::new(),
                successors: Vec::new(),
            },
        );
        self.op_order.push(id);
        for (pred, succ) in links {
            self.link_ops(pred, succ);
        }
        Ok(id)
    }

    /// Reorders the operator sequence into a valid execution order.
    ///
    /// Returns `false` without mutating the current order when no such order
    /// exists (a cycle or a dangling dependency). The result is cached until
    /// the next graph edit; calling again while sorted is a no-op.
    pub fn topo_sort(&mut self) -> bool {
        if self.sorted {
            return true;
        }
        let mut order = Vec::with_capacity(self.op_order.len());
        let mut placed: HashSet<OpId> = HashSet::with_capacity(self.op_order.len());
        while order.len() < self.op_order.len() {
            let mut modified = false;
            for &id in &self.op_order {
                if placed.contains(&id) {
                    continue;
                }
                let ready = self.ops[&id].inputs.iter().all(|tid| {
                    self.tensors
                        .get(tid)
                        .map_or(false, |t| t.source.map_or(true, |src| placed.contains(&src)))
                });
                if ready {
                    order.push(id);
                    placed.insert(id);
                    modified = true;
                }
            }
            if !modified {
                return false;
            }
        }
        self.op_order = order;
        self.sorted = true;
        true
    }

    /// Rewrites the graph to fixpoint with the built-in fusion rules.
    pub fn optimize(&mut self) {
        optimize::run(self);
    }

    /// Runs per-operator shape inference in topological order, updating
    /// output shapes in place. Tensor identity (fuid) is preserved.
    pub fn shape_infer(&mut self) -> Result<()> {
        ensure!(
            self.topo_sort(),
            "cannot run shape inference on a cyclic graph"
        );
        for id in self.op_order.clone() {
            let node = &self.ops[&id];
            let input_shapes: Vec<Shape> = node
                .inputs
                .iter()
                .map(|tid| self.tensors[tid].shape.clone())
                .collect();
            let inferred = node
                .op
                .infer_shapes(&input_shapes)
                .with_context(|| format!("shape inference failed for operator {id}"))?;
            ensure!(
                inferred.len() == node.outputs.len(),
                "operator {} returned {} shape(s) for {} output(s)",
                id,
                inferred.len(),
                node.outputs.len()
            );
            let outputs = node.outputs.clone();
            for (tid, shape) in outputs.into_iter().zip(inferred) {
                let tensor = self
                    .tensors
                    .get_mut(&tid)
                    .ok_or_else(|| anyhow!("output tensor {tid} is not part of this graph"))?;
                if tensor.shape != shape {
                    tensor.shape = shape;
                }
            }
        }
        Ok(())
    }

    /// Plans arena offsets for every tensor, commits the arena, and binds each
    /// tensor to its position inside the backing buffer.
    ///
    /// Phase 1 requests an offset for every tensor in the graph, then for any
    /// operator output not yet planned, recording results by fuid; phase 2
    /// materializes the backing buffer and binds the tensors. No pointer is
    /// handed out before every tensor has an offset, matching the allocator's
    /// two-phase contract.
    pub fn data_malloc(&mut self) -> Result<()> {
        ensure!(self.topo_sort(), "cannot plan memory for a cyclic graph");

        let mut offsets: HashMap<Fuid, usize> = HashMap::with_capacity(self.tensor_order.len());
        for tid in &self.tensor_order {
            let (fuid, bytes) = {
                let tensor = &self.tensors[tid];
                (tensor.fuid, tensor.num_bytes())
            };
            ensure!(
                !offsets.contains_key(&fuid),
                "tensor fuid {fuid} planned twice"
            );
            let offset = self
                .allocator
                .alloc(bytes)
                .with_context(|| format!("planning tensor {tid}"))?;
            offsets.insert(fuid, offset);
        }
        for id in self.op_order.clone() {
            for tid in self.ops[&id].outputs.clone() {
                let (fuid, bytes) = {
                    let tensor = &self.tensors[&tid];
                    (tensor.fuid, tensor.num_bytes())
                };
                if offsets.contains_key(&fuid) {
                    continue;
                }
                let offset = self
                    .allocator
                    .alloc(bytes)
                    .with_context(|| format!("planning output tensor {tid} of operator {id}"))?;
                offsets.insert(fuid, offset);
            }
        }

        let handle = self
            .allocator
            .materialize()
            .context("committing the arena")?;
        for tid in &self.tensor_order {
            let tensor = self.tensors.get_mut(tid).expect("order tracks the map");
            if let Some(&offset) = offsets.get(&tensor.fuid) {
                let len = tensor.num_bytes();
                tensor.data = Some(ArenaSlice::new(handle.clone(), offset, len));
            }
        }
        log::debug!("memory plan committed: {}", self.allocator.info());
        Ok(())
    }

    /// Full invariant sweep over the tensor and operator sets.
    ///
    /// Checks liveness (every tensor has a producer or a consumer), edge
    /// membership, bidirectional consistency between producer/consumer links
    /// and operator input/output lists, derived predecessor/successor sets,
    /// and fuid uniqueness.
    pub fn check_valid(&self) -> Result<()> {
        ensure!(
            self.tensor_order.len() == self.tensors.len()
                && self.op_order.len() == self.ops.len(),
            "node order out of sync with node storage"
        );
        for (&tid, tensor) in &self.tensors {
            ensure!(
                tensor.source.is_some() || !tensor.targets.is_empty(),
                "tensor {tid} has neither a producer nor a consumer"
            );
            if let Some(src) = tensor.source {
                let op = self
                    .ops
                    .get(&src)
                    .ok_or_else(|| anyhow!("tensor {tid} names missing producer {src}"))?;
                ensure!(
                    op.outputs.contains(&tid),
                    "producer {src} does not list tensor {tid} as an output"
                );
            }
            for &target in &tensor.targets {
                let op = self
                    .ops
                    .get(&target)
                    .ok_or_else(|| anyhow!("tensor {tid} names missing consumer {target}"))?;
                ensure!(
                    op.inputs.contains(&tid),
                    "consumer {target} does not list tensor {tid} as an input"
                );
            }
        }
        for (&oid, node) in &self.ops {
            for &tid in &node.inputs {
                let tensor = self
                    .tensors
                    .get(&tid)
                    .ok_or_else(|| anyhow!("operator {oid} reads missing tensor {tid}"))?;
                ensure!(
                    tensor.targets.contains(&oid),
                    "tensor {tid} does not list consumer {oid}"
                );
            }
            for &tid in &node.outputs {
                let tensor = self
                    .tensors
                    .get(&tid)
                    .ok_or_else(|| anyhow!("operator {oid} writes missing tensor {tid}"))?;
                ensure!(
                    tensor.source == Some(oid),
                    "tensor {tid} does not name {oid} as its producer"
                );
            }
            ensure!(
                same_id_set(&node.predecessors, &self.derived_predecessors(node)),
                "operator {oid} has stale predecessor links"
            );
            ensure!(
                same_id_set(&node.successors, &self.derived_successors(node)),
                "operator {oid} has stale successor links"
            );
        }
        let mut fuids = HashSet::with_capacity(self.tensors.len());
        for tensor in self.tensors.values() {
            ensure!(
                fuids.insert(tensor.fuid),
                "two tensors share fuid {}",
                tensor.fuid
            );
        }
        Ok(())
    }

    /// Tensors in insertion order.
    pub fn tensors(&self) -> impl Iterator<Item = &TensorNode<P>> {
        self.tensor_order.iter().map(|id| &self.tensors[id])
    }

    /// Operators in current (possibly sorted) order.
    pub fn operators(&self) -> impl Iterator<Item = &OpNode> {
        self.op_order.iter().map(|id| &self.ops[id])
    }

    pub fn tensor(&self, id: TensorId) -> Option<&TensorNode<P>> {
        self.tensors.get(&id)
    }

    pub fn operator(&self, id: OpId) -> Option<&OpNode> {
        self.ops.get(&id)
    }

    /// Looks a tensor up by its functional id.
    pub fn tensor_by_fuid(&self, fuid: Fuid) -> Option<&TensorNode<P>> {
        self.tensors.values().find(|t| t.fuid == fuid)
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn operator_count(&self) -> usize {
        self.ops.len()
    }

    /// Read access to the memory planner, for diagnostics.
    pub fn allocator(&self) -> &Allocator<P> {
        &self.allocator
    }

    pub(crate) fn operator_mut(&mut self, id: OpId) -> Option<&mut OpNode> {
        self.ops.get_mut(&id)
    }

    /// Replaces every occurrence of `old` in `op`'s input list with `new`,
    /// updating consumer links on both tensors.
    pub(crate) fn replace_operator_input(&mut self, op: OpId, old: TensorId, new: TensorId) {
        let Some(node) = self.ops.get_mut(&op) else {
            return;
        };
        let mut replaced = false;
        for input in &mut node.inputs {
            if *input == old {
                *input = new;
                replaced = true;
            }
        }
        if !replaced {
            return;
        }
        if let Some(tensor) = self.tensors.get_mut(&old) {
            tensor.remove_target(op);
        }
        if let Some(tensor) = self.tensors.get_mut(&new) {
            tensor.add_target(op);
        }
    }

    /// Replaces `op`'s input at `index` with `new`, keeping consumer links on
    /// the displaced tensor if another slot still reads it.
    pub(crate) fn set_operator_input(&mut self, op: OpId, index: usize, new: TensorId) {
        let Some(node) = self.ops.get_mut(&op) else {
            return;
        };
        if index >= node.inputs.len() {
            return;
        }
        let old = node.inputs[index];
        node.inputs[index] = new;
        let still_reads_old = node.inputs.contains(&old);
        if !still_reads_old {
            if let Some(tensor) = self.tensors.get_mut(&old) {
                tensor.remove_target(op);
            }
        }
        if let Some(tensor) = self.tensors.get_mut(&new) {
            tensor.add_target(op);
        }
    }

    /// Removes an operator, scrubbing any producer/consumer links that still
    /// name it. Removals preserve an existing topological order.
    pub(crate) fn remove_operator(&mut self, id: OpId) {
        if self.ops.remove(&id).is_none() {
            return;
        }
        self.op_order.retain(|&o| o != id);
        for tensor in self.tensors.values_mut() {
            if tensor.source == Some(id) {
                tensor.source = None;
            }
            tensor.remove_target(id);
        }
        for node in self.ops.values_mut() {
            node.predecessors.retain(|&o| o != id);
            node.successors.retain(|&o| o != id);
        }
    }

    /// Removes a tensor. The caller must already have rewired every operator
    /// away from it.
    pub(crate) fn remove_tensor(&mut self, id: TensorId) {
        debug_assert!(
            self.ops
                .values()
                .all(|n| !n.inputs.contains(&id) && !n.outputs.contains(&id)),
            "removing tensor {id} that operators still reference"
        );
        self.tensors.remove(&id);
        self.tensor_order.retain(|&t| t != id);
    }

    /// Rebuilds every operator's predecessor/successor set from the tensor
    /// producer/consumer edges they are derived from.
    pub(crate) fn rederive_op_edges(&mut self) {
        for id in self.op_order.clone() {
            let node = &self.ops[&id];
            let preds = self.derived_predecessors(node);
            let succs = self.derived_successors(node);
            let node = self.ops.get_mut(&id).expect("order tracks the map");
            node.predecessors = preds;
            node.successors = succs;
        }
    }

    fn link_ops(&mut self, pred: OpId, succ: OpId) {
        if let Some(node) = self.ops.get_mut(&pred) {
            node.add_successor(succ);
        }
        if let Some(node) = self.ops.get_mut(&succ) {
            node.add_predecessor(pred);
        }
    }

    fn derived_predecessors(&self, node: &OpNode) -> Vec<OpId> {
        let mut preds = Vec::new();
        for tid in &node.inputs {
            if let Some(src) = self.tensors.get(tid).and_then(|t| t.source) {
                if !preds.contains(&src) {
                    preds.push(src);
                }
            }
        }
        preds
    }

    fn derived_successors(&self, node: &OpNode) -> Vec<OpId> {
        let mut succs = Vec::new();
        for tid in &node.outputs {
            if let Some(tensor) = self.tensors.get(tid) {
                for &target in &tensor.targets {
                    if !succs.contains(&target) {
                        succs.push(target);
                    }
                }
            }
        }
        succs
    }
}

fn same_id_set(lhs: &[OpId], rhs: &[OpId]) -> bool {
    let mut lhs = lhs.to_vec();
    let mut rhs = rhs.to_vec();
    lhs.sort_unstable();
    rhs.sort_unstable();
    lhs == rhs
}

impl<P: MemoryProvider> fmt::Display for Graph<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph tensors:")?;
        for tensor in self.tensors() {
            writeln!(
                f,
                "  Tensor {} (fuid {}): {:?} {}{}",
                tensor.id,
                tensor.fuid,
                tensor.dtype,
                tensor.shape,
                match &tensor.data {
                    Some(slice) => format!(" @ {}+{}", slice.offset(), slice.len()),
                    None => String::new(),
                }
            )?;
        }
        writeln!(f, "Graph operators:")?;
        for node in self.operators() {
            let preds: Vec<u64> = node.predecessors.iter().map(|o| o.raw()).collect();
            let succs: Vec<u64> = node.successors.iter().map(|o| o.raw()).collect();
            writeln!(
                f,
                "  OP {}, pred {:?}, succ {:?}, {}",
                node.id, preds, succs, node.op
            )?;
        }
        Ok(())
    }
}
