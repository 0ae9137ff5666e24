use tgc::{DType, Graph, MatMulSpec, Operation, TransposeSpec};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn add_operator_wires_producer_and_consumer_edges() {
    let mut g = Graph::new();
    let a = g.add_tensor([2, 3], DType::F32);
    let b = g.add_tensor([3, 4], DType::F32);
    let c = g.add_tensor([2, 4], DType::F32);
    let mm = g
        .add_operator(Operation::MatMul(MatMulSpec::default()), vec![a, b], vec![c])
        .unwrap();
    let d = g.add_tensor([2, 4], DType::F32);
    let relu = g
        .add_operator(Operation::Relu, vec![c], vec![d])
        .unwrap();

    assert_eq!(g.tensor(c).unwrap().source(), Some(mm));
    assert_eq!(g.tensor(a).unwrap().targets(), &[mm]);
    assert_eq!(g.tensor(c).unwrap().targets(), &[relu]);
    let mm_node = g.operator(mm).unwrap();
    assert_eq!(mm_node.successors(), &[relu]);
    let relu_node = g.operator(relu).unwrap();
    assert_eq!(relu_node.predecessors(), &[mm]);
    g.check_valid().unwrap();
}

#[test]
fn add_operator_rejects_malformed_wiring() {
    let mut g = Graph::new();
    let a = g.add_tensor([2, 2], DType::F32);
    let b = g.add_tensor([2, 2], DType::F32);

    // wrong arity
    assert!(g
        .add_operator(Operation::MatMul(MatMulSpec::default()), vec![a], vec![b])
        .is_err());

    // tensor from another graph
    let mut other = Graph::new();
    let foreign = other.add_tensor([2, 2], DType::F32);
    assert!(g
        .add_operator(Operation::Relu, vec![foreign], vec![b])
        .is_err());

    // second producer for the same tensor
    g.add_operator(Operation::Relu, vec![a], vec![b]).unwrap();
    assert!(g
        .add_operator(Operation::Relu, vec![a], vec![b])
        .is_err());
}

#[test]
fn topo_sort_orders_consumers_after_producers() {
    let mut g = Graph::new();
    let a = g.add_tensor([4, 4], DType::F32);
    let b = g.add_tensor([4, 4], DType::F32);
    let c = g.add_tensor([4, 4], DType::F32);
    // inserted consumer-first
    let late = g.add_operator(Operation::Relu, vec![b], vec![c]).unwrap();
    let early = g.add_operator(Operation::Relu, vec![a], vec![b]).unwrap();

    assert!(g.topo_sort());
    let order: Vec<_> = g.operators().map(|op| op.id()).collect();
    assert_eq!(order, vec![early, late]);
    // cached: sorting again keeps the order
    assert!(g.topo_sort());
    g.check_valid().unwrap();
}

#[test]
fn topo_sort_reports_cycles_without_reordering() {
    init_logging();
    let mut g = Graph::new();
    let a = g.add_tensor([4, 4], DType::F32);
    let b = g.add_tensor([4, 4], DType::F32);
    let forward = g.add_operator(Operation::Relu, vec![a], vec![b]).unwrap();
    let backward = g.add_operator(Operation::Relu, vec![b], vec![a]).unwrap();

    assert!(!g.topo_sort());
    let order: Vec<_> = g.operators().map(|op| op.id()).collect();
    assert_eq!(order, vec![forward, backward], "failed sort must not reorder");

    assert!(g.shape_infer().is_err());
    assert!(g.data_malloc().is_err());
}

#[test]
fn data_malloc_binds_every_tensor_into_one_arena() {
    init_logging();
    let mut g = Graph::new();
    let i = g.add_tensor([2, 3, 4, 5], DType::U32);
    let t = g.add_tensor([2, 3, 5, 4], DType::U32);
    g.add_operator(
        Operation::Transpose(TransposeSpec {
            perm: vec![0, 1, 3, 2],
        }),
        vec![i],
        vec![t],
    )
    .unwrap();

    g.shape_infer().unwrap();
    g.data_malloc().unwrap();

    let slice_i = g.tensor(i).unwrap().data().expect("input must be bound");
    let slice_t = g.tensor(t).unwrap().data().expect("output must be bound");
    assert_eq!(slice_i.offset(), 0);
    assert_eq!(slice_i.len(), 480);
    assert_eq!(slice_t.offset(), 480);
    assert_eq!(slice_t.len(), 480);
    assert_eq!(
        slice_i.buffer().base_ptr(),
        slice_t.buffer().base_ptr(),
        "all tensors share one arena"
    );
    assert_eq!(
        slice_t.as_ptr() as usize - slice_i.as_ptr() as usize,
        480
    );
    assert_eq!(g.allocator().info().peak, 960);
    assert!(g.allocator().is_committed());
}

#[test]
fn data_malloc_places_tensors_at_aligned_offsets() {
    let mut g = Graph::new();
    // 5 * 4 = 20 bytes, aligned up to 24
    let a = g.add_tensor([5], DType::F32);
    let b = g.add_tensor([5], DType::F32);
    g.add_operator(Operation::Relu, vec![a], vec![b]).unwrap();

    g.data_malloc().unwrap();
    assert_eq!(g.tensor(a).unwrap().data().unwrap().offset(), 0);
    assert_eq!(g.tensor(b).unwrap().data().unwrap().offset(), 24);
    assert_eq!(g.allocator().info().peak, 48);
}

#[test]
fn tensors_can_be_found_by_fuid() {
    let mut g = Graph::new();
    let a = g.add_tensor([2, 2], DType::F32);
    let b = g.add_tensor([2, 2], DType::F32);
    g.add_operator(Operation::Relu, vec![a], vec![b]).unwrap();

    let fuid = g.tensor(a).unwrap().fuid();
    assert_eq!(g.tensor_by_fuid(fuid).unwrap().id(), a);
    assert_ne!(g.tensor(b).unwrap().fuid(), fuid);
}

#[test]
fn display_dump_lists_tensors_and_operators() {
    let mut g = Graph::new();
    let a = g.add_tensor([2, 3], DType::F32);
    let b = g.add_tensor([3, 2], DType::F32);
    g.add_operator(
        Operation::Transpose(TransposeSpec { perm: vec![1, 0] }),
        vec![a],
        vec![b],
    )
    .unwrap();

    let dump = g.to_string();
    assert!(dump.contains("Graph tensors:"));
    assert!(dump.contains("Graph operators:"));
    assert!(dump.contains("Transpose(perm=[1, 0])"));
    assert!(dump.contains("pred []"));
}
