//! Builder and graph-runner scenarios: wiring, topological execution, cycle
//! detection, fanout gradient accumulation.

use std::sync::Arc;

use gradix::graph::{ArithOp, ElementwiseNode, IdentityNode, MatMulNode, ReduceSumNode};
use gradix::{
    BackwardMode, Builder, CpuEngine, Engine, Error, NodeId, RunContext, Tensor,
};

fn engine() -> Arc<dyn Engine<f32>> {
    Arc::new(CpuEngine::new())
}

#[test]
fn build_and_run_identity() {
    let mut b = Builder::new(engine());
    let x = b.add_input([1, 4]);
    let out = b.add_node(Arc::new(IdentityNode::new()), &[x]);
    let mut g = b.build(out).unwrap();
    let result = g
        .forward(
            &RunContext::new(),
            &[Tensor::from_vec([1, 4], vec![1., 2., 3., 4.]).unwrap()],
        )
        .unwrap();
    assert_eq!(result.data(), &[1., 2., 3., 4.]);
}

#[test]
fn cycle_fails_at_build_time() {
    let mut b = Builder::new(engine());
    let n1 = b.add_node(Arc::new(IdentityNode::new()), &[NodeId(1)]);
    let n2 = b.add_node(Arc::new(IdentityNode::new()), &[n1]);
    let _ = n2;
    assert!(matches!(b.build(n1), Err(Error::GraphCycle(_))));
}

#[test]
fn nodes_execute_after_their_dependencies() {
    // (x + y) summed to a scalar; exercises a two-level graph.
    let mut b = Builder::new(engine());
    let x = b.add_input([2]);
    let y = b.add_input([2]);
    let sum = b.add_node(
        Arc::new(ElementwiseNode::new(b.engine(), ArithOp::Add)),
        &[x, y],
    );
    let total = b.add_node(
        Arc::new(ReduceSumNode::new(b.engine(), vec![], false)),
        &[sum],
    );
    let mut g = b.build(total).unwrap();
    let out = g
        .forward(
            &RunContext::new(),
            &[
                Tensor::from_vec([2], vec![1., 2.]).unwrap(),
                Tensor::from_vec([2], vec![10., 20.]).unwrap(),
            ],
        )
        .unwrap();
    assert_eq!(out.rank(), 0);
    assert_eq!(out.data(), &[33.0]);
}

#[test]
fn forward_input_count_is_validated() {
    let mut b = Builder::new(engine());
    let x = b.add_input([2]);
    let out = b.add_node(Arc::new(IdentityNode::new()), &[x]);
    let mut g = b.build(out).unwrap();
    assert!(matches!(
        g.forward(&RunContext::new(), &[]),
        Err(Error::InvalidInputCount { .. })
    ));
}

#[test]
fn fanout_join_accumulates_gradients() {
    // y = (x*x) + (x*x) built as two separate consumers of x.
    let mut b = Builder::new(engine());
    let x = b.add_input([2]);
    let sq1 = b.add_node(
        Arc::new(ElementwiseNode::new(b.engine(), ArithOp::Mul)),
        &[x, x],
    );
    let sq2 = b.add_node(
        Arc::new(ElementwiseNode::new(b.engine(), ArithOp::Mul)),
        &[x, x],
    );
    let sum = b.add_node(
        Arc::new(ElementwiseNode::new(b.engine(), ArithOp::Add)),
        &[sq1, sq2],
    );
    let mut g = b.build(sum).unwrap();
    let ctx = RunContext::new();
    g.forward(&ctx, &[Tensor::from_vec([2], vec![3., 4.]).unwrap()])
        .unwrap();
    g.backward(&ctx, BackwardMode::Full, Tensor::filled([2], 1.0))
        .unwrap();
    // d/dx of 2x^2 is 4x.
    assert_eq!(g.gradient(x).unwrap().data(), &[12.0, 16.0]);
}

#[test]
fn forward_is_bit_deterministic() {
    let mut b = Builder::new(engine());
    let x = b.add_input([2, 2]);
    let mm = b.add_node(Arc::new(MatMulNode::new(b.engine())), &[x, x]);
    let mut g = b.build(mm).unwrap();
    let input = Tensor::from_vec([2, 2], vec![0.1, 0.7, -0.3, 1.9]).unwrap();
    let first = g.forward(&RunContext::new(), &[input.clone()]).unwrap();
    for _ in 0..3 {
        let next = g.forward(&RunContext::new(), &[input.clone()]).unwrap();
        assert_eq!(next.data(), first.data());
    }
}

#[test]
fn activations_are_memoized_per_node() {
    let mut b = Builder::new(engine());
    let x = b.add_input([2]);
    let mid = b.add_node(
        Arc::new(ElementwiseNode::new(b.engine(), ArithOp::Add)),
        &[x, x],
    );
    let out = b.add_node(Arc::new(IdentityNode::new()), &[mid]);
    let mut g = b.build(out).unwrap();
    g.forward(&RunContext::new(), &[Tensor::from_vec([2], vec![1., 2.]).unwrap()])
        .unwrap();
    assert_eq!(g.activation(mid).unwrap().data(), &[2., 4.]);
    assert_eq!(g.activation(out).unwrap().data(), &[2., 4.]);
}

#[test]
fn backward_requires_forward() {
    let mut b = Builder::new(engine());
    let x = b.add_input([2]);
    let out = b.add_node(Arc::new(IdentityNode::new()), &[x]);
    let mut g = b.build(out).unwrap();
    assert!(g
        .backward(&RunContext::new(), BackwardMode::Full, Tensor::filled([2], 1.0))
        .is_err());
}

#[test]
fn cancellation_aborts_mid_walk() {
    let mut b = Builder::new(engine());
    let x = b.add_input([2]);
    let out = b.add_node(
        Arc::new(ElementwiseNode::new(b.engine(), ArithOp::Add)),
        &[x, x],
    );
    let mut g = b.build(out).unwrap();
    let ctx = RunContext::new();
    ctx.cancel();
    assert!(matches!(
        g.forward(&ctx, &[Tensor::from_vec([2], vec![1., 2.]).unwrap()]),
        Err(Error::Cancelled)
    ));
}
