//! Graph construction and execution: a node arena accumulated by the
//! `Builder`, topologically sorted into an executable `Graph` that memoizes
//! forward activations and accumulates gradients at fanout joins.

pub mod node;

pub use node::{
    ArithOp, ElementwiseNode, GatherNode, IdentityNode, InputNode, MatMulNode, Node, ParamNode,
    ReduceSumNode, ReshapeNode, ShapeCell, TransposeNode,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::engine::Engine;
use crate::errors::{Error, Result};
use crate::numeric::Numeric;
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use crate::types::{BackwardMode, NodeId, RunContext, Shape};

/// Accumulates nodes and dependency edges before the topological sort.
pub struct Builder<E: Numeric> {
    engine: Arc<dyn Engine<E>>,
    nodes: Vec<Arc<dyn Node<E>>>,
    deps: Vec<Vec<NodeId>>,
    inputs: Vec<NodeId>,
}

impl<E: Numeric> Builder<E> {
    pub fn new(engine: Arc<dyn Engine<E>>) -> Self {
        Builder {
            engine,
            nodes: Vec::new(),
            deps: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn engine(&self) -> Arc<dyn Engine<E>> {
        self.engine.clone()
    }

    /// Appends an input placeholder with the declared shape.
    pub fn add_input(&mut self, shape: impl Into<Shape>) -> NodeId {
        let id = self.push(Arc::new(InputNode::new(shape)), Vec::new());
        self.inputs.push(id);
        id
    }

    /// Records a node and the identifiers of its dependencies.
    pub fn add_node(&mut self, node: Arc<dyn Node<E>>, inputs: &[NodeId]) -> NodeId {
        self.push(node, inputs.to_vec())
    }

    fn push(&mut self, node: Arc<dyn Node<E>>, inputs: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.deps.push(inputs);
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<dyn Node<E>>> {
        self.nodes.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topologically sorts the arena and returns an executable graph rooted
    /// at `output`. Fails `GraphCycle` when a dependency loop exists.
    pub fn build(self, output: NodeId) -> Result<Graph<E>> {
        if output.0 >= self.nodes.len() {
            return Err(Error::InvalidArgument(format!(
                "output node {:?} is not in the graph",
                output
            )));
        }
        // Iterative DFS, tie-broken by insertion order.
        const UNSEEN: u8 = 0;
        const OPEN: u8 = 1;
        const CLOSED: u8 = 2;
        let mut state = vec![UNSEEN; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        for start in 0..self.nodes.len() {
            if state[start] != UNSEEN {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            while let Some(top) = stack.last_mut() {
                let id = top.0;
                if state[id] == CLOSED {
                    stack.pop();
                    continue;
                }
                state[id] = OPEN;
                if top.1 < self.deps[id].len() {
                    let dep = self.deps[id][top.1].0;
                    top.1 += 1;
                    if dep >= self.nodes.len() {
                        return Err(Error::InvalidArgument(format!(
                            "node {} depends on unknown node {}",
                            id, dep
                        )));
                    }
                    match state[dep] {
                        OPEN => {
                            return Err(Error::GraphCycle(format!("node {}", dep)));
                        }
                        UNSEEN => stack.push((dep, 0)),
                        _ => {}
                    }
                } else {
                    state[id] = CLOSED;
                    order.push(NodeId(id));
                    stack.pop();
                }
            }
        }
        debug!(nodes = order.len(), "graph built");
        Ok(Graph {
            engine: self.engine,
            nodes: self.nodes,
            deps: self.deps,
            inputs: self.inputs,
            output,
            order,
            memo: Vec::new(),
            grads: Vec::new(),
        })
    }
}

/// An executable computation graph: nodes in topological order plus the
/// activation memo retained between one forward and its backward.
pub struct Graph<E: Numeric> {
    engine: Arc<dyn Engine<E>>,
    nodes: Vec<Arc<dyn Node<E>>>,
    deps: Vec<Vec<NodeId>>,
    inputs: Vec<NodeId>,
    output: NodeId,
    order: Vec<NodeId>,
    memo: Vec<Option<Tensor<E>>>,
    grads: Vec<Option<Tensor<E>>>,
}

impl<E: Numeric> Graph<E> {
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn node(&self, id: NodeId) -> &Arc<dyn Node<E>> {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Flat view over every parameter owned by the graph's nodes.
    pub fn parameters(&self) -> Vec<Arc<Parameter<E>>> {
        self.nodes.iter().flat_map(|n| n.parameters()).collect()
    }

    pub fn clear_gradients(&self) {
        for p in self.parameters() {
            p.clear_gradient();
        }
    }

    /// Activation recorded for `id` by the last forward.
    pub fn activation(&self, id: NodeId) -> Option<&Tensor<E>> {
        self.memo.get(id.0).and_then(|t| t.as_ref())
    }

    /// Gradient accumulated at `id` by the last backward.
    pub fn gradient(&self, id: NodeId) -> Option<&Tensor<E>> {
        self.grads.get(id.0).and_then(|t| t.as_ref())
    }

    /// Executes the graph over the supplied input activations (one per input
    /// node, in declaration order) and returns the output activation.
    pub fn forward(&mut self, ctx: &RunContext, inputs: &[Tensor<E>]) -> Result<Tensor<E>> {
        if inputs.len() != self.inputs.len() {
            return Err(Error::input_count("forward", self.inputs.len(), inputs.len()));
        }
        self.memo = vec![None; self.nodes.len()];
        self.grads = Vec::new();
        for (id, tensor) in self.inputs.iter().zip(inputs) {
            self.memo[id.0] = Some(tensor.clone());
        }
        for &id in &self.order {
            if self.memo[id.0].is_some() {
                continue;
            }
            let node = self.nodes[id.0].clone();
            let dep_ids = &self.deps[id.0];
            let mut activations = Vec::with_capacity(dep_ids.len());
            for dep in dep_ids {
                activations.push(self.memo[dep.0].as_ref().ok_or_else(|| {
                    Error::InvalidArgument(format!("missing activation for node {}", dep.0))
                })?);
            }
            let out = node.forward(ctx, &activations)?;
            node.shape_cell().record(out.shape().clone());
            self.memo[id.0] = Some(out);
        }
        self.memo[self.output.0]
            .clone()
            .ok_or_else(|| Error::InvalidArgument("output node was not computed".into()))
    }

    /// Reverse pass from the output node. Per-input gradients returned by a
    /// node's backward are installed into the gradient map, accumulating via
    /// engine `add` where a consumer already contributed (fanout joins).
    pub fn backward(
        &mut self,
        ctx: &RunContext,
        mode: BackwardMode,
        initial_grad: Tensor<E>,
    ) -> Result<()> {
        if self.memo.len() != self.nodes.len() {
            return Err(Error::InvalidArgument(
                "backward requires a preceding forward".into(),
            ));
        }
        self.grads = vec![None; self.nodes.len()];
        self.grads[self.output.0] = Some(initial_grad);
        for &id in self.order.iter().rev() {
            let grad = match &self.grads[id.0] {
                Some(g) => g.clone(),
                None => continue,
            };
            let node = self.nodes[id.0].clone();
            let dep_ids = self.deps[id.0].clone();
            let mut activations = Vec::with_capacity(dep_ids.len());
            for dep in &dep_ids {
                activations.push(self.memo[dep.0].as_ref().ok_or_else(|| {
                    Error::InvalidArgument(format!("missing activation for node {}", dep.0))
                })?);
            }
            let input_grads = node.backward(ctx, mode, &grad, &activations)?;
            if input_grads.len() != dep_ids.len() && !input_grads.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "node {} returned {} gradients for {} inputs",
                    id.0,
                    input_grads.len(),
                    dep_ids.len()
                )));
            }
            for (dep, g) in dep_ids.iter().zip(input_grads) {
                let slot = &mut self.grads[dep.0];
                match slot.take() {
                    None => *slot = Some(g),
                    Some(existing) => {
                        *slot = Some(self.engine.add(ctx, &existing, &g, None)?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Structural description of the graph for diagnostics.
    pub fn summary(&self) -> GraphSummary {
        let mut ops: BTreeMap<String, usize> = BTreeMap::new();
        for n in &self.nodes {
            *ops.entry(n.op_type().to_string()).or_default() += 1;
        }
        let parameters = self
            .parameters()
            .iter()
            .map(|p| ParameterSummary {
                name: p.name().to_string(),
                shape: p.value().dims().to_vec(),
            })
            .collect();
        GraphSummary {
            nodes: self.nodes.len(),
            inputs: self.inputs.len(),
            ops,
            parameters,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub nodes: usize,
    pub inputs: usize,
    pub ops: BTreeMap<String, usize>,
    pub parameters: Vec<ParameterSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSummary {
    pub name: String,
    pub shape: Vec<usize>,
}

impl GraphSummary {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".into())
    }
}
