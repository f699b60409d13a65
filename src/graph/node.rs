//! The operator abstraction and the primitive node catalogue. Composite,
//! parameter-carrying operators live in `crate::layers`.

use std::sync::{Arc, Mutex};

use crate::engine::Engine;
use crate::errors::{Error, Result};
use crate::numeric::Numeric;
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use crate::types::{AttrMap, Attribute, BackwardMode, RunContext, Shape};

/// Records a node's output shape after its first forward.
#[derive(Debug, Default)]
pub struct ShapeCell(Mutex<Option<Shape>>);

impl ShapeCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Shape> {
        self.0.lock().expect("shape cell lock poisoned").clone()
    }

    pub fn record(&self, shape: Shape) {
        *self.0.lock().expect("shape cell lock poisoned") = Some(shape);
    }
}

/// A polymorphic operator in the computation graph.
///
/// `forward` consumes the activations of the node's dependencies in
/// dependency order; `backward` receives the same activations plus the
/// upstream gradient and returns one gradient per input. Parameter
/// accumulators are written inside `backward`.
pub trait Node<E: Numeric>: Send + Sync {
    /// Registry key for this operator.
    fn op_type(&self) -> &str;

    /// Configuration captured at construction time; must be sufficient to
    /// rebuild the node through the operator registry.
    fn attributes(&self) -> AttrMap {
        AttrMap::new()
    }

    fn shape_cell(&self) -> &ShapeCell;

    /// Output shape, populated after the first forward.
    fn output_shape(&self) -> Option<Shape> {
        self.shape_cell().get()
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>>;

    fn backward(
        &self,
        ctx: &RunContext,
        mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>>;

    fn parameters(&self) -> Vec<Arc<Parameter<E>>> {
        Vec::new()
    }
}

pub(crate) fn expect_arity<E: Numeric>(
    op: &str,
    inputs: &[&Tensor<E>],
    expected: usize,
) -> Result<()> {
    if inputs.len() != expected {
        return Err(Error::input_count(op, expected, inputs.len()));
    }
    Ok(())
}

/// Sums `grad` down to `target` along broadcast axes: extra leading axes
/// first, then axes where the operand held a 1 against a wider output.
pub(crate) fn reduce_to_shape<E: Numeric>(
    engine: &dyn Engine<E>,
    ctx: &RunContext,
    grad: &Tensor<E>,
    target: &Shape,
) -> Result<Tensor<E>> {
    if grad.shape() == target {
        return Ok(grad.clone());
    }
    let gd = grad.dims();
    let td = target.as_slice();
    let lead = gd.len() - td.len();
    let mut axes: Vec<isize> = (0..lead).map(|i| i as isize).collect();
    for i in 0..td.len() {
        if td[i] == 1 && gd[lead + i] > 1 {
            axes.push((lead + i) as isize);
        }
    }
    if axes.is_empty() {
        return grad.reshape(target.clone());
    }
    let reduced = engine.reduce_sum(ctx, grad, &axes, true, None)?;
    reduced.into_shape(target.clone())
}

/// Broadcasts `grad` back up to `target` (the reverse of a reduction).
pub(crate) fn expand_to_shape<E: Numeric>(
    engine: &dyn Engine<E>,
    ctx: &RunContext,
    grad: &Tensor<E>,
    target: &Shape,
) -> Result<Tensor<E>> {
    let zeros = Tensor::<E>::zeros(target.clone());
    engine.add(ctx, &zeros, grad, None)
}

/// Permutation that swaps the last two axes of a rank-`n` tensor.
pub(crate) fn swap_last_axes(rank: usize) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..rank).collect();
    if rank >= 2 {
        perm.swap(rank - 2, rank - 1);
    }
    perm
}

// --- Placeholders ---

/// Input placeholder: holds only a declared shape. Activations are bound by
/// the graph runner, which seeds the memo directly.
pub struct InputNode {
    shape: Shape,
    cell: ShapeCell,
}

impl InputNode {
    pub fn new(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let cell = ShapeCell::new();
        cell.record(shape.clone());
        InputNode { shape, cell }
    }

    pub fn declared_shape(&self) -> &Shape {
        &self.shape
    }
}

impl<E: Numeric> Node<E> for InputNode {
    fn op_type(&self) -> &str {
        "Input"
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, _ctx: &RunContext, _inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        Err(Error::InvalidArgument(
            "input node activations are bound by the graph".into(),
        ))
    }

    fn backward(
        &self,
        _ctx: &RunContext,
        _mode: BackwardMode,
        _grad: &Tensor<E>,
        _inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        Ok(Vec::new())
    }
}

/// Exposes a parameter's value (optionally transposed) as a graph node and
/// feeds the upstream gradient into its accumulator.
pub struct ParamNode<E: Numeric> {
    param: Arc<Parameter<E>>,
    transposed: bool,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Numeric> ParamNode<E> {
    pub fn new(engine: Arc<dyn Engine<E>>, param: Arc<Parameter<E>>) -> Self {
        ParamNode { param, transposed: false, engine, cell: ShapeCell::new() }
    }

    /// Two-dimensional transposed view of the parameter.
    pub fn transposed(engine: Arc<dyn Engine<E>>, param: Arc<Parameter<E>>) -> Result<Self> {
        if param.value().rank() != 2 {
            return Err(Error::InvalidArgument(format!(
                "transposed parameter {:?} must be rank 2, got {:?}",
                param.name(),
                param.value().dims()
            )));
        }
        Ok(ParamNode { param, transposed: true, engine, cell: ShapeCell::new() })
    }
}

impl<E: Numeric> Node<E> for ParamNode<E> {
    fn op_type(&self) -> &str {
        "Parameter"
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Attribute::Str(self.param.name().to_string()));
        if self.transposed {
            attrs.insert("transposed".into(), Attribute::Int(1));
        }
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("Parameter", inputs, 0)?;
        if self.transposed {
            self.engine.transpose(ctx, self.param.value(), &[1, 0], None)
        } else {
            ctx.checkpoint()?;
            Ok(self.param.value().clone())
        }
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("Parameter", inputs, 0)?;
        if self.transposed {
            let g = self.engine.transpose(ctx, grad, &[1, 0], None)?;
            self.param.add_gradient(&g)?;
        } else {
            self.param.add_gradient(grad)?;
        }
        Ok(Vec::new())
    }

    fn parameters(&self) -> Vec<Arc<Parameter<E>>> {
        vec![self.param.clone()]
    }
}

/// Passes its single input through unchanged.
pub struct IdentityNode {
    cell: ShapeCell,
}

impl IdentityNode {
    pub fn new() -> Self {
        IdentityNode { cell: ShapeCell::new() }
    }
}

impl Default for IdentityNode {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Numeric> Node<E> for IdentityNode {
    fn op_type(&self) -> &str {
        "Identity"
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("Identity", inputs, 1)?;
        ctx.checkpoint()?;
        Ok(inputs[0].clone())
    }

    fn backward(
        &self,
        _ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("Identity", inputs, 1)?;
        Ok(vec![grad.clone()])
    }
}

// --- Element-wise arithmetic ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn op_type(self) -> &'static str {
        match self {
            ArithOp::Add => "Add",
            ArithOp::Sub => "Sub",
            ArithOp::Mul => "Mul",
            ArithOp::Div => "Div",
        }
    }
}

/// Broadcasting binary arithmetic. The backward pass distributes the
/// upstream gradient per operand, summing along broadcast axes.
pub struct ElementwiseNode<E: Numeric> {
    op: ArithOp,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Numeric> ElementwiseNode<E> {
    pub fn new(engine: Arc<dyn Engine<E>>, op: ArithOp) -> Self {
        ElementwiseNode { op, engine, cell: ShapeCell::new() }
    }
}

impl<E: Numeric> Node<E> for ElementwiseNode<E> {
    fn op_type(&self) -> &str {
        self.op.op_type()
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity(self.op.op_type(), inputs, 2)?;
        let (a, b) = (inputs[0], inputs[1]);
        match self.op {
            ArithOp::Add => self.engine.add(ctx, a, b, None),
            ArithOp::Sub => self.engine.sub(ctx, a, b, None),
            ArithOp::Mul => self.engine.mul(ctx, a, b, None),
            ArithOp::Div => self.engine.div(ctx, a, b, None),
        }
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity(self.op.op_type(), inputs, 2)?;
        let (a, b) = (inputs[0], inputs[1]);
        let e = self.engine.as_ref();
        let neg_one = E::from_f64(-1.0);
        let (ga, gb) = match self.op {
            ArithOp::Add => (grad.clone(), grad.clone()),
            ArithOp::Sub => (grad.clone(), e.mul_scalar(ctx, grad, neg_one, None)?),
            ArithOp::Mul => (e.mul(ctx, grad, b, None)?, e.mul(ctx, grad, a, None)?),
            ArithOp::Div => {
                let ga = e.div(ctx, grad, b, None)?;
                let b2 = e.mul(ctx, b, b, None)?;
                let num = e.mul(ctx, grad, a, None)?;
                let gb = e.mul_scalar(ctx, &e.div(ctx, &num, &b2, None)?, neg_one, None)?;
                (ga, gb)
            }
        };
        Ok(vec![
            reduce_to_shape(e, ctx, &ga, a.shape())?,
            reduce_to_shape(e, ctx, &gb, b.shape())?,
        ])
    }
}

// --- MatMul ---

/// `C = A·B` with broadcast leading dimensions.
/// `dA = dC·Bᵀ`, `dB = Aᵀ·dC`, each summed back to its operand's shape.
pub struct MatMulNode<E: Numeric> {
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Numeric> MatMulNode<E> {
    pub fn new(engine: Arc<dyn Engine<E>>) -> Self {
        MatMulNode { engine, cell: ShapeCell::new() }
    }
}

impl<E: Numeric> Node<E> for MatMulNode<E> {
    fn op_type(&self) -> &str {
        "MatMul"
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("MatMul", inputs, 2)?;
        self.engine.matmul(ctx, inputs[0], inputs[1], None)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("MatMul", inputs, 2)?;
        let (a, b) = (inputs[0], inputs[1]);
        let e = self.engine.as_ref();
        let bt = e.transpose(ctx, b, &swap_last_axes(b.rank()), None)?;
        let at = e.transpose(ctx, a, &swap_last_axes(a.rank()), None)?;
        let da = e.matmul(ctx, grad, &bt, None)?;
        let db = e.matmul(ctx, &at, grad, None)?;
        Ok(vec![
            reduce_to_shape(e, ctx, &da, a.shape())?,
            reduce_to_shape(e, ctx, &db, b.shape())?,
        ])
    }
}

// --- Shape manipulation ---

/// Same-size reshape. A single `-1` in the target infers that dimension.
pub struct ReshapeNode<E: Numeric> {
    target: Vec<i64>,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Numeric> ReshapeNode<E> {
    pub fn new(engine: Arc<dyn Engine<E>>, target: Vec<i64>) -> Self {
        ReshapeNode { target, engine, cell: ShapeCell::new() }
    }

    fn resolve(&self, size: usize) -> Result<Vec<usize>> {
        let mut infer = None;
        let mut known = 1usize;
        for (i, &d) in self.target.iter().enumerate() {
            if d == -1 {
                if infer.is_some() {
                    return Err(Error::InvalidArgument(
                        "reshape target has more than one inferred dimension".into(),
                    ));
                }
                infer = Some(i);
            } else if d < 0 {
                return Err(Error::InvalidArgument(format!(
                    "reshape target dimension {} is negative",
                    d
                )));
            } else {
                known *= d as usize;
            }
        }
        let mut dims: Vec<usize> = self.target.iter().map(|&d| d.max(0) as usize).collect();
        if let Some(i) = infer {
            if known == 0 || size % known != 0 {
                return Err(Error::InvalidArgument(format!(
                    "cannot infer reshape dimension for size {} over {:?}",
                    size, self.target
                )));
            }
            dims[i] = size / known;
        }
        Ok(dims)
    }
}

impl<E: Numeric> Node<E> for ReshapeNode<E> {
    fn op_type(&self) -> &str {
        "Reshape"
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("shape".into(), Attribute::Ints(self.target.clone()));
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("Reshape", inputs, 1)?;
        let dims = self.resolve(inputs[0].size())?;
        self.engine.reshape(ctx, inputs[0], &dims, None)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("Reshape", inputs, 1)?;
        Ok(vec![self.engine.reshape(ctx, grad, inputs[0].dims(), None)?])
    }
}

/// Axis permutation; backward applies the inverse permutation.
pub struct TransposeNode<E: Numeric> {
    perm: Vec<usize>,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Numeric> TransposeNode<E> {
    pub fn new(engine: Arc<dyn Engine<E>>, perm: Vec<usize>) -> Self {
        TransposeNode { perm, engine, cell: ShapeCell::new() }
    }

    fn inverse(&self) -> Vec<usize> {
        let mut inv = vec![0usize; self.perm.len()];
        for (i, &p) in self.perm.iter().enumerate() {
            inv[p] = i;
        }
        inv
    }
}

impl<E: Numeric> Node<E> for TransposeNode<E> {
    fn op_type(&self) -> &str {
        "Transpose"
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert(
            "perm".into(),
            Attribute::Ints(self.perm.iter().map(|&p| p as i64).collect()),
        );
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("Transpose", inputs, 1)?;
        self.engine.transpose(ctx, inputs[0], &self.perm, None)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("Transpose", inputs, 1)?;
        Ok(vec![self.engine.transpose(ctx, grad, &self.inverse(), None)?])
    }
}

// --- Gather ---

/// Index-directed row copy along the first axis of `params`. Backward is a
/// scatter-add into a zero tensor of the `params` shape.
pub struct GatherNode<E: Numeric> {
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Numeric> GatherNode<E> {
    pub fn new(engine: Arc<dyn Engine<E>>) -> Self {
        GatherNode { engine, cell: ShapeCell::new() }
    }
}

impl<E: Numeric> Node<E> for GatherNode<E> {
    fn op_type(&self) -> &str {
        "Gather"
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("Gather", inputs, 2)?;
        self.engine.gather(ctx, inputs[0], inputs[1], None)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("Gather", inputs, 2)?;
        let (params, indices) = (inputs[0], inputs[1]);
        let zeros = Tensor::<E>::zeros(params.shape().clone());
        let dparams = self.engine.scatter_add(ctx, &zeros, indices, grad, None)?;
        Ok(vec![dparams, Tensor::zeros(indices.shape().clone())])
    }
}

// --- Reduction ---

/// Sum over one or more axes with configurable keep-dims. Backward
/// broadcasts the upstream gradient back over the reduced axes.
pub struct ReduceSumNode<E: Numeric> {
    axes: Vec<isize>,
    keep_dims: bool,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Numeric> ReduceSumNode<E> {
    pub fn new(engine: Arc<dyn Engine<E>>, axes: Vec<isize>, keep_dims: bool) -> Self {
        ReduceSumNode { axes, keep_dims, engine, cell: ShapeCell::new() }
    }
}

impl<E: Numeric> Node<E> for ReduceSumNode<E> {
    fn op_type(&self) -> &str {
        "ReduceSum"
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert(
            "axes".into(),
            Attribute::Ints(self.axes.iter().map(|&a| a as i64).collect()),
        );
        attrs.insert("keep_dims".into(), Attribute::Int(self.keep_dims as i64));
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("ReduceSum", inputs, 1)?;
        self.engine
            .reduce_sum(ctx, inputs[0], &self.axes, self.keep_dims, None)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("ReduceSum", inputs, 1)?;
        let input = inputs[0];
        let mut resolved: Vec<usize> = if self.axes.is_empty() {
            (0..input.rank()).collect()
        } else {
            self.axes
                .iter()
                .map(|&a| input.shape().resolve_axis(a))
                .collect::<Result<_>>()?
        };
        resolved.sort_unstable();
        resolved.dedup();
        let mut full = input.dims().to_vec();
        for &a in &resolved {
            full[a] = 1;
        }
        let squeezed = self.engine.reshape(ctx, grad, &full, None)?;
        Ok(vec![expand_to_shape(
            self.engine.as_ref(),
            ctx,
            &squeezed,
            input.shape(),
        )?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;

    fn engine() -> Arc<dyn Engine<f32>> {
        Arc::new(CpuEngine::new())
    }

    #[test]
    fn arity_is_enforced() {
        let node = MatMulNode::new(engine());
        let t = Tensor::<f32>::zeros([2, 2]);
        let err = node.forward(&RunContext::new(), &[&t]).unwrap_err();
        assert!(matches!(err, Error::InvalidInputCount { .. }));
    }

    #[test]
    fn add_backward_reduces_broadcast_axes() {
        let node = ElementwiseNode::new(engine(), ArithOp::Add);
        let ctx = RunContext::new();
        let a = Tensor::<f32>::zeros([2, 3]);
        let b = Tensor::<f32>::zeros([3]);
        let grad = Tensor::<f32>::filled([2, 3], 1.0);
        let grads = node
            .backward(&ctx, BackwardMode::Full, &grad, &[&a, &b])
            .unwrap();
        assert_eq!(grads[0].dims(), &[2, 3]);
        assert_eq!(grads[1].dims(), &[3]);
        assert_eq!(grads[1].data(), &[2.0, 2.0, 2.0]);
    }

    #[test]
    fn matmul_backward_shapes() {
        let node = MatMulNode::new(engine());
        let ctx = RunContext::new();
        let a = Tensor::<f32>::from_vec([1, 2], vec![1., 2.]).unwrap();
        let b = Tensor::<f32>::from_vec([2, 2], vec![0.5, 0.1, 0.2, 0.4]).unwrap();
        let fwd = node.forward(&ctx, &[&a, &b]).unwrap();
        assert_eq!(fwd.dims(), &[1, 2]);
        let grad = Tensor::<f32>::filled([1, 2], 1.0);
        let grads = node
            .backward(&ctx, BackwardMode::Full, &grad, &[&a, &b])
            .unwrap();
        // dB = A^T · dC = [[1],[2]]·[[1,1]] = [[1,1],[2,2]]
        assert_eq!(grads[1].data(), &[1., 1., 2., 2.]);
    }

    #[test]
    fn transpose_backward_inverts_permutation() {
        let node = TransposeNode::new(engine(), vec![1, 0]);
        let ctx = RunContext::new();
        let x = Tensor::<f32>::from_vec([2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap();
        let y = node.forward(&ctx, &[&x]).unwrap();
        let back = node.backward(&ctx, BackwardMode::Full, &y, &[&x]).unwrap();
        assert_eq!(back[0].data(), x.data());
    }

    #[test]
    fn gather_backward_scatters() {
        let node = GatherNode::new(engine());
        let ctx = RunContext::new();
        let params = Tensor::<f32>::from_vec([3, 2], vec![1., 2., 3., 4., 5., 6.]).unwrap();
        let idx = Tensor::<f32>::from_vec([2], vec![2., 2.]).unwrap();
        let grad = Tensor::<f32>::filled([2, 2], 1.0);
        let grads = node
            .backward(&ctx, BackwardMode::Full, &grad, &[&params, &idx])
            .unwrap();
        assert_eq!(grads[0].data(), &[0., 0., 0., 0., 2., 2.]);
    }

    #[test]
    fn reduce_sum_backward_broadcasts() {
        let node = ReduceSumNode::new(engine(), vec![1], false);
        let ctx = RunContext::new();
        let x = Tensor::<f32>::from_vec([2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap();
        let y = node.forward(&ctx, &[&x]).unwrap();
        assert_eq!(y.data(), &[6., 15.]);
        let grad = Tensor::<f32>::from_vec([2], vec![1., 2.]).unwrap();
        let back = node.backward(&ctx, BackwardMode::Full, &grad, &[&x]).unwrap();
        assert_eq!(back[0].data(), &[1., 1., 1., 2., 2., 2.]);
    }

    #[test]
    fn param_node_accumulates_gradient() {
        let p = Arc::new(
            Parameter::<f32>::new("w", Tensor::from_vec([2], vec![1., 2.]).unwrap()).unwrap(),
        );
        let node = ParamNode::new(engine(), p.clone());
        let ctx = RunContext::new();
        let out = node.forward(&ctx, &[]).unwrap();
        assert_eq!(out.data(), &[1., 2.]);
        let grad = Tensor::<f32>::from_vec([2], vec![0.5, 0.5]).unwrap();
        node.backward(&ctx, BackwardMode::Full, &grad, &[]).unwrap();
        assert_eq!(p.gradient().data(), &[0.5, 0.5]);
    }
}
