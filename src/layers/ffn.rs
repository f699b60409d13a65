//! Position-wise feed-forward sublayer: two projections with a FastGelu
//! activation between them. The standalone `FastGelu` node covers models
//! that carry the activation as its own graph operator.

use std::sync::Arc;

use crate::engine::Engine;
use crate::errors::{Error, Result};
use crate::graph::node::{expect_arity, reduce_to_shape, swap_last_axes, Node, ShapeCell};
use crate::layers::norm::leading_axes;
use crate::numeric::Real;
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use crate::types::{AttrMap, Attribute, BackwardMode, RunContext};

const GELU_COEF: f64 = 0.797_884_560_802_865_4; // sqrt(2/pi)
const GELU_CUBIC: f64 = 0.044_715;

fn fast_gelu(v: f64) -> f64 {
    0.5 * v * (1.0 + (GELU_COEF * (v + GELU_CUBIC * v * v * v)).tanh())
}

fn fast_gelu_grad(v: f64) -> f64 {
    let t = (GELU_COEF * (v + GELU_CUBIC * v * v * v)).tanh();
    0.5 * (1.0 + t) + 0.5 * v * (1.0 - t * t) * GELU_COEF * (1.0 + 3.0 * GELU_CUBIC * v * v)
}

/// Element-wise FastGelu activation node.
pub struct FastGeluNode<E: Real> {
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Real> FastGeluNode<E> {
    pub fn new(engine: Arc<dyn Engine<E>>) -> Self {
        FastGeluNode { engine, cell: ShapeCell::new() }
    }
}

impl<E: Real> Node<E> for FastGeluNode<E> {
    fn op_type(&self) -> &str {
        "FastGelu"
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("FastGelu", inputs, 1)?;
        self.engine
            .unary(ctx, inputs[0], &|v: E| E::from_f64(fast_gelu(v.as_f64())), None)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("FastGelu", inputs, 1)?;
        let slope = self.engine.unary(
            ctx,
            inputs[0],
            &|v: E| E::from_f64(fast_gelu_grad(v.as_f64())),
            None,
        )?;
        Ok(vec![self.engine.mul(ctx, grad, &slope, None)?])
    }
}

/// `y = FastGelu(x*W1 + b1) * W2 + b2` over the last axis.
pub struct FeedForward<E: Real> {
    w1: Arc<Parameter<E>>,
    b1: Arc<Parameter<E>>,
    w2: Arc<Parameter<E>>,
    b2: Arc<Parameter<E>>,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Real> FeedForward<E> {
    pub fn new(
        engine: Arc<dyn Engine<E>>,
        w1: Arc<Parameter<E>>,
        b1: Arc<Parameter<E>>,
        w2: Arc<Parameter<E>>,
        b2: Arc<Parameter<E>>,
    ) -> Result<Self> {
        let (d1, h1) = match w1.value().dims() {
            [a, b] => (*a, *b),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "feed-forward projection {:?} must be rank 2, got {:?}",
                    w1.name(),
                    other
                )))
            }
        };
        let (h2, d2) = match w2.value().dims() {
            [a, b] => (*a, *b),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "feed-forward projection {:?} must be rank 2, got {:?}",
                    w2.name(),
                    other
                )))
            }
        };
        if h1 != h2 || d1 != d2 || b1.value().dims() != [h1] || b2.value().dims() != [d2] {
            return Err(Error::shape_mismatch(
                "FeedForward",
                w1.value().dims(),
                w2.value().dims(),
            ));
        }
        Ok(FeedForward { w1, b1, w2, b2, engine, cell: ShapeCell::new() })
    }

    /// Fresh Xavier-initialized projections under the given name prefix.
    pub fn randomized(
        engine: Arc<dyn Engine<E>>,
        name: &str,
        dim: usize,
        hidden: usize,
    ) -> Result<Self> {
        let w1 = Arc::new(Parameter::new(
            format!("{}.w1", name),
            crate::init::xavier([dim, hidden], dim, hidden),
        )?);
        let b1 = Arc::new(Parameter::new(format!("{}.b1", name), Tensor::zeros([hidden]))?);
        let w2 = Arc::new(Parameter::new(
            format!("{}.w2", name),
            crate::init::xavier([hidden, dim], hidden, dim),
        )?);
        let b2 = Arc::new(Parameter::new(format!("{}.b2", name), Tensor::zeros([dim]))?);
        Self::new(engine, w1, b1, w2, b2)
    }

    fn hidden(&self, ctx: &RunContext, x: &Tensor<E>) -> Result<(Tensor<E>, Tensor<E>)> {
        let e = self.engine.as_ref();
        let h = e.add(ctx, &e.matmul(ctx, x, self.w1.value(), None)?, self.b1.value(), None)?;
        let a = e.unary(ctx, &h, &|v: E| E::from_f64(fast_gelu(v.as_f64())), None)?;
        Ok((h, a))
    }

    pub(crate) fn apply(&self, ctx: &RunContext, x: &Tensor<E>) -> Result<Tensor<E>> {
        let e = self.engine.as_ref();
        let (_, a) = self.hidden(ctx, x)?;
        e.add(ctx, &e.matmul(ctx, &a, self.w2.value(), None)?, self.b2.value(), None)
    }

    /// Gradient with respect to the input; projection and bias gradients are
    /// accumulated into the parameters.
    pub(crate) fn grad_input(
        &self,
        ctx: &RunContext,
        grad: &Tensor<E>,
        x: &Tensor<E>,
    ) -> Result<Tensor<E>> {
        let e = self.engine.as_ref();
        let (h, a) = self.hidden(ctx, x)?;

        let db2 = if grad.rank() <= 1 {
            grad.clone()
        } else {
            e.reduce_sum(ctx, grad, &leading_axes(grad.rank()), false, None)?
        };
        self.b2.add_gradient(&db2)?;
        let at = e.transpose(ctx, &a, &swap_last_axes(a.rank()), None)?;
        let dw2 = e.matmul(ctx, &at, grad, None)?;
        self.w2
            .add_gradient(&reduce_to_shape(e, ctx, &dw2, self.w2.value().shape())?)?;

        let w2t = e.transpose(ctx, self.w2.value(), &[1, 0], None)?;
        let da = e.matmul(ctx, grad, &w2t, None)?;
        let slope = e.unary(ctx, &h, &|v: E| E::from_f64(fast_gelu_grad(v.as_f64())), None)?;
        let dh = e.mul(ctx, &da, &slope, None)?;

        let db1 = if dh.rank() <= 1 {
            dh.clone()
        } else {
            e.reduce_sum(ctx, &dh, &leading_axes(dh.rank()), false, None)?
        };
        self.b1.add_gradient(&db1)?;
        let xt = e.transpose(ctx, x, &swap_last_axes(x.rank()), None)?;
        let dw1 = e.matmul(ctx, &xt, &dh, None)?;
        self.w1
            .add_gradient(&reduce_to_shape(e, ctx, &dw1, self.w1.value().shape())?)?;

        let w1t = e.transpose(ctx, self.w1.value(), &[1, 0], None)?;
        e.matmul(ctx, &dh, &w1t, None)
    }
}

impl<E: Real> Node<E> for FeedForward<E> {
    fn op_type(&self) -> &str {
        "FeedForward"
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("w1".into(), Attribute::Str(self.w1.name().to_string()));
        attrs.insert("b1".into(), Attribute::Str(self.b1.name().to_string()));
        attrs.insert("w2".into(), Attribute::Str(self.w2.name().to_string()));
        attrs.insert("b2".into(), Attribute::Str(self.b2.name().to_string()));
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("FeedForward", inputs, 1)?;
        self.apply(ctx, inputs[0])
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("FeedForward", inputs, 1)?;
        Ok(vec![self.grad_input(ctx, grad, inputs[0])?])
    }

    fn parameters(&self) -> Vec<Arc<Parameter<E>>> {
        vec![self.w1.clone(), self.b1.clone(), self.w2.clone(), self.b2.clone()]
    }
}
