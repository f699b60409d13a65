//! Normalization layers. RMS normalization (the exchange format calls it
//! "SimplifiedLayerNormalization"), its residual-skip wrapper, and classical
//! layer normalization. All normalize over the last axis.

use std::sync::Arc;

use crate::engine::Engine;
use crate::errors::{Error, Result};
use crate::graph::node::{expect_arity, Node, ShapeCell};
use crate::numeric::Real;
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use crate::types::{AttrMap, Attribute, BackwardMode, RunContext};

pub(crate) fn leading_axes(rank: usize) -> Vec<isize> {
    (0..rank.saturating_sub(1)).map(|i| i as isize).collect()
}

/// Sums over every axis except the last; identity for rank-1 tensors.
fn sum_to_last_axis<E: Real>(
    engine: &dyn Engine<E>,
    ctx: &RunContext,
    t: &Tensor<E>,
) -> Result<Tensor<E>> {
    if t.rank() <= 1 {
        return Ok(t.clone());
    }
    engine.reduce_sum(ctx, t, &leading_axes(t.rank()), false, None)
}

/// RMS normalization with a per-feature gain.
///
/// `y = x * rsqrt(mean(x^2) + eps) * gain`, reducing over the last axis.
pub struct RmsNorm<E: Real> {
    op: &'static str,
    gain: Arc<Parameter<E>>,
    epsilon: f64,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Real> RmsNorm<E> {
    pub fn new(engine: Arc<dyn Engine<E>>, gain: Arc<Parameter<E>>, epsilon: f64) -> Result<Self> {
        if gain.value().rank() != 1 {
            return Err(Error::InvalidArgument(format!(
                "norm gain {:?} must be rank 1, got {:?}",
                gain.name(),
                gain.value().dims()
            )));
        }
        Ok(RmsNorm {
            op: "SimplifiedLayerNormalization",
            gain,
            epsilon,
            engine,
            cell: ShapeCell::new(),
        })
    }

    pub fn with_op_type(mut self, op: &'static str) -> Self {
        self.op = op;
        self
    }

    pub fn gain(&self) -> &Arc<Parameter<E>> {
        &self.gain
    }

    fn check_last_axis(&self, x: &Tensor<E>) -> Result<()> {
        let features = self.gain.value().size();
        if x.rank() == 0 || x.dims()[x.rank() - 1] != features {
            return Err(Error::shape_mismatch(self.op, x.dims(), self.gain.value().dims()));
        }
        Ok(())
    }

    /// Inverse root-mean-square over the last axis, shaped `[..., 1]`.
    fn inv_rms(&self, ctx: &RunContext, x: &Tensor<E>) -> Result<Tensor<E>> {
        let e = self.engine.as_ref();
        let sq = e.mul(ctx, x, x, None)?;
        let mean = e.reduce_mean(ctx, &sq, &[-1], true, None)?;
        let shifted = e.add_scalar(ctx, &mean, E::from_f64(self.epsilon), None)?;
        e.rsqrt(ctx, &shifted, None)
    }

    pub(crate) fn apply(&self, ctx: &RunContext, x: &Tensor<E>) -> Result<Tensor<E>> {
        self.check_last_axis(x)?;
        let e = self.engine.as_ref();
        let r = self.inv_rms(ctx, x)?;
        let xr = e.mul(ctx, x, &r, None)?;
        e.mul(ctx, &xr, self.gain.value(), None)
    }

    /// Gradient with respect to the input; the gain gradient is accumulated
    /// into the parameter as a side effect.
    pub(crate) fn grad_input(
        &self,
        ctx: &RunContext,
        grad: &Tensor<E>,
        x: &Tensor<E>,
    ) -> Result<Tensor<E>> {
        self.check_last_axis(x)?;
        let e = self.engine.as_ref();
        let n = x.dims()[x.rank() - 1];
        let r = self.inv_rms(ctx, x)?;

        // d_gain = sum over leading axes of (dY * x * rms)
        let gx = e.mul(ctx, grad, x, None)?;
        let gxr = e.mul(ctx, &gx, &r, None)?;
        let dgain = sum_to_last_axis(e, ctx, &gxr)?;
        self.gain.add_gradient(&dgain)?;

        // dx = (dY*g)*rms - x * sum((dY*g)*x) * rms^3 / N
        let gy = e.mul(ctx, grad, self.gain.value(), None)?;
        let first = e.mul(ctx, &gy, &r, None)?;
        let s = e.reduce_sum(ctx, &e.mul(ctx, &gy, x, None)?, &[-1], true, None)?;
        let r3 = e.mul(ctx, &e.mul(ctx, &r, &r, None)?, &r, None)?;
        let second = e.mul(ctx, &e.mul(ctx, x, &s, None)?, &r3, None)?;
        let second = e.mul_scalar(ctx, &second, E::from_f64(1.0 / n as f64), None)?;
        e.sub(ctx, &first, &second, None)
    }
}

impl<E: Real> Node<E> for RmsNorm<E> {
    fn op_type(&self) -> &str {
        self.op
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("epsilon".into(), Attribute::Float(self.epsilon as f32));
        attrs.insert("gain".into(), Attribute::Str(self.gain.name().to_string()));
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity(self.op, inputs, 1)?;
        self.apply(ctx, inputs[0])
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity(self.op, inputs, 1)?;
        Ok(vec![self.grad_input(ctx, grad, inputs[0])?])
    }

    fn parameters(&self) -> Vec<Arc<Parameter<E>>> {
        vec![self.gain.clone()]
    }
}

/// Residual wrapper: `y = x + SLN(x)`.
pub struct SkipRmsNorm<E: Real> {
    inner: RmsNorm<E>,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Real> SkipRmsNorm<E> {
    pub fn new(engine: Arc<dyn Engine<E>>, gain: Arc<Parameter<E>>, epsilon: f64) -> Result<Self> {
        let inner = RmsNorm::new(engine.clone(), gain, epsilon)?;
        Ok(SkipRmsNorm { inner, engine, cell: ShapeCell::new() })
    }
}

impl<E: Real> Node<E> for SkipRmsNorm<E> {
    fn op_type(&self) -> &str {
        "SkipSimplifiedLayerNormalization"
    }

    fn attributes(&self) -> AttrMap {
        self.inner.attributes()
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("SkipSimplifiedLayerNormalization", inputs, 1)?;
        let x = inputs[0];
        let normed = self.inner.apply(ctx, x)?;
        self.engine.add(ctx, x, &normed, None)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("SkipSimplifiedLayerNormalization", inputs, 1)?;
        let x = inputs[0];
        let through = self.inner.grad_input(ctx, grad, x)?;
        Ok(vec![self.engine.add(ctx, grad, &through, None)?])
    }

    fn parameters(&self) -> Vec<Arc<Parameter<E>>> {
        self.inner.parameters()
    }
}

/// Classical layer normalization with scale and shift.
pub struct LayerNorm<E: Real> {
    scale: Arc<Parameter<E>>,
    shift: Arc<Parameter<E>>,
    epsilon: f64,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Real> LayerNorm<E> {
    pub fn new(
        engine: Arc<dyn Engine<E>>,
        scale: Arc<Parameter<E>>,
        shift: Arc<Parameter<E>>,
        epsilon: f64,
    ) -> Result<Self> {
        if scale.value().rank() != 1 || !scale.value().shape_equals(shift.value()) {
            return Err(Error::shape_mismatch(
                "LayerNormalization",
                scale.value().dims(),
                shift.value().dims(),
            ));
        }
        Ok(LayerNorm { scale, shift, epsilon, engine, cell: ShapeCell::new() })
    }

    /// Normalized input and the inverse standard deviation, both reused by
    /// the backward pass.
    fn normalize(&self, ctx: &RunContext, x: &Tensor<E>) -> Result<(Tensor<E>, Tensor<E>)> {
        let e = self.engine.as_ref();
        let mean = e.reduce_mean(ctx, x, &[-1], true, None)?;
        let centered = e.sub(ctx, x, &mean, None)?;
        let var = e.reduce_mean(ctx, &e.mul(ctx, &centered, &centered, None)?, &[-1], true, None)?;
        let inv_std = e.rsqrt(ctx, &e.add_scalar(ctx, &var, E::from_f64(self.epsilon), None)?, None)?;
        let normed = e.mul(ctx, &centered, &inv_std, None)?;
        Ok((normed, inv_std))
    }
}

impl<E: Real> Node<E> for LayerNorm<E> {
    fn op_type(&self) -> &str {
        "LayerNormalization"
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("epsilon".into(), Attribute::Float(self.epsilon as f32));
        attrs.insert("scale".into(), Attribute::Str(self.scale.name().to_string()));
        attrs.insert("bias".into(), Attribute::Str(self.shift.name().to_string()));
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("LayerNormalization", inputs, 1)?;
        let x = inputs[0];
        let features = self.scale.value().size();
        if x.rank() == 0 || x.dims()[x.rank() - 1] != features {
            return Err(Error::shape_mismatch(
                "LayerNormalization",
                x.dims(),
                self.scale.value().dims(),
            ));
        }
        let e = self.engine.as_ref();
        let (normed, _) = self.normalize(ctx, x)?;
        let scaled = e.mul(ctx, &normed, self.scale.value(), None)?;
        e.add(ctx, &scaled, self.shift.value(), None)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("LayerNormalization", inputs, 1)?;
        let x = inputs[0];
        let e = self.engine.as_ref();
        let (normed, inv_std) = self.normalize(ctx, x)?;

        let dscale = sum_to_last_axis(e, ctx, &e.mul(ctx, grad, &normed, None)?)?;
        self.scale.add_gradient(&dscale)?;
        let dshift = sum_to_last_axis(e, ctx, grad)?;
        self.shift.add_gradient(&dshift)?;

        // dx = inv_std * (gy - mean(gy) - x_hat * mean(gy * x_hat))
        let gy = e.mul(ctx, grad, self.scale.value(), None)?;
        let m1 = e.reduce_mean(ctx, &gy, &[-1], true, None)?;
        let m2 = e.reduce_mean(ctx, &e.mul(ctx, &gy, &normed, None)?, &[-1], true, None)?;
        let centered = e.sub(ctx, &gy, &m1, None)?;
        let correction = e.mul(ctx, &normed, &m2, None)?;
        let dx = e.mul(ctx, &inv_std, &e.sub(ctx, &centered, &correction, None)?, None)?;
        Ok(vec![dx])
    }

    fn parameters(&self) -> Vec<Arc<Parameter<E>>> {
        vec![self.scale.clone(), self.shift.clone()]
    }
}
