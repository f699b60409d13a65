//! Multi-head scaled dot-product attention with optional rotary position
//! encoding and causal masking. The backward pass recomputes the forward
//! chain from the memoized input and walks it in reverse.

use std::sync::Arc;

use crate::engine::Engine;
use crate::errors::{Error, Result};
use crate::graph::node::{expect_arity, reduce_to_shape, Node, ShapeCell};
use crate::layers::rotary::RotaryEmbedding;
use crate::numeric::Real;
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use crate::types::{AttrMap, Attribute, BackwardMode, RunContext};

pub struct Attention<E: Real> {
    num_heads: usize,
    head_dim: usize,
    wq: Arc<Parameter<E>>,
    wk: Arc<Parameter<E>>,
    wv: Arc<Parameter<E>>,
    wo: Arc<Parameter<E>>,
    rotary: Option<RotaryEmbedding<E>>,
    causal: bool,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

/// Forward intermediates retained for the reverse walk.
struct AttentionTrace<E> {
    q_heads: Tensor<E>,
    k_heads: Tensor<E>,
    v_heads: Tensor<E>,
    weights: Tensor<E>,
    merged: Tensor<E>,
}

impl<E: Real> Attention<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn Engine<E>>,
        num_heads: usize,
        wq: Arc<Parameter<E>>,
        wk: Arc<Parameter<E>>,
        wv: Arc<Parameter<E>>,
        wo: Arc<Parameter<E>>,
        rotary: Option<RotaryEmbedding<E>>,
        causal: bool,
    ) -> Result<Self> {
        let model_dim = match wq.value().dims() {
            [d, d2] if d == d2 => *d,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "attention projection {:?} must be square, got {:?}",
                    wq.name(),
                    other
                )))
            }
        };
        if num_heads == 0 || model_dim % num_heads != 0 {
            return Err(Error::InvalidArgument(format!(
                "model dimension {} is not divisible into {} heads",
                model_dim, num_heads
            )));
        }
        for p in [&wk, &wv, &wo] {
            if !p.value().shape_equals(wq.value()) {
                return Err(Error::shape_mismatch(
                    "Attention",
                    wq.value().dims(),
                    p.value().dims(),
                ));
            }
        }
        Ok(Attention {
            num_heads,
            head_dim: model_dim / num_heads,
            wq,
            wk,
            wv,
            wo,
            rotary,
            causal,
            engine,
            cell: ShapeCell::new(),
        })
    }

    /// Fresh Xavier-initialized projections under the given name prefix.
    pub fn randomized(
        engine: Arc<dyn Engine<E>>,
        name: &str,
        num_heads: usize,
        model_dim: usize,
        rotary: Option<RotaryEmbedding<E>>,
        causal: bool,
    ) -> Result<Self> {
        let proj = |suffix: &str| -> Result<Arc<Parameter<E>>> {
            Ok(Arc::new(Parameter::new(
                format!("{}.{}", name, suffix),
                crate::init::xavier([model_dim, model_dim], model_dim, model_dim),
            )?))
        };
        Self::new(
            engine,
            num_heads,
            proj("wq")?,
            proj("wk")?,
            proj("wv")?,
            proj("wo")?,
            rotary,
            causal,
        )
    }

    fn model_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// `[b, s, d] -> [b, heads, s, head_dim]`
    fn split_heads(&self, ctx: &RunContext, x: &Tensor<E>) -> Result<Tensor<E>> {
        let e = self.engine.as_ref();
        let (b, s) = (x.dims()[0], x.dims()[1]);
        let r = e.reshape(ctx, x, &[b, s, self.num_heads, self.head_dim], None)?;
        e.transpose(ctx, &r, &[0, 2, 1, 3], None)
    }

    /// `[b, heads, s, head_dim] -> [b, s, d]`
    fn merge_heads(&self, ctx: &RunContext, x: &Tensor<E>) -> Result<Tensor<E>> {
        let e = self.engine.as_ref();
        let (b, s) = (x.dims()[0], x.dims()[2]);
        let t = e.transpose(ctx, x, &[0, 2, 1, 3], None)?;
        e.reshape(ctx, &t, &[b, s, self.model_dim()], None)
    }

    /// Additive causal mask `[s, s]`: zero on and below the diagonal,
    /// negative infinity above.
    fn causal_mask(&self, seq: usize) -> Tensor<E> {
        let mut mask = Tensor::<E>::zeros([seq, seq]);
        let neg_inf = E::from_f64(f64::NEG_INFINITY);
        let data = mask.data_mut();
        for i in 0..seq {
            for j in i + 1..seq {
                data[i * seq + j] = neg_inf;
            }
        }
        mask
    }

    fn softmax_last(&self, ctx: &RunContext, x: &Tensor<E>) -> Result<Tensor<E>> {
        let e = self.engine.as_ref();
        let max = e.reduce_max(ctx, x, &[-1], true, None)?;
        let z = e.exp(ctx, &e.sub(ctx, x, &max, None)?, None)?;
        let total = e.reduce_sum(ctx, &z, &[-1], true, None)?;
        e.div(ctx, &z, &total, None)
    }

    fn trace(&self, ctx: &RunContext, x: &Tensor<E>) -> Result<AttentionTrace<E>> {
        if x.rank() != 3 {
            return Err(Error::InvalidArgument(format!(
                "attention input must be [batch, seq, dim], got {:?}",
                x.dims()
            )));
        }
        if x.dims()[2] != self.model_dim() {
            return Err(Error::shape_mismatch("Attention", x.dims(), self.wq.value().dims()));
        }
        let e = self.engine.as_ref();
        let seq = x.dims()[1];

        let q = e.matmul(ctx, x, self.wq.value(), None)?;
        let k = e.matmul(ctx, x, self.wk.value(), None)?;
        let v = e.matmul(ctx, x, self.wv.value(), None)?;

        let mut q_heads = self.split_heads(ctx, &q)?;
        let mut k_heads = self.split_heads(ctx, &k)?;
        let v_heads = self.split_heads(ctx, &v)?;
        if let Some(rot) = &self.rotary {
            q_heads = rot.rotate(ctx, &q_heads, false)?;
            k_heads = rot.rotate(ctx, &k_heads, false)?;
        }

        let kt = e.transpose(ctx, &k_heads, &[0, 1, 3, 2], None)?;
        let scores = e.matmul(ctx, &q_heads, &kt, None)?;
        let scale = E::from_f64(1.0 / (self.head_dim as f64).sqrt());
        let mut scaled = e.mul_scalar(ctx, &scores, scale, None)?;
        if self.causal {
            scaled = e.add(ctx, &scaled, &self.causal_mask(seq), None)?;
        }
        let weights = self.softmax_last(ctx, &scaled)?;

        let context = e.matmul(ctx, &weights, &v_heads, None)?;
        let merged = self.merge_heads(ctx, &context)?;
        Ok(AttentionTrace { q_heads, k_heads, v_heads, weights, merged })
    }

    pub(crate) fn apply(&self, ctx: &RunContext, x: &Tensor<E>) -> Result<Tensor<E>> {
        let trace = self.trace(ctx, x)?;
        self.engine.matmul(ctx, &trace.merged, self.wo.value(), None)
    }

    pub(crate) fn grad_input(
        &self,
        ctx: &RunContext,
        grad: &Tensor<E>,
        x: &Tensor<E>,
    ) -> Result<Tensor<E>> {
        let e = self.engine.as_ref();
        let trace = self.trace(ctx, x)?;

        // Output projection.
        let merged_t = e.transpose(ctx, &trace.merged, &[0, 2, 1], None)?;
        let dwo = e.matmul(ctx, &merged_t, grad, None)?;
        self.wo
            .add_gradient(&reduce_to_shape(e, ctx, &dwo, self.wo.value().shape())?)?;
        let wo_t = e.transpose(ctx, self.wo.value(), &[1, 0], None)?;
        let dmerged = e.matmul(ctx, grad, &wo_t, None)?;
        let dcontext = self.split_heads(ctx, &dmerged)?;

        // Attention-weighted value combination.
        let v_t = e.transpose(ctx, &trace.v_heads, &[0, 1, 3, 2], None)?;
        let dweights = e.matmul(ctx, &dcontext, &v_t, None)?;
        let w_t = e.transpose(ctx, &trace.weights, &[0, 1, 3, 2], None)?;
        let dv_heads = e.matmul(ctx, &w_t, &dcontext, None)?;

        // Softmax over the last axis: dz = w * (dw - sum(dw * w)).
        let inner = e.reduce_sum(
            ctx,
            &e.mul(ctx, &dweights, &trace.weights, None)?,
            &[-1],
            true,
            None,
        )?;
        let dscaled = e.mul(ctx, &trace.weights, &e.sub(ctx, &dweights, &inner, None)?, None)?;
        // The additive mask is constant, so the gradient passes through.
        let scale = E::from_f64(1.0 / (self.head_dim as f64).sqrt());
        let dscores = e.mul_scalar(ctx, &dscaled, scale, None)?;

        // scores = q · k^T
        let mut dq_heads = e.matmul(ctx, &dscores, &trace.k_heads, None)?;
        let dscores_t = e.transpose(ctx, &dscores, &[0, 1, 3, 2], None)?;
        let mut dk_heads = e.matmul(ctx, &dscores_t, &trace.q_heads, None)?;
        if let Some(rot) = &self.rotary {
            dq_heads = rot.rotate(ctx, &dq_heads, true)?;
            dk_heads = rot.rotate(ctx, &dk_heads, true)?;
        }

        let dq = self.merge_heads(ctx, &dq_heads)?;
        let dk = self.merge_heads(ctx, &dk_heads)?;
        let dv = self.merge_heads(ctx, &dv_heads)?;

        // Input projections.
        let x_t = e.transpose(ctx, x, &[0, 2, 1], None)?;
        for (w, d) in [(&self.wq, &dq), (&self.wk, &dk), (&self.wv, &dv)] {
            let dw = e.matmul(ctx, &x_t, d, None)?;
            w.add_gradient(&reduce_to_shape(e, ctx, &dw, w.value().shape())?)?;
        }
        let wq_t = e.transpose(ctx, self.wq.value(), &[1, 0], None)?;
        let wk_t = e.transpose(ctx, self.wk.value(), &[1, 0], None)?;
        let wv_t = e.transpose(ctx, self.wv.value(), &[1, 0], None)?;
        let mut dx = e.matmul(ctx, &dq, &wq_t, None)?;
        dx = e.add(ctx, &dx, &e.matmul(ctx, &dk, &wk_t, None)?, None)?;
        e.add(ctx, &dx, &e.matmul(ctx, &dv, &wv_t, None)?, None)
    }
}

impl<E: Real> Node<E> for Attention<E> {
    fn op_type(&self) -> &str {
        "Attention"
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("num_heads".into(), Attribute::Int(self.num_heads as i64));
        attrs.insert("head_dim".into(), Attribute::Int(self.head_dim as i64));
        attrs.insert("causal".into(), Attribute::Int(self.causal as i64));
        attrs.insert("wq".into(), Attribute::Str(self.wq.name().to_string()));
        attrs.insert("wk".into(), Attribute::Str(self.wk.name().to_string()));
        attrs.insert("wv".into(), Attribute::Str(self.wv.name().to_string()));
        attrs.insert("wo".into(), Attribute::Str(self.wo.name().to_string()));
        if let Some(rot) = &self.rotary {
            for (k, v) in rot.attributes() {
                attrs.insert(format!("rotary_{}", k), v);
            }
        }
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("Attention", inputs, 1)?;
        self.apply(ctx, inputs[0])
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("Attention", inputs, 1)?;
        Ok(vec![self.grad_input(ctx, grad, inputs[0])?])
    }

    fn parameters(&self) -> Vec<Arc<Parameter<E>>> {
        vec![self.wq.clone(), self.wk.clone(), self.wv.clone(), self.wo.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;
    use approx::assert_relative_eq;

    fn eye(n: usize, name: &str) -> Arc<Parameter<f32>> {
        let mut t = Tensor::<f32>::zeros([n, n]);
        for i in 0..n {
            t.data_mut()[i * n + i] = 1.0;
        }
        Arc::new(Parameter::new(name, t).unwrap())
    }

    fn identity_attention(heads: usize, dim: usize, causal: bool) -> Attention<f32> {
        Attention::new(
            Arc::new(CpuEngine::new()),
            heads,
            eye(dim, "wq"),
            eye(dim, "wk"),
            eye(dim, "wv"),
            eye(dim, "wo"),
            None,
            causal,
        )
        .unwrap()
    }

    #[test]
    fn attention_rows_are_convex_combinations() {
        let attn = identity_attention(2, 4, false);
        let ctx = RunContext::new();
        let x = Tensor::<f32>::from_vec(
            [1, 3, 4],
            vec![1., 0., 0., 0., 0., 1., 0., 0., 0., 0., 1., 0.],
        )
        .unwrap();
        let y = attn.forward(&ctx, &[&x]).unwrap();
        assert_eq!(y.dims(), &[1, 3, 4]);
        // Values are bounded by the min/max of the value rows.
        for &v in y.data() {
            assert!((-1e-4..=1.0 + 1e-4).contains(&v));
        }
    }

    #[test]
    fn causal_first_position_attends_only_to_itself() {
        let attn = identity_attention(1, 2, true);
        let ctx = RunContext::new();
        let x = Tensor::<f32>::from_vec([1, 2, 2], vec![1., 2., 3., 4.]).unwrap();
        let y = attn.forward(&ctx, &[&x]).unwrap();
        // Row 0 can only attend to position 0, so it reproduces it.
        assert_relative_eq!(y.data()[0], 1.0, max_relative = 1e-5);
        assert_relative_eq!(y.data()[1], 2.0, max_relative = 1e-5);
    }

    #[test]
    fn backward_produces_input_shaped_gradient() {
        let attn = identity_attention(2, 4, true);
        let ctx = RunContext::new();
        let x = Tensor::<f32>::filled([2, 3, 4], 0.5);
        attn.forward(&ctx, &[&x]).unwrap();
        let grads = attn
            .backward(&ctx, BackwardMode::Full, &Tensor::filled([2, 3, 4], 1.0), &[&x])
            .unwrap();
        assert_eq!(grads[0].dims(), &[2, 3, 4]);
        assert_eq!(attn.wo.gradient().dims(), &[4, 4]);
        assert!(attn.wo.gradient().data().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn randomized_constructor_applies_rotary() {
        let engine: Arc<dyn Engine<f32>> = Arc::new(CpuEngine::new());
        let rot = RotaryEmbedding::new(2, 10000.0, 16).unwrap();
        let attn = Attention::randomized(engine, "attn", 2, 4, Some(rot), true).unwrap();
        let y = attn
            .forward(&RunContext::new(), &[&Tensor::filled([1, 3, 4], 0.2)])
            .unwrap();
        assert_eq!(y.dims(), &[1, 3, 4]);
    }

    #[test]
    fn non_divisible_heads_rejected() {
        let engine: Arc<dyn Engine<f32>> = Arc::new(CpuEngine::new());
        let r = Attention::new(
            engine,
            3,
            eye(4, "wq"),
            eye(4, "wk"),
            eye(4, "wv"),
            eye(4, "wo"),
            None,
            false,
        );
        assert!(r.is_err());
    }
}
