//! Pre-norm transformer block: attention and feed-forward sublayers, each
//! behind an RMS normalization and a residual join, with an optional
//! post-attention normalization. The backward pass is the full composition
//! of the constituent backwards.

use std::sync::Arc;

use crate::engine::Engine;
use crate::errors::Result;
use crate::graph::node::{expect_arity, Node, ShapeCell};
use crate::layers::attention::Attention;
use crate::layers::ffn::FeedForward;
use crate::layers::norm::RmsNorm;
use crate::numeric::Real;
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use crate::types::{AttrMap, BackwardMode, RunContext};

pub struct TransformerBlock<E: Real> {
    attn_norm: RmsNorm<E>,
    attn: Attention<E>,
    post_norm: Option<RmsNorm<E>>,
    ffn_norm: RmsNorm<E>,
    ffn: FeedForward<E>,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Real> TransformerBlock<E> {
    pub fn new(
        engine: Arc<dyn Engine<E>>,
        attn_norm: RmsNorm<E>,
        attn: Attention<E>,
        post_norm: Option<RmsNorm<E>>,
        ffn_norm: RmsNorm<E>,
        ffn: FeedForward<E>,
    ) -> Self {
        TransformerBlock {
            attn_norm,
            attn,
            post_norm,
            ffn_norm,
            ffn,
            engine,
            cell: ShapeCell::new(),
        }
    }
}

impl<E: Real> Node<E> for TransformerBlock<E> {
    fn op_type(&self) -> &str {
        "TransformerBlock"
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        for (k, v) in self.attn.attributes() {
            attrs.insert(k, v);
        }
        if let Some(g) = self.attn_norm.attributes().remove("gain") {
            attrs.insert("attn_norm_gain".into(), g);
        }
        if let Some(g) = self.ffn_norm.attributes().remove("gain") {
            attrs.insert("ffn_norm_gain".into(), g);
        }
        if let Some(post) = &self.post_norm {
            if let Some(g) = post.attributes().remove("gain") {
                attrs.insert("post_norm_gain".into(), g);
            }
        }
        for (k, v) in self.ffn.attributes() {
            attrs.insert(k, v);
        }
        if let Some(eps) = self.attn_norm.attributes().remove("epsilon") {
            attrs.insert("epsilon".into(), eps);
        }
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("TransformerBlock", inputs, 1)?;
        let x = inputs[0];
        let e = self.engine.as_ref();

        let n1 = self.attn_norm.apply(ctx, x)?;
        let a = self.attn.apply(ctx, &n1)?;
        let h1 = e.add(ctx, x, &a, None)?;
        let h1 = match &self.post_norm {
            Some(norm) => norm.apply(ctx, &h1)?,
            None => h1,
        };
        let n2 = self.ffn_norm.apply(ctx, &h1)?;
        let f = self.ffn.apply(ctx, &n2)?;
        e.add(ctx, &h1, &f, None)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("TransformerBlock", inputs, 1)?;
        let x = inputs[0];
        let e = self.engine.as_ref();

        // Recompute the forward chain.
        let n1 = self.attn_norm.apply(ctx, x)?;
        let a = self.attn.apply(ctx, &n1)?;
        let pre_post = e.add(ctx, x, &a, None)?;
        let h1 = match &self.post_norm {
            Some(norm) => norm.apply(ctx, &pre_post)?,
            None => pre_post.clone(),
        };
        let n2 = self.ffn_norm.apply(ctx, &h1)?;

        // out = h1 + ffn(ffn_norm(h1))
        let dn2 = self.ffn.grad_input(ctx, grad, &n2)?;
        let mut dh1 = e.add(ctx, grad, &self.ffn_norm.grad_input(ctx, &dn2, &h1)?, None)?;
        if let Some(norm) = &self.post_norm {
            dh1 = norm.grad_input(ctx, &dh1, &pre_post)?;
        }

        // pre_post = x + attn(attn_norm(x))
        let dn1 = self.attn.grad_input(ctx, &dh1, &n1)?;
        let dx = e.add(ctx, &dh1, &self.attn_norm.grad_input(ctx, &dn1, x)?, None)?;
        Ok(vec![dx])
    }

    fn parameters(&self) -> Vec<Arc<Parameter<E>>> {
        let mut params = self.attn_norm.parameters();
        params.extend(self.attn.parameters());
        if let Some(norm) = &self.post_norm {
            params.extend(norm.parameters());
        }
        params.extend(self.ffn_norm.parameters());
        params.extend(self.ffn.parameters());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;

    fn param(name: &str, dims: &[usize], value: f32) -> Arc<Parameter<f32>> {
        Arc::new(Parameter::new(name, Tensor::filled(dims.to_vec(), value)).unwrap())
    }

    fn block(dim: usize, hidden: usize) -> TransformerBlock<f32> {
        let engine: Arc<dyn Engine<f32>> = Arc::new(CpuEngine::new());
        let attn_norm =
            RmsNorm::new(engine.clone(), param("attn_norm.gain", &[dim], 1.0), 1e-5).unwrap();
        let ffn_norm =
            RmsNorm::new(engine.clone(), param("ffn_norm.gain", &[dim], 1.0), 1e-5).unwrap();
        let attn = Attention::new(
            engine.clone(),
            2,
            param("wq", &[dim, dim], 0.05),
            param("wk", &[dim, dim], 0.05),
            param("wv", &[dim, dim], 0.05),
            param("wo", &[dim, dim], 0.05),
            None,
            true,
        )
        .unwrap();
        let ffn = FeedForward::new(
            engine.clone(),
            param("w1", &[dim, hidden], 0.05),
            param("b1", &[hidden], 0.0),
            param("w2", &[hidden, dim], 0.05),
            param("b2", &[dim], 0.0),
        )
        .unwrap();
        TransformerBlock::new(engine, attn_norm, attn, None, ffn_norm, ffn)
    }

    #[test]
    fn forward_preserves_shape() {
        let b = block(4, 8);
        let ctx = RunContext::new();
        let x = Tensor::<f32>::filled([1, 3, 4], 0.3);
        let y = b.forward(&ctx, &[&x]).unwrap();
        assert_eq!(y.dims(), &[1, 3, 4]);
    }

    #[test]
    fn backward_touches_every_parameter() {
        let b = block(4, 8);
        let ctx = RunContext::new();
        let x = Tensor::<f32>::from_vec(
            [1, 2, 4],
            vec![0.1, -0.2, 0.3, 0.4, -0.5, 0.6, 0.7, -0.8],
        )
        .unwrap();
        b.forward(&ctx, &[&x]).unwrap();
        let grads = b
            .backward(&ctx, BackwardMode::Full, &Tensor::filled([1, 2, 4], 1.0), &[&x])
            .unwrap();
        assert_eq!(grads[0].dims(), &[1, 2, 4]);
        for p in b.parameters() {
            let nonzero = p.gradient().data().iter().any(|&v| v != 0.0);
            assert!(nonzero, "no gradient reached {}", p.name());
        }
    }

    #[test]
    fn parameters_flatten_in_sublayer_order() {
        let b = block(4, 8);
        let names: Vec<String> = b.parameters().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names[0], "attn_norm.gain");
        assert!(names.contains(&"w1".to_string()));
        assert_eq!(names.len(), 10);
    }
}
