//! Rotary positional embedding: rotates feature pairs by the angle
//! `m * theta_i` with `theta_i = base^(-2i/d)` for position `m`. The
//! rotation is a linear isometry, so the backward pass is the inverse
//! rotation applied to the upstream gradient.

use crate::errors::{Error, Result};
use crate::graph::node::{expect_arity, Node, ShapeCell};
use crate::numeric::Real;
use crate::tensor::Tensor;
use crate::types::{AttrMap, Attribute, BackwardMode, RunContext};

pub struct RotaryEmbedding<E: Real> {
    dim: usize,
    base: f64,
    max_seq_len: usize,
    // Tables indexed [position * dim/2 + pair].
    cos: Vec<f64>,
    sin: Vec<f64>,
    cell: ShapeCell,
    _marker: std::marker::PhantomData<E>,
}

impl<E: Real> RotaryEmbedding<E> {
    pub fn new(dim: usize, base: f64, max_seq_len: usize) -> Result<Self> {
        if dim == 0 || dim % 2 != 0 {
            return Err(Error::InvalidArgument(format!(
                "rotary dimension must be even and positive, got {}",
                dim
            )));
        }
        let half = dim / 2;
        let mut cos = Vec::with_capacity(max_seq_len * half);
        let mut sin = Vec::with_capacity(max_seq_len * half);
        for m in 0..max_seq_len {
            for i in 0..half {
                let theta = (m as f64) * base.powf(-2.0 * i as f64 / dim as f64);
                cos.push(theta.cos());
                sin.push(theta.sin());
            }
        }
        Ok(RotaryEmbedding {
            dim,
            base,
            max_seq_len,
            cos,
            sin,
            cell: ShapeCell::new(),
            _marker: std::marker::PhantomData,
        })
    }

    /// Rotates pairs of the last axis; positions run along the second-to-last
    /// axis. `invert` applies the transpose rotation.
    pub(crate) fn rotate(&self, ctx: &RunContext, x: &Tensor<E>, invert: bool) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let dims = x.dims();
        if dims.len() < 2 {
            return Err(Error::InvalidArgument(
                "rotary input must be at least rank 2".into(),
            ));
        }
        let d = dims[dims.len() - 1];
        let seq = dims[dims.len() - 2];
        if d != self.dim {
            return Err(Error::shape_mismatch("RotaryEmbedding", dims, &[self.dim]));
        }
        if seq > self.max_seq_len {
            return Err(Error::OutOfRange {
                index: seq as i64,
                bound: self.max_seq_len,
            });
        }
        let half = d / 2;
        let blocks = x.size() / (seq * d).max(1);
        let mut out = Tensor::<E>::zeros(x.shape().clone());
        let xd = x.data();
        let od = out.data_mut();
        for b in 0..blocks {
            for m in 0..seq {
                let row = (b * seq + m) * d;
                let table = m * half;
                for i in 0..half {
                    let (c, s) = (self.cos[table + i], self.sin[table + i]);
                    let s = if invert { -s } else { s };
                    let x0 = xd[row + 2 * i].as_f64();
                    let x1 = xd[row + 2 * i + 1].as_f64();
                    od[row + 2 * i] = E::from_f64(x0 * c - x1 * s);
                    od[row + 2 * i + 1] = E::from_f64(x0 * s + x1 * c);
                }
            }
        }
        Ok(out)
    }
}

impl<E: Real> Node<E> for RotaryEmbedding<E> {
    fn op_type(&self) -> &str {
        "RotaryEmbedding"
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("dim".into(), Attribute::Int(self.dim as i64));
        attrs.insert("base".into(), Attribute::Float(self.base as f32));
        attrs.insert("max_seq_len".into(), Attribute::Int(self.max_seq_len as i64));
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("RotaryEmbedding", inputs, 1)?;
        self.rotate(ctx, inputs[0], false)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("RotaryEmbedding", inputs, 1)?;
        Ok(vec![self.rotate(ctx, grad, true)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn position_zero_is_identity() {
        let rot = RotaryEmbedding::<f32>::new(4, 10000.0, 8).unwrap();
        let ctx = RunContext::new();
        let x = Tensor::from_vec([1, 4], vec![1., 2., 3., 4.]).unwrap();
        let y = rot.forward(&ctx, &[&x]).unwrap();
        assert_eq!(y.data(), x.data());
    }

    #[test]
    fn rotation_preserves_pair_norms() {
        let rot = RotaryEmbedding::<f32>::new(4, 10000.0, 8).unwrap();
        let ctx = RunContext::new();
        let x = Tensor::from_vec([3, 4], vec![1., 2., 3., 4., 5., 6., 7., 8., 9., 10., 11., 12.])
            .unwrap();
        let y = rot.forward(&ctx, &[&x]).unwrap();
        for m in 0..3 {
            for i in 0..2 {
                let x0 = x.data()[m * 4 + 2 * i];
                let x1 = x.data()[m * 4 + 2 * i + 1];
                let y0 = y.data()[m * 4 + 2 * i];
                let y1 = y.data()[m * 4 + 2 * i + 1];
                assert_relative_eq!(x0 * x0 + x1 * x1, y0 * y0 + y1 * y1, max_relative = 1e-4);
            }
        }
    }

    #[test]
    fn backward_inverts_forward() {
        let rot = RotaryEmbedding::<f32>::new(4, 10000.0, 8).unwrap();
        let ctx = RunContext::new();
        let x = Tensor::from_vec([2, 4], vec![1., 2., 3., 4., 5., 6., 7., 8.]).unwrap();
        let y = rot.forward(&ctx, &[&x]).unwrap();
        let back = rot
            .backward(&ctx, BackwardMode::Full, &y, &[&x])
            .unwrap()
            .remove(0);
        for (a, b) in back.data().iter().zip(x.data()) {
            assert_relative_eq!(a, b, max_relative = 1e-4);
        }
    }

    #[test]
    fn odd_dimension_rejected() {
        assert!(RotaryEmbedding::<f32>::new(3, 10000.0, 8).is_err());
    }

    #[test]
    fn sequence_beyond_table_rejected() {
        let rot = RotaryEmbedding::<f32>::new(4, 10000.0, 2).unwrap();
        let x = Tensor::<f32>::zeros([3, 4]);
        assert!(rot.forward(&RunContext::new(), &[&x]).is_err());
    }
}
