//! Reference engine: straightforward loop kernels over row-major storage.
//! The matmul inner loop is parallelized over output rows when the `rayon`
//! feature is enabled; everything else is single-threaded.

use crate::engine::Engine;
use crate::errors::{Error, Result};
use crate::numeric::{Numeric, Real};
use crate::tensor::broadcast::{broadcast_shape, broadcast_strides, IndexWalker};
use crate::tensor::Tensor;
use crate::types::{RunContext, Shape};

#[derive(Debug, Default, Clone, Copy)]
pub struct CpuEngine;

impl CpuEngine {
    pub fn new() -> Self {
        CpuEngine
    }
}

/// Validates a caller-supplied destination or allocates a fresh output.
fn take_dst<E: Numeric>(op: &str, shape: &Shape, dst: Option<Tensor<E>>) -> Result<Tensor<E>> {
    match dst {
        Some(t) if t.shape() == shape => Ok(t),
        Some(t) => Err(Error::shape_mismatch(op, shape.as_slice(), t.dims())),
        None => Ok(Tensor::zeros(shape.clone())),
    }
}

fn index_value<E: Numeric>(v: E) -> i64 {
    v.as_f64() as i64
}

/// Splits dims at `axis` into (outer, axis_len, inner) block counts.
fn axis_blocks(dims: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();
    (outer, dims[axis], inner)
}

fn matmul_row<E: Numeric>(a: &[E], b: &[E], k: usize, n: usize, mi: usize, row: &mut [E]) {
    for ni in 0..n {
        let mut acc = E::zero();
        for ki in 0..k {
            acc = acc + a[mi * k + ki] * b[ki * n + ni];
        }
        row[ni] = acc;
    }
}

#[cfg(feature = "rayon")]
fn matmul_2d<E: Numeric>(a: &[E], b: &[E], k: usize, n: usize, out: &mut [E]) {
    use rayon::prelude::*;
    out.par_chunks_mut(n)
        .enumerate()
        .for_each(|(mi, row)| matmul_row(a, b, k, n, mi, row));
}

#[cfg(not(feature = "rayon"))]
fn matmul_2d<E: Numeric>(a: &[E], b: &[E], k: usize, n: usize, out: &mut [E]) {
    for (mi, row) in out.chunks_mut(n).enumerate() {
        matmul_row(a, b, k, n, mi, row);
    }
}

impl CpuEngine {
    fn map<E: Numeric>(
        &self,
        ctx: &RunContext,
        op: &str,
        x: &Tensor<E>,
        f: impl Fn(E) -> E,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let mut out = take_dst(op, x.shape(), dst)?;
        for (o, &v) in out.data_mut().iter_mut().zip(x.data()) {
            *o = f(v);
        }
        Ok(out)
    }

    fn binary<E: Numeric>(
        &self,
        ctx: &RunContext,
        op: &str,
        a: &Tensor<E>,
        b: &Tensor<E>,
        f: impl Fn(E, E) -> E,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let out_shape = broadcast_shape(op, a.shape(), b.shape())?;
        let sa = broadcast_strides(a.shape(), &out_shape);
        let sb = broadcast_strides(b.shape(), &out_shape);
        let mut out = take_dst(op, &out_shape, dst)?;
        let mut w = IndexWalker::new(&out_shape, vec![&sa, &sb]);
        if !w.is_done() {
            let (ad, bd) = (a.data(), b.data());
            let od = out.data_mut();
            let mut pos = 0;
            loop {
                od[pos] = f(ad[w.offset(0)], bd[w.offset(1)]);
                pos += 1;
                if !w.advance() {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Shared frame for the axis reductions: resolves the axes list, builds
    /// the output shapes, and folds every input element into its output slot.
    fn reduce<E: Numeric>(
        &self,
        ctx: &RunContext,
        op: &str,
        x: &Tensor<E>,
        axes: &[isize],
        keep_dims: bool,
        dst: Option<Tensor<E>>,
        fold: impl Fn(E, E, bool) -> E,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let dims = x.dims();
        let mut resolved: Vec<usize> = if axes.is_empty() {
            (0..dims.len()).collect()
        } else {
            axes.iter()
                .map(|&a| x.shape().resolve_axis(a))
                .collect::<Result<_>>()?
        };
        resolved.sort_unstable();
        resolved.dedup();

        let mut full_dims = dims.to_vec();
        for &a in &resolved {
            full_dims[a] = 1;
        }
        let full_shape = Shape::new(full_dims);
        let out_shape = if keep_dims {
            full_shape.clone()
        } else {
            let kept: Vec<usize> = dims
                .iter()
                .enumerate()
                .filter(|(i, _)| !resolved.contains(i))
                .map(|(_, &d)| d)
                .collect();
            Shape::new(kept)
        };

        let mut acc = Tensor::<E>::zeros(full_shape.clone());
        let mut seen = vec![false; acc.size()];
        let in_strides = x.shape().strides();
        let acc_strides = broadcast_strides(&full_shape, x.shape());
        let mut w = IndexWalker::new(x.shape(), vec![&in_strides, &acc_strides]);
        if !w.is_done() {
            let xd = x.data();
            let ad = acc.data_mut();
            loop {
                let slot = w.offset(1);
                let first = !seen[slot];
                ad[slot] = fold(ad[slot], xd[w.offset(0)], first);
                seen[slot] = true;
                if !w.advance() {
                    break;
                }
            }
        }

        let acc = acc.into_shape(out_shape.as_slice().to_vec())?;
        let mut out = take_dst(op, &out_shape, dst)?;
        out.data_mut().copy_from_slice(acc.data());
        Ok(out)
    }
}

impl<E: Numeric> Engine<E> for CpuEngine {
    fn unary(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        f: &(dyn Fn(E) -> E + Sync),
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        self.map(ctx, "unary", x, f, dst)
    }

    fn add(
        &self,
        ctx: &RunContext,
        a: &Tensor<E>,
        b: &Tensor<E>,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        self.binary(ctx, "add", a, b, |x, y| x + y, dst)
    }

    fn sub(
        &self,
        ctx: &RunContext,
        a: &Tensor<E>,
        b: &Tensor<E>,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        self.binary(ctx, "sub", a, b, |x, y| x - y, dst)
    }

    fn mul(
        &self,
        ctx: &RunContext,
        a: &Tensor<E>,
        b: &Tensor<E>,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        self.binary(ctx, "mul", a, b, |x, y| x * y, dst)
    }

    fn div(
        &self,
        ctx: &RunContext,
        a: &Tensor<E>,
        b: &Tensor<E>,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        if !E::DTYPE.is_float() && b.iter().any(|v| v.is_zero()) {
            return Err(Error::DivisionByZero);
        }
        self.binary(ctx, "div", a, b, |x, y| x / y, dst)
    }

    fn pow(
        &self,
        ctx: &RunContext,
        a: &Tensor<E>,
        b: &Tensor<E>,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>
    where
        E: Real,
    {
        self.binary(ctx, "pow", a, b, |x, y| x.powf(y), dst)
    }

    fn add_scalar(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        s: E,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        self.map(ctx, "add_scalar", x, |v| v + s, dst)
    }

    fn mul_scalar(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        s: E,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        self.map(ctx, "mul_scalar", x, |v| v * s, dst)
    }

    fn div_scalar(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        s: E,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        if !E::DTYPE.is_float() && s.is_zero() {
            return Err(Error::DivisionByZero);
        }
        self.map(ctx, "div_scalar", x, |v| v / s, dst)
    }

    #[tracing::instrument(skip_all, name = "kernel_matmul")]
    fn matmul(
        &self,
        ctx: &RunContext,
        a: &Tensor<E>,
        b: &Tensor<E>,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let (ad, bd) = (a.dims(), b.dims());
        if ad.len() < 2 || bd.len() < 2 {
            return Err(Error::InvalidArgument(format!(
                "matmul operands must be at least rank 2, got {:?} and {:?}",
                ad, bd
            )));
        }
        let (m, ka) = (ad[ad.len() - 2], ad[ad.len() - 1]);
        let (kb, n) = (bd[bd.len() - 2], bd[bd.len() - 1]);
        if ka != kb {
            return Err(Error::shape_mismatch("matmul", ad, bd));
        }

        let a_batch = Shape::new(ad[..ad.len() - 2].to_vec());
        let b_batch = Shape::new(bd[..bd.len() - 2].to_vec());
        let batch = broadcast_shape("matmul", &a_batch, &b_batch)?;
        let mut out_dims = batch.as_slice().to_vec();
        out_dims.extend_from_slice(&[m, n]);
        let out_shape = Shape::new(out_dims);
        let mut out = take_dst("matmul", &out_shape, dst)?;

        // Batch strides are in units of whole matrices.
        let sa: Vec<usize> = broadcast_strides(&a_batch, &batch)
            .into_iter()
            .map(|s| s * m * ka)
            .collect();
        let sb: Vec<usize> = broadcast_strides(&b_batch, &batch)
            .into_iter()
            .map(|s| s * kb * n)
            .collect();

        let mut w = IndexWalker::new(&batch, vec![&sa, &sb]);
        if !w.is_done() && m * n > 0 {
            let od = out.data_mut();
            let mut pos = 0;
            loop {
                let a_mat = &a.data()[w.offset(0)..w.offset(0) + m * ka];
                let b_mat = &b.data()[w.offset(1)..w.offset(1) + kb * n];
                matmul_2d(a_mat, b_mat, ka, n, &mut od[pos..pos + m * n]);
                pos += m * n;
                if !w.advance() {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn transpose(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        perm: &[usize],
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let rank = x.rank();
        let mut seen = vec![false; rank];
        let valid = perm.len() == rank
            && perm.iter().all(|&p| {
                p < rank && !std::mem::replace(&mut seen[p.min(rank.saturating_sub(1))], true)
            });
        if !valid {
            return Err(Error::InvalidArgument(format!(
                "invalid permutation {:?} for rank {}",
                perm, rank
            )));
        }
        let dims = x.dims();
        let in_strides = x.shape().strides();
        let out_dims: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
        let mapped: Vec<usize> = perm.iter().map(|&p| in_strides[p]).collect();
        let out_shape = Shape::new(out_dims);
        let mut out = take_dst("transpose", &out_shape, dst)?;
        let mut w = IndexWalker::new(&out_shape, vec![&mapped]);
        if !w.is_done() {
            let xd = x.data();
            let od = out.data_mut();
            let mut pos = 0;
            loop {
                od[pos] = xd[w.offset(0)];
                pos += 1;
                if !w.advance() {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn reduce_sum(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        axes: &[isize],
        keep_dims: bool,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        self.reduce(ctx, "reduce_sum", x, axes, keep_dims, dst, |acc, v, _| acc + v)
    }

    fn reduce_mean(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        axes: &[isize],
        keep_dims: bool,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        let before = x.size();
        let summed = self.reduce(ctx, "reduce_mean", x, axes, keep_dims, dst, |acc, v, _| acc + v)?;
        let count = (before / summed.size().max(1)).max(1);
        let divisor = E::from_f64(count as f64);
        self.map(ctx, "reduce_mean", &summed, |v| v / divisor, Some(summed.clone()))
    }

    fn reduce_max(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        axes: &[isize],
        keep_dims: bool,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        self.reduce(ctx, "reduce_max", x, axes, keep_dims, dst, |acc, v, first| {
            if first || v > acc {
                v
            } else {
                acc
            }
        })
    }

    fn sqrt(&self, ctx: &RunContext, x: &Tensor<E>, dst: Option<Tensor<E>>) -> Result<Tensor<E>>
    where
        E: Real,
    {
        self.map(ctx, "sqrt", x, |v| v.sqrt(), dst)
    }

    fn rsqrt(&self, ctx: &RunContext, x: &Tensor<E>, dst: Option<Tensor<E>>) -> Result<Tensor<E>>
    where
        E: Real,
    {
        self.map(ctx, "rsqrt", x, |v| v.rsqrt(), dst)
    }

    fn exp(&self, ctx: &RunContext, x: &Tensor<E>, dst: Option<Tensor<E>>) -> Result<Tensor<E>>
    where
        E: Real,
    {
        self.map(ctx, "exp", x, |v| v.exp(), dst)
    }

    fn log(&self, ctx: &RunContext, x: &Tensor<E>, dst: Option<Tensor<E>>) -> Result<Tensor<E>>
    where
        E: Real,
    {
        self.map(ctx, "log", x, |v| v.ln(), dst)
    }

    fn reshape(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        shape: &[usize],
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let target = Shape::from(shape);
        if target.size() != x.size() {
            return Err(Error::shape_mismatch("reshape", x.dims(), shape));
        }
        let mut out = take_dst("reshape", &target, dst)?;
        out.data_mut().copy_from_slice(x.data());
        Ok(out)
    }

    fn repeat(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        axis: usize,
        target_len: usize,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let dims = x.dims();
        if axis >= dims.len() {
            return Err(Error::InvalidArgument(format!(
                "repeat axis {} out of bounds for rank {}",
                axis,
                dims.len()
            )));
        }
        let (outer, len, inner) = axis_blocks(dims, axis);
        if len != 1 && (len == 0 || target_len % len != 0) {
            return Err(Error::InvalidArgument(format!(
                "cannot repeat axis of length {} to {}",
                len, target_len
            )));
        }
        let mut out_dims = dims.to_vec();
        out_dims[axis] = target_len;
        let mut out = take_dst("repeat", &Shape::new(out_dims), dst)?;
        let xd = x.data();
        let od = out.data_mut();
        for o in 0..outer {
            for j in 0..target_len {
                let src = (o * len + j % len) * inner;
                let dst_off = (o * target_len + j) * inner;
                od[dst_off..dst_off + inner].copy_from_slice(&xd[src..src + inner]);
            }
        }
        Ok(out)
    }

    fn fill(
        &self,
        ctx: &RunContext,
        shape: &[usize],
        value: E,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let mut out = take_dst("fill", &Shape::from(shape), dst)?;
        out.fill(value);
        Ok(out)
    }

    fn concat(
        &self,
        ctx: &RunContext,
        parts: &[&Tensor<E>],
        axis: usize,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let first = parts
            .first()
            .ok_or_else(|| Error::InvalidArgument("concat of zero tensors".into()))?;
        let rank = first.rank();
        if axis >= rank {
            return Err(Error::InvalidArgument(format!(
                "concat axis {} out of bounds for rank {}",
                axis, rank
            )));
        }
        let mut axis_total = 0;
        for p in parts {
            if p.rank() != rank {
                return Err(Error::shape_mismatch("concat", first.dims(), p.dims()));
            }
            for (i, (&a, &b)) in first.dims().iter().zip(p.dims()).enumerate() {
                if i != axis && a != b {
                    return Err(Error::shape_mismatch("concat", first.dims(), p.dims()));
                }
            }
            axis_total += p.dims()[axis];
        }
        let mut out_dims = first.dims().to_vec();
        out_dims[axis] = axis_total;
        let mut out = take_dst("concat", &Shape::new(out_dims), dst)?;
        let inner: usize = first.dims()[axis + 1..].iter().product();
        let outer: usize = first.dims()[..axis].iter().product();
        let out_block = axis_total * inner;
        let od = out.data_mut();
        let mut cursor = 0;
        for p in parts {
            let block = p.dims()[axis] * inner;
            for o in 0..outer {
                od[o * out_block + cursor..o * out_block + cursor + block]
                    .copy_from_slice(&p.data()[o * block..(o + 1) * block]);
            }
            cursor += block;
        }
        Ok(out)
    }

    fn split(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        axis: usize,
        parts: usize,
    ) -> Result<Vec<Tensor<E>>> {
        ctx.checkpoint()?;
        let dims = x.dims();
        if axis >= dims.len() {
            return Err(Error::InvalidArgument(format!(
                "split axis {} out of bounds for rank {}",
                axis,
                dims.len()
            )));
        }
        if parts == 0 || dims[axis] % parts != 0 {
            return Err(Error::InvalidArgument(format!(
                "cannot split axis of length {} into {} parts",
                dims[axis], parts
            )));
        }
        let (outer, len, inner) = axis_blocks(dims, axis);
        let piece = len / parts;
        let mut out_dims = dims.to_vec();
        out_dims[axis] = piece;
        let mut result = Vec::with_capacity(parts);
        for p in 0..parts {
            let mut t = Tensor::<E>::zeros(out_dims.clone());
            let td = t.data_mut();
            for o in 0..outer {
                let src = (o * len + p * piece) * inner;
                let dst_off = o * piece * inner;
                td[dst_off..dst_off + piece * inner]
                    .copy_from_slice(&x.data()[src..src + piece * inner]);
            }
            result.push(t);
        }
        Ok(result)
    }

    #[tracing::instrument(skip_all, name = "kernel_gather")]
    fn gather(
        &self,
        ctx: &RunContext,
        params: &Tensor<E>,
        indices: &Tensor<E>,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let pdims = params.dims();
        if pdims.is_empty() {
            return Err(Error::InvalidArgument(
                "gather params must be at least rank 1".into(),
            ));
        }
        let vocab = pdims[0];
        let row: usize = pdims[1..].iter().product();
        let mut out_dims = indices.dims().to_vec();
        out_dims.extend_from_slice(&pdims[1..]);
        let mut out = take_dst("gather", &Shape::new(out_dims), dst)?;
        let od = out.data_mut();
        for (i, &iv) in indices.data().iter().enumerate() {
            let idx = index_value(iv);
            if idx < 0 || idx as usize >= vocab {
                return Err(Error::OutOfRange { index: idx, bound: vocab });
            }
            od[i * row..(i + 1) * row]
                .copy_from_slice(&params.data()[idx as usize * row..(idx as usize + 1) * row]);
        }
        Ok(out)
    }

    fn scatter_add(
        &self,
        ctx: &RunContext,
        target: &Tensor<E>,
        indices: &Tensor<E>,
        updates: &Tensor<E>,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>> {
        ctx.checkpoint()?;
        let tdims = target.dims();
        if tdims.is_empty() {
            return Err(Error::InvalidArgument(
                "scatter_add target must be at least rank 1".into(),
            ));
        }
        let vocab = tdims[0];
        let row: usize = tdims[1..].iter().product();
        let mut expect = indices.dims().to_vec();
        expect.extend_from_slice(&tdims[1..]);
        if updates.dims() != expect.as_slice() {
            return Err(Error::shape_mismatch("scatter_add", &expect, updates.dims()));
        }
        let mut out = take_dst("scatter_add", target.shape(), dst)?;
        out.data_mut().copy_from_slice(target.data());
        let od = out.data_mut();
        for (i, &iv) in indices.data().iter().enumerate() {
            let idx = index_value(iv);
            if idx < 0 || idx as usize >= vocab {
                return Err(Error::OutOfRange { index: idx, bound: vocab });
            }
            let base = idx as usize * row;
            for j in 0..row {
                od[base + j] = od[base + j] + updates.data()[i * row + j];
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext::new()
    }

    #[test]
    fn broadcast_add_rows() {
        let e = CpuEngine::new();
        let a = Tensor::<f32>::from_vec([2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap();
        let b = Tensor::<f32>::from_vec([3], vec![10., 20., 30.]).unwrap();
        let c = e.add(&ctx(), &a, &b, None).unwrap();
        assert_eq!(c.data(), &[11., 22., 33., 14., 25., 36.]);
    }

    #[test]
    fn matmul_2x3_3x2() {
        let e = CpuEngine::new();
        let a = Tensor::<f32>::from_vec([2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap();
        let b = Tensor::<f32>::from_vec([3, 2], vec![1., 2., 3., 4., 5., 6.]).unwrap();
        let c = e.matmul(&ctx(), &a, &b, None).unwrap();
        assert_eq!(c.dims(), &[2, 2]);
        assert_eq!(c.data(), &[22., 28., 49., 64.]);
    }

    #[test]
    fn matmul_broadcasts_batch_dims() {
        let e = CpuEngine::new();
        let a = Tensor::<f32>::from_vec([2, 1, 2], vec![1., 0., 0., 1.]).unwrap();
        let b = Tensor::<f32>::from_vec([2, 2], vec![1., 2., 3., 4.]).unwrap();
        let c = e.matmul(&ctx(), &a, &b, None).unwrap();
        assert_eq!(c.dims(), &[2, 1, 2]);
        assert_eq!(c.data(), &[1., 2., 3., 4.]);
    }

    #[test]
    fn integer_division_by_zero_detected() {
        let e = CpuEngine::new();
        let a = Tensor::<i32>::from_vec([2], vec![4, 6]).unwrap();
        let b = Tensor::<i32>::from_vec([2], vec![2, 0]).unwrap();
        assert!(matches!(
            e.div(&ctx(), &a, &b, None),
            Err(Error::DivisionByZero)
        ));
    }

    #[test]
    fn transpose_roundtrip() {
        let e = CpuEngine::new();
        let t = Tensor::<f32>::from_vec([2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap();
        let u = e.transpose(&ctx(), &t, &[1, 0], None).unwrap();
        assert_eq!(u.dims(), &[3, 2]);
        assert_eq!(u.data(), &[1., 4., 2., 5., 3., 6.]);
        let back = e.transpose(&ctx(), &u, &[1, 0], None).unwrap();
        assert_eq!(back.data(), t.data());
    }

    #[test]
    fn reduce_sum_axis_with_and_without_keep() {
        let e = CpuEngine::new();
        let t = Tensor::<f32>::from_vec([2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap();
        let s = e.reduce_sum(&ctx(), &t, &[1], true, None).unwrap();
        assert_eq!(s.dims(), &[2, 1]);
        assert_eq!(s.data(), &[6., 15.]);
        let s = e.reduce_sum(&ctx(), &t, &[-1], false, None).unwrap();
        assert_eq!(s.dims(), &[2]);
        let all = e.reduce_sum(&ctx(), &t, &[], false, None).unwrap();
        assert_eq!(all.rank(), 0);
        assert_eq!(all.data(), &[21.]);
    }

    #[test]
    fn reduce_mean_and_max() {
        let e = CpuEngine::new();
        let t = Tensor::<f32>::from_vec([2, 2], vec![1., 3., 5., 7.]).unwrap();
        let m = e.reduce_mean(&ctx(), &t, &[1], true, None).unwrap();
        assert_eq!(m.data(), &[2., 6.]);
        let mx = e.reduce_max(&ctx(), &t, &[0], false, None).unwrap();
        assert_eq!(mx.data(), &[5., 7.]);
    }

    #[test]
    fn gather_rows() {
        let e = CpuEngine::new();
        let params = Tensor::<f32>::from_vec([3, 2], vec![1., 2., 3., 4., 5., 6.]).unwrap();
        let idx = Tensor::<f32>::from_vec([2], vec![2., 0.]).unwrap();
        let g = e.gather(&ctx(), &params, &idx, None).unwrap();
        assert_eq!(g.dims(), &[2, 2]);
        assert_eq!(g.data(), &[5., 6., 1., 2.]);

        let bad = Tensor::<f32>::from_vec([1], vec![3.]).unwrap();
        assert!(matches!(
            e.gather(&ctx(), &params, &bad, None),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn scatter_add_accumulates() {
        let e = CpuEngine::new();
        let target = Tensor::<f32>::zeros([3, 2]);
        let idx = Tensor::<f32>::from_vec([2], vec![1., 1.]).unwrap();
        let upd = Tensor::<f32>::from_vec([2, 2], vec![1., 2., 10., 20.]).unwrap();
        let out = e.scatter_add(&ctx(), &target, &idx, &upd, None).unwrap();
        assert_eq!(out.data(), &[0., 0., 11., 22., 0., 0.]);
    }

    #[test]
    fn split_and_concat_inverse() {
        let e = CpuEngine::new();
        let t = Tensor::<f32>::from_vec([2, 4], vec![1., 2., 3., 4., 5., 6., 7., 8.]).unwrap();
        let halves = e.split(&ctx(), &t, 1, 2).unwrap();
        assert_eq!(halves[0].data(), &[1., 2., 5., 6.]);
        assert_eq!(halves[1].data(), &[3., 4., 7., 8.]);
        let joined = e
            .concat(&ctx(), &[&halves[0], &halves[1]], 1, None)
            .unwrap();
        assert_eq!(joined.data(), t.data());

        assert!(e.split(&ctx(), &t, 1, 3).is_err());
    }

    #[test]
    fn repeat_axis() {
        let e = CpuEngine::new();
        let t = Tensor::<f32>::from_vec([1, 2], vec![1., 2.]).unwrap();
        let r = e.repeat(&ctx(), &t, 0, 3, None).unwrap();
        assert_eq!(r.dims(), &[3, 2]);
        assert_eq!(r.data(), &[1., 2., 1., 2., 1., 2.]);
    }

    #[test]
    fn destination_shape_is_verified() {
        let e = CpuEngine::new();
        let a = Tensor::<f32>::from_vec([2], vec![1., 2.]).unwrap();
        let wrong = Tensor::<f32>::zeros([3]);
        assert!(e.add(&ctx(), &a, &a, Some(wrong)).is_err());
        let right = Tensor::<f32>::zeros([2]);
        let out = e.add(&ctx(), &a, &a, Some(right)).unwrap();
        assert_eq!(out.data(), &[2., 4.]);
    }

    #[test]
    fn cancelled_context_stops_kernels() {
        let e = CpuEngine::new();
        let c = RunContext::new();
        c.cancel();
        let a = Tensor::<f32>::zeros([2]);
        assert!(matches!(e.add(&c, &a, &a, None), Err(Error::Cancelled)));
    }
}
