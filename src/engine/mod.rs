//! Kernel dispatch layer. An `Engine` is a bundle of tensor kernels behind a
//! trait so the execution substrate can be swapped; the crate ships a
//! single-threaded CPU reference implementation. Alternative engines must
//! preserve observable outputs up to floating-point rounding.

pub mod cpu;

pub use cpu::CpuEngine;

use crate::errors::Result;
use crate::numeric::{Numeric, Real};
use crate::tensor::Tensor;
use crate::types::RunContext;

/// Kernel bundle parameterized by element type.
///
/// Every kernel takes the run context (checked for cancellation at entry),
/// its operand tensors, and an optional destination. When a destination is
/// supplied the engine verifies its shape and writes into it, returning that
/// same tensor; otherwise it allocates the output.
///
/// Kernels requiring transcendental arithmetic constrain the element type to
/// `Real`; integer element types satisfy the remainder.
pub trait Engine<E: Numeric>: Send + Sync {
    /// Element-wise map `f(v) -> v`. Output shape equals the input shape.
    fn unary(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        f: &(dyn Fn(E) -> E + Sync),
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;

    fn add(&self, ctx: &RunContext, a: &Tensor<E>, b: &Tensor<E>, dst: Option<Tensor<E>>)
        -> Result<Tensor<E>>;
    fn sub(&self, ctx: &RunContext, a: &Tensor<E>, b: &Tensor<E>, dst: Option<Tensor<E>>)
        -> Result<Tensor<E>>;
    fn mul(&self, ctx: &RunContext, a: &Tensor<E>, b: &Tensor<E>, dst: Option<Tensor<E>>)
        -> Result<Tensor<E>>;
    /// Broadcast divide. Fails `DivisionByZero` for a zero divisor element
    /// when the element type is an integer.
    fn div(&self, ctx: &RunContext, a: &Tensor<E>, b: &Tensor<E>, dst: Option<Tensor<E>>)
        -> Result<Tensor<E>>;
    fn pow(&self, ctx: &RunContext, a: &Tensor<E>, b: &Tensor<E>, dst: Option<Tensor<E>>)
        -> Result<Tensor<E>>
    where
        E: Real;

    fn add_scalar(&self, ctx: &RunContext, x: &Tensor<E>, s: E, dst: Option<Tensor<E>>)
        -> Result<Tensor<E>>;
    fn mul_scalar(&self, ctx: &RunContext, x: &Tensor<E>, s: E, dst: Option<Tensor<E>>)
        -> Result<Tensor<E>>;
    fn div_scalar(&self, ctx: &RunContext, x: &Tensor<E>, s: E, dst: Option<Tensor<E>>)
        -> Result<Tensor<E>>;

    /// Batched matrix product `[..., M, K] x [..., K, N] -> [..., M, N]`,
    /// leading dimensions broadcast.
    fn matmul(&self, ctx: &RunContext, a: &Tensor<E>, b: &Tensor<E>, dst: Option<Tensor<E>>)
        -> Result<Tensor<E>>;

    /// Reorders axes by a permutation of `0..rank`.
    fn transpose(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        perm: &[usize],
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;

    /// Sum along `axes`; negatives count from the back, an empty list means
    /// all axes. `keep_dims` retains reduced axes as length 1.
    fn reduce_sum(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        axes: &[isize],
        keep_dims: bool,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;
    fn reduce_mean(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        axes: &[isize],
        keep_dims: bool,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;
    fn reduce_max(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        axes: &[isize],
        keep_dims: bool,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;

    fn sqrt(&self, ctx: &RunContext, x: &Tensor<E>, dst: Option<Tensor<E>>) -> Result<Tensor<E>>
    where
        E: Real;
    fn rsqrt(&self, ctx: &RunContext, x: &Tensor<E>, dst: Option<Tensor<E>>) -> Result<Tensor<E>>
    where
        E: Real;
    fn exp(&self, ctx: &RunContext, x: &Tensor<E>, dst: Option<Tensor<E>>) -> Result<Tensor<E>>
    where
        E: Real;
    fn log(&self, ctx: &RunContext, x: &Tensor<E>, dst: Option<Tensor<E>>) -> Result<Tensor<E>>
    where
        E: Real;

    /// Same-size shape change.
    fn reshape(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        shape: &[usize],
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;

    /// Replicates along `axis` to `target_len`. The axis length must be 1 or
    /// divide the target length.
    fn repeat(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        axis: usize,
        target_len: usize,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;

    /// Allocates (or reuses `dst`) a tensor of `shape` filled with `value`.
    fn fill(
        &self,
        ctx: &RunContext,
        shape: &[usize],
        value: E,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;

    fn concat(
        &self,
        ctx: &RunContext,
        parts: &[&Tensor<E>],
        axis: usize,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;

    /// Splits into `parts` equal pieces along `axis`; fails
    /// `InvalidArgument` when the axis length is not evenly divisible.
    fn split(
        &self,
        ctx: &RunContext,
        x: &Tensor<E>,
        axis: usize,
        parts: usize,
    ) -> Result<Vec<Tensor<E>>>;

    /// `params: [V, ...P]`, `indices: I` -> `I ++ P`, reading rows of
    /// `params` selected by `indices`. Fails `OutOfRange` for an index
    /// outside `[0, V)`.
    fn gather(
        &self,
        ctx: &RunContext,
        params: &Tensor<E>,
        indices: &Tensor<E>,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;

    /// Inverse contract of `gather`: accumulates `updates` rows into a copy
    /// of `target` at the positions named by `indices`.
    fn scatter_add(
        &self,
        ctx: &RunContext,
        target: &Tensor<E>,
        indices: &Tensor<E>,
        updates: &Tensor<E>,
        dst: Option<Tensor<E>>,
    ) -> Result<Tensor<E>>;
}
