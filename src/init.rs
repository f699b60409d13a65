//! Parameter initialization for layers constructed fresh rather than loaded
//! from a model file.

use rand::Rng;

use crate::numeric::Real;
use crate::tensor::Tensor;
use crate::types::Shape;

/// Uniform samples in `[lo, hi)`.
pub fn uniform<E: Real>(shape: impl Into<Shape>, lo: f64, hi: f64) -> Tensor<E> {
    let shape = shape.into();
    let mut rng = rand::thread_rng();
    let data = (0..shape.size())
        .map(|_| E::from_f64(rng.gen_range(lo..hi)))
        .collect();
    Tensor::from_vec(shape, data).expect("generated data matches shape")
}

/// Xavier/Glorot uniform initialization over the given fan dimensions.
pub fn xavier<E: Real>(shape: impl Into<Shape>, fan_in: usize, fan_out: usize) -> Tensor<E> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    uniform(shape, -limit, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_respects_bounds() {
        let t = uniform::<f32>([100], -0.5, 0.5);
        assert!(t.iter().all(|&v| (-0.5..0.5).contains(&v)));
    }

    #[test]
    fn xavier_limit_shrinks_with_fan() {
        let wide = xavier::<f32>([10, 1000], 10, 1000);
        let limit = (6.0f32 / 1010.0).sqrt();
        assert!(wide.iter().all(|&v| v.abs() <= limit + 1e-6));
    }
}
