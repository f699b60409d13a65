use std::sync::{Mutex, MutexGuard};

use crate::errors::{Error, Result};
use crate::numeric::Numeric;
use crate::tensor::Tensor;

/// A named trainable tensor paired with a same-shape gradient accumulator.
///
/// The accumulator sits behind a mutex so the node tree stays `Sync`; the
/// serial topological walk guarantees at most one writer at a time. Integer
/// accumulation wraps on overflow.
#[derive(Debug)]
pub struct Parameter<E: Numeric> {
    name: String,
    value: Tensor<E>,
    gradient: Mutex<Tensor<E>>,
}

impl<E: Numeric> Parameter<E> {
    pub fn new(name: impl Into<String>, value: Tensor<E>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument("parameter name is empty".into()));
        }
        let gradient = Mutex::new(Tensor::zeros(value.shape().clone()));
        Ok(Parameter { name, value, gradient })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor<E> {
        &self.value
    }

    pub fn gradient(&self) -> MutexGuard<'_, Tensor<E>> {
        self.gradient.lock().expect("parameter gradient lock poisoned")
    }

    /// Element-wise addition into the accumulator; requires shape equality.
    pub fn add_gradient(&self, g: &Tensor<E>) -> Result<()> {
        let mut grad = self.gradient();
        if !grad.shape_equals(g) {
            return Err(Error::shape_mismatch(
                "add_gradient",
                grad.dims(),
                g.dims(),
            ));
        }
        for (acc, &v) in grad.data_mut().iter_mut().zip(g.data()) {
            *acc = acc.wrapping_add(v);
        }
        Ok(())
    }

    /// Resets the accumulator to zeros.
    pub fn clear_gradient(&self) {
        self.gradient().fill(E::zero());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_rejected() {
        assert!(Parameter::<f32>::new("", Tensor::zeros([2])).is_err());
    }

    #[test]
    fn gradient_matches_value_shape() {
        let p = Parameter::<f32>::new("w", Tensor::zeros([2, 3])).unwrap();
        assert_eq!(p.gradient().dims(), &[2, 3]);
    }

    #[test]
    fn accumulate_and_clear() {
        let p = Parameter::<f32>::new("w", Tensor::zeros([2])).unwrap();
        let g = Tensor::from_vec([2], vec![1.0, 2.0]).unwrap();
        p.add_gradient(&g).unwrap();
        p.add_gradient(&g).unwrap();
        assert_eq!(p.gradient().data(), &[2.0, 4.0]);
        p.clear_gradient();
        assert_eq!(p.gradient().data(), &[0.0, 0.0]);

        let wrong = Tensor::<f32>::zeros([3]);
        assert!(p.add_gradient(&wrong).is_err());
    }
}
