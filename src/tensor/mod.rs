pub mod broadcast;

use crate::errors::{Error, Result};
use crate::numeric::Numeric;
use crate::types::Shape;

/// An n-dimensional array: contiguous row-major storage plus its shape.
/// Mutation happens through engine kernels; the tensor itself only offers
/// structural operations.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor<E> {
    data: Vec<E>,
    shape: Shape,
}

impl<E: Numeric> Tensor<E> {
    /// Zero-filled tensor of the given shape.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Tensor {
            data: vec![E::zero(); shape.size()],
            shape,
        }
    }

    /// Tensor from existing row-major data. Fails `ShapeMismatch` when the
    /// data length does not match the shape's element count.
    pub fn from_vec(shape: impl Into<Shape>, data: Vec<E>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.size() {
            return Err(Error::shape_mismatch(
                "tensor_from_vec",
                shape.as_slice(),
                &[data.len()],
            ));
        }
        Ok(Tensor { data, shape })
    }

    /// Rank-0 tensor holding a single value.
    pub fn scalar(value: E) -> Self {
        Tensor {
            data: vec![value],
            shape: Shape::scalar(),
        }
    }

    pub fn filled(shape: impl Into<Shape>, value: E) -> Self {
        let shape = shape.into();
        Tensor {
            data: vec![value; shape.size()],
            shape,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.as_slice()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn size(&self) -> usize {
        self.shape.size()
    }

    pub fn data(&self) -> &[E] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [E] {
        &mut self.data
    }

    /// Element at a flat row-major index.
    pub fn at(&self, flat: usize) -> E {
        self.data[flat]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.data.iter()
    }

    pub fn shape_equals(&self, other: &Tensor<E>) -> bool {
        self.shape == other.shape
    }

    /// Same-size shape change; element order is preserved.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor<E>> {
        let shape = shape.into();
        if shape.size() != self.size() {
            return Err(Error::shape_mismatch(
                "reshape",
                self.dims(),
                shape.as_slice(),
            ));
        }
        Ok(Tensor {
            data: self.data.clone(),
            shape,
        })
    }

    /// Consuming variant of `reshape`.
    pub fn into_shape(self, shape: impl Into<Shape>) -> Result<Tensor<E>> {
        let shape = shape.into();
        if shape.size() != self.data.len() {
            return Err(Error::shape_mismatch(
                "reshape",
                self.shape.as_slice(),
                shape.as_slice(),
            ));
        }
        Ok(Tensor {
            data: self.data,
            shape,
        })
    }

    pub fn fill(&mut self, value: E) {
        for v in &mut self.data {
            *v = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_validates_length() {
        let t = Tensor::<f32>::from_vec([2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap();
        assert_eq!(t.size(), 6);
        assert_eq!(t.dims(), &[2, 3]);
        assert!(Tensor::<f32>::from_vec([2, 3], vec![1., 2.]).is_err());
    }

    #[test]
    fn zero_dim_shape_is_single_element() {
        let t = Tensor::<f32>::scalar(7.0);
        assert_eq!(t.rank(), 0);
        assert_eq!(t.size(), 1);
        assert_eq!(t.at(0), 7.0);
    }

    #[test]
    fn reshape_preserves_element_order() {
        let t = Tensor::<i32>::from_vec([2, 3], vec![1, 2, 3, 4, 5, 6]).unwrap();
        let u = t.reshape([3, 2]).unwrap();
        assert_eq!(u.data(), t.data());
        assert!(t.reshape([4]).is_err());
    }

    #[test]
    fn zeros_and_fill() {
        let mut t = Tensor::<f64>::zeros([2, 2]);
        assert!(t.iter().all(|&v| v == 0.0));
        t.fill(3.0);
        assert!(t.iter().all(|&v| v == 3.0));
    }
}
