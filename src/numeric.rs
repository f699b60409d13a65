//! Element-type traits the tensor and engine layers are generic over.
//!
//! `Numeric` covers every storable element type; `Real` adds the
//! transcendental operations the normalization and attention layers need.
//! Integer types satisfy only `Numeric`, so operators that require
//! `sqrt`/`exp`/`log` constrain their element type to `Real`.

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Sub};

use half::{bf16, f16};
use num_traits::{Float, One, Zero};

use crate::types::DType;

pub trait Numeric:
    Copy
    + Default
    + Debug
    + PartialOrd
    + Send
    + Sync
    + 'static
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
{
    const DTYPE: DType;

    fn from_f64(v: f64) -> Self;
    fn as_f64(self) -> f64;

    /// Accumulator addition. Floats add normally; integers wrap on overflow.
    fn wrapping_add(self, rhs: Self) -> Self;
}

/// Floating-point element types. `sqrt`/`exp`/`ln`/`powf`/`tanh` come from
/// `num_traits::Float`, which `half` implements for `f16`/`bf16`.
pub trait Real: Numeric + Float {
    fn rsqrt(self) -> Self {
        Self::one() / self.sqrt()
    }
}

macro_rules! numeric_float {
    ($t:ty, $dtype:expr, $from:expr, $to:expr) => {
        impl Numeric for $t {
            const DTYPE: DType = $dtype;

            fn from_f64(v: f64) -> Self {
                $from(v)
            }

            fn as_f64(self) -> f64 {
                $to(self)
            }

            fn wrapping_add(self, rhs: Self) -> Self {
                self + rhs
            }
        }

        impl Real for $t {}
    };
}

numeric_float!(f32, DType::Float32, |v| v as f32, |s| s as f64);
numeric_float!(f64, DType::Float64, |v| v, |s| s);
numeric_float!(f16, DType::Float16, f16::from_f64, |s: f16| s.to_f64());
numeric_float!(bf16, DType::BFloat16, bf16::from_f64, |s: bf16| s.to_f64());

macro_rules! numeric_int {
    ($t:ty, $dtype:expr) => {
        impl Numeric for $t {
            const DTYPE: DType = $dtype;

            fn from_f64(v: f64) -> Self {
                v as $t
            }

            fn as_f64(self) -> f64 {
                self as f64
            }

            fn wrapping_add(self, rhs: Self) -> Self {
                <$t>::wrapping_add(self, rhs)
            }
        }
    };
}

numeric_int!(i8, DType::Int8);
numeric_int!(i32, DType::Int32);
numeric_int!(i64, DType::Int64);
numeric_int!(u32, DType::Uint32);
numeric_int!(u64, DType::Uint64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_round_trips() {
        assert_eq!(f32::from_f64(1.5).as_f64(), 1.5);
        assert_eq!(f16::from_f64(0.5).as_f64(), 0.5);
        assert_eq!(bf16::from_f64(2.0).as_f64(), 2.0);
    }

    #[test]
    fn half_conversion_rounds_to_nearest_even() {
        // 2049 is not representable in f16; nearest even mantissa is 2048.
        let v = f16::from_f64(2049.0);
        assert_eq!(v.to_f64(), 2048.0);
    }

    #[test]
    fn integer_accumulation_wraps() {
        assert_eq!(Numeric::wrapping_add(i8::MAX, 1i8), i8::MIN);
        assert_eq!(Numeric::wrapping_add(3i32, 4), 7);
    }

    #[test]
    fn rsqrt_matches_inverse_sqrt() {
        let v: f32 = 4.0;
        assert!((v.rsqrt() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn dtype_tags() {
        assert_eq!(<f32 as Numeric>::DTYPE, DType::Float32);
        assert_eq!(<bf16 as Numeric>::DTYPE, DType::BFloat16);
        assert_eq!(<i8 as Numeric>::DTYPE, DType::Int8);
    }
}
