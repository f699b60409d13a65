use thiserror::Error;

use crate::types::DType;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{op}: incompatible shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch { op: String, lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("{op}: expected {expected} inputs, got {got}")]
    InvalidInputCount { op: String, expected: usize, got: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("index {index} out of range for dimension of length {bound}")]
    OutOfRange { index: i64, bound: usize },
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("unsupported conversion from {from:?} to {to:?}")]
    UnsupportedConversion { from: DType, to: DType },
    #[error("corrupt tensor {name:?}: expected {expected} data bytes, got {got}")]
    CorruptTensor { name: String, expected: usize, got: usize },
    #[error("unknown operator type {0:?}")]
    UnknownOperator(String),
    #[error("node {node:?}: input {input:?} cannot be resolved")]
    UnresolvedInput { node: String, input: String },
    #[error("graph contains a cycle through node {0:?}")]
    GraphCycle(String),
    #[error("cancelled")]
    Cancelled,
    #[error("model decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape_mismatch(op: &str, lhs: &[usize], rhs: &[usize]) -> Self {
        Error::ShapeMismatch { op: op.to_string(), lhs: lhs.to_vec(), rhs: rhs.to_vec() }
    }

    pub(crate) fn input_count(op: &str, expected: usize, got: usize) -> Self {
        Error::InvalidInputCount { op: op.to_string(), expected, got }
    }
}
