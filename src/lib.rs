//! gradix: a graph-based neural-network runtime.
//!
//! A `Builder` accumulates operator nodes into a DAG, `Graph::forward` runs
//! a memoized pass over the topological order, and `Graph::backward`
//! distributes gradients in reverse, accumulating at fanout joins and into
//! parameter accumulators. Kernels live behind the `Engine` trait with a
//! CPU reference implementation; pretrained models arrive through the MXF
//! codec and an operator registry.

pub mod engine;
pub mod errors;
pub mod graph;
pub mod init;
pub mod layers;
pub mod logging;
pub mod mxf;
pub mod numeric;
pub mod parameter;
pub mod registry;
pub mod tensor;
pub mod types;

pub use engine::{CpuEngine, Engine};
pub use errors::{Error, Result};
pub use graph::{Builder, Graph, Node};
pub use numeric::{Numeric, Real};
pub use parameter::Parameter;
pub use registry::OpRegistry;
pub use tensor::Tensor;
pub use types::{Attribute, BackwardMode, DType, NodeId, RunContext, Shape};
