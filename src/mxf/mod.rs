//! MXF: the binary model-exchange format. `proto` carries the protobuf
//! schema, `codec` the byte-level tensor and attribute conversions, and
//! `loader` the graph reconstruction.

pub mod codec;
pub mod loader;
pub mod proto;

pub use codec::{
    attribute_from_proto, attribute_to_proto, attrs_from_protos, decode_model, decode_tensor,
    encode_model, encode_tensor,
};
pub use loader::{build_graph, load_model};
