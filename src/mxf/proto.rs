//! Protobuf schema of the MXF model-exchange format, expressed as
//! hand-annotated prost messages (no build-script codegen).
//!
//! Tensor payloads are little-endian with row-major element order; shape
//! dimensions run outermost first.

use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Model {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(message, optional, tag = "2")]
    pub graph: Option<GraphProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub inputs: Vec<ValueInfo>,
    #[prost(message, repeated, tag = "2")]
    pub outputs: Vec<ValueInfo>,
    #[prost(message, repeated, tag = "3")]
    pub nodes: Vec<NodeProto>,
    #[prost(map = "string, message", tag = "4")]
    pub parameters: HashMap<String, TensorProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValueInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "DataType", tag = "2")]
    pub dtype: i32,
    #[prost(int64, repeated, tag = "3")]
    pub shape: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub op_type: String,
    #[prost(string, repeated, tag = "3")]
    pub inputs: Vec<String>,
    #[prost(map = "string, message", tag = "4")]
    pub attributes: HashMap<String, AttributeProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    pub shape: Vec<i64>,
    #[prost(enumeration = "DataType", tag = "2")]
    pub dtype: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttributeProto {
    #[prost(oneof = "attribute_proto::Value", tags = "1, 2, 3, 4, 5, 6")]
    pub value: Option<attribute_proto::Value>,
}

pub mod attribute_proto {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(float, tag = "1")]
        F(f32),
        #[prost(int64, tag = "2")]
        I(i64),
        #[prost(bytes, tag = "3")]
        S(Vec<u8>),
        #[prost(message, tag = "4")]
        Floats(super::FloatList),
        #[prost(message, tag = "5")]
        Ints(super::IntList),
        #[prost(message, tag = "6")]
        Strings(super::StringList),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FloatList {
    #[prost(float, repeated, tag = "1")]
    pub values: Vec<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IntList {
    #[prost(int64, repeated, tag = "1")]
    pub values: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringList {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DataType {
    Float32 = 0,
    Float64 = 1,
    Float16 = 2,
    Bfloat16 = 3,
    Int8 = 4,
    Int32 = 5,
    Int64 = 6,
}
