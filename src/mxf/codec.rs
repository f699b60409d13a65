//! Byte-level tensor and attribute codec for the MXF format. All payloads
//! are little-endian; float destinations narrow with round-to-nearest-even.

use std::collections::HashMap;

use half::{bf16, f16};
use prost::Message;

use crate::errors::{Error, Result};
use crate::mxf::proto::{attribute_proto, AttributeProto, DataType, FloatList, IntList, Model, StringList, TensorProto};
use crate::numeric::Numeric;
use crate::tensor::Tensor;
use crate::types::{AttrMap, Attribute, DType};

pub fn decode_model(bytes: &[u8]) -> Result<Model> {
    Ok(Model::decode(bytes)?)
}

pub fn encode_model(model: &Model) -> Vec<u8> {
    model.encode_to_vec()
}

pub(crate) fn dtype_of(proto: DataType) -> DType {
    match proto {
        DataType::Float32 => DType::Float32,
        DataType::Float64 => DType::Float64,
        DataType::Float16 => DType::Float16,
        DataType::Bfloat16 => DType::BFloat16,
        DataType::Int8 => DType::Int8,
        DataType::Int32 => DType::Int32,
        DataType::Int64 => DType::Int64,
    }
}

fn wire_dtype(proto: &TensorProto, name: &str) -> Result<DataType> {
    DataType::try_from(proto.dtype).map_err(|_| {
        Error::InvalidArgument(format!("tensor {:?} carries unknown dtype {}", name, proto.dtype))
    })
}

fn checked_dims(proto: &TensorProto, name: &str) -> Result<Vec<usize>> {
    let mut dims = Vec::with_capacity(proto.shape.len());
    for &d in &proto.shape {
        if d < 0 {
            return Err(Error::InvalidArgument(format!(
                "tensor {:?} has negative dimension {}",
                name, d
            )));
        }
        dims.push(d as usize);
    }
    Ok(dims)
}

fn check_payload(proto: &TensorProto, name: &str, size: usize, width: usize) -> Result<()> {
    if proto.data.len() != size * width {
        return Err(Error::CorruptTensor {
            name: name.to_string(),
            expected: size * width,
            got: proto.data.len(),
        });
    }
    Ok(())
}

/// Decodes a tensor payload into element type `E`. Cross-type conversions go
/// through `f64`; float sources cannot land in integer destinations.
pub fn decode_tensor<E: Numeric>(name: &str, proto: &TensorProto) -> Result<Tensor<E>> {
    let wire = wire_dtype(proto, name)?;
    let src = dtype_of(wire);
    if src.is_float() && !E::DTYPE.is_float() {
        return Err(Error::UnsupportedConversion { from: src, to: E::DTYPE });
    }
    let dims = checked_dims(proto, name)?;
    let size: usize = dims.iter().product();
    check_payload(proto, name, size, src.byte_width())?;

    let bytes = &proto.data;
    let mut data = Vec::with_capacity(size);
    match wire {
        DataType::Float32 => {
            for c in bytes.chunks_exact(4) {
                data.push(E::from_f64(f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64));
            }
        }
        DataType::Float64 => {
            for c in bytes.chunks_exact(8) {
                data.push(E::from_f64(f64::from_le_bytes([
                    c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                ])));
            }
        }
        DataType::Float16 => {
            for c in bytes.chunks_exact(2) {
                data.push(E::from_f64(f16::from_le_bytes([c[0], c[1]]).to_f64()));
            }
        }
        DataType::Bfloat16 => {
            for c in bytes.chunks_exact(2) {
                data.push(E::from_f64(bf16::from_le_bytes([c[0], c[1]]).to_f64()));
            }
        }
        DataType::Int8 => {
            for &b in bytes.iter() {
                data.push(E::from_f64(b as i8 as f64));
            }
        }
        DataType::Int32 => {
            for c in bytes.chunks_exact(4) {
                data.push(E::from_f64(
                    i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64
                ));
            }
        }
        DataType::Int64 => {
            for c in bytes.chunks_exact(8) {
                data.push(E::from_f64(i64::from_le_bytes([
                    c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                ]) as f64));
            }
        }
    }
    Tensor::from_vec(dims, data)
}

/// Integer payload read out as plain values, used for shape constants.
pub fn decode_int_values(name: &str, proto: &TensorProto) -> Result<Vec<i64>> {
    let wire = wire_dtype(proto, name)?;
    let dims = checked_dims(proto, name)?;
    let size: usize = dims.iter().product();
    let src = dtype_of(wire);
    check_payload(proto, name, size, src.byte_width())?;
    let bytes = &proto.data;
    let mut out = Vec::with_capacity(size);
    match wire {
        DataType::Int8 => {
            for &b in bytes.iter() {
                out.push(b as i8 as i64);
            }
        }
        DataType::Int32 => {
            for c in bytes.chunks_exact(4) {
                out.push(i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64);
            }
        }
        DataType::Int64 => {
            for c in bytes.chunks_exact(8) {
                out.push(i64::from_le_bytes([
                    c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                ]));
            }
        }
        other => {
            return Err(Error::UnsupportedConversion {
                from: dtype_of(other),
                to: DType::Int64,
            })
        }
    }
    Ok(out)
}

/// Encodes a tensor with the wire dtype chosen by the element type.
pub fn encode_tensor<E: Numeric>(t: &Tensor<E>) -> Result<TensorProto> {
    let (wire, width) = match E::DTYPE {
        DType::Float32 => (DataType::Float32, 4),
        DType::Float64 => (DataType::Float64, 8),
        DType::Float16 => (DataType::Float16, 2),
        DType::BFloat16 => (DataType::Bfloat16, 2),
        DType::Int8 => (DataType::Int8, 1),
        DType::Int32 => (DataType::Int32, 4),
        DType::Int64 => (DataType::Int64, 8),
        other => {
            return Err(Error::UnsupportedConversion { from: other, to: other });
        }
    };
    let mut data = Vec::with_capacity(t.size() * width);
    for &v in t.data() {
        match wire {
            DataType::Float32 => data.extend_from_slice(&(v.as_f64() as f32).to_le_bytes()),
            DataType::Float64 => data.extend_from_slice(&v.as_f64().to_le_bytes()),
            DataType::Float16 => data.extend_from_slice(&f16::from_f64(v.as_f64()).to_le_bytes()),
            DataType::Bfloat16 => data.extend_from_slice(&bf16::from_f64(v.as_f64()).to_le_bytes()),
            DataType::Int8 => data.push(v.as_f64() as i8 as u8),
            DataType::Int32 => data.extend_from_slice(&(v.as_f64() as i32).to_le_bytes()),
            DataType::Int64 => data.extend_from_slice(&(v.as_f64() as i64).to_le_bytes()),
        }
    }
    Ok(TensorProto {
        shape: t.dims().iter().map(|&d| d as i64).collect(),
        dtype: wire as i32,
        data,
    })
}

/// Converts one wire attribute to the uniform in-memory variant.
pub fn attribute_from_proto(name: &str, proto: &AttributeProto) -> Result<Attribute> {
    let value = proto.value.as_ref().ok_or_else(|| {
        Error::InvalidArgument(format!("attribute {:?} carries no value", name))
    })?;
    Ok(match value {
        attribute_proto::Value::F(v) => Attribute::Float(*v),
        attribute_proto::Value::I(v) => Attribute::Int(*v),
        attribute_proto::Value::S(bytes) => match String::from_utf8(bytes.clone()) {
            Ok(s) => Attribute::Str(s),
            Err(e) => Attribute::Bytes(e.into_bytes()),
        },
        attribute_proto::Value::Floats(list) => Attribute::Floats(list.values.clone()),
        attribute_proto::Value::Ints(list) => Attribute::Ints(list.values.clone()),
        attribute_proto::Value::Strings(list) => Attribute::Strings(list.values.clone()),
    })
}

/// Writes an attribute using the narrowest matching wire variant.
pub fn attribute_to_proto(attr: &Attribute) -> AttributeProto {
    let value = match attr {
        Attribute::Float(v) => attribute_proto::Value::F(*v),
        Attribute::Int(v) => attribute_proto::Value::I(*v),
        Attribute::Str(s) => attribute_proto::Value::S(s.clone().into_bytes()),
        Attribute::Bytes(b) => attribute_proto::Value::S(b.clone()),
        Attribute::Floats(v) => attribute_proto::Value::Floats(FloatList { values: v.clone() }),
        Attribute::Ints(v) => attribute_proto::Value::Ints(IntList { values: v.clone() }),
        Attribute::Strings(v) => {
            attribute_proto::Value::Strings(StringList { values: v.clone() })
        }
    };
    AttributeProto { value: Some(value) }
}

pub fn attrs_from_protos(protos: &HashMap<String, AttributeProto>) -> Result<AttrMap> {
    let mut attrs = AttrMap::new();
    for (k, v) in protos {
        attrs.insert(k.clone(), attribute_from_proto(k, v)?);
    }
    Ok(attrs)
}
