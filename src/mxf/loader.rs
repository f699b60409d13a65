//! Rebuilds an executable graph from an MXF model: decodes parameters,
//! constructs nodes through the operator registry, and resolves dependency
//! names through the exporter's naming conventions (output suffixes, layer
//! tags, parameter promotion, transposed-parameter fallback).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::engine::Engine;
use crate::errors::{Error, Result};
use crate::graph::node::{Node, ParamNode};
use crate::graph::{Builder, Graph};
use crate::mxf::codec::{attrs_from_protos, decode_int_values, decode_tensor, dtype_of, decode_model};
use crate::mxf::proto::{DataType, GraphProto, Model, NodeProto};
use crate::numeric::Real;
use crate::parameter::Parameter;
use crate::registry::{BuildContext, OpRegistry};
use crate::types::{Attribute, NodeId};

/// Layer tags appended to a bare name when resolving a dependency that the
/// exporter recorded without its final path segment. The order is part of
/// the format contract.
const LAYER_TAGS: &[&str] = &[
    "/LayerNorm",
    "/SimplifiedLayerNormalization",
    "/SkipLayerNorm",
    "/MatMul",
    "/Gather",
    "/Shape",
    "/Cast",
    "/Reshape",
    "/Mul",
    "/Sub",
    "/Add",
    "/Concat",
    "/Unsqueeze",
    "/FastGelu",
];

pub fn load_model<E: Real>(
    engine: Arc<dyn Engine<E>>,
    registry: &OpRegistry<E>,
    bytes: &[u8],
) -> Result<Graph<E>> {
    let model = decode_model(bytes)?;
    build_graph(engine, registry, &model)
}

pub fn build_graph<E: Real>(
    engine: Arc<dyn Engine<E>>,
    registry: &OpRegistry<E>,
    model: &Model,
) -> Result<Graph<E>> {
    let gp = model
        .graph
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("model carries no graph".into()))?;
    Loader::new(engine, registry, gp)?.run()
}

struct Loader<'a, E: Real> {
    engine: Arc<dyn Engine<E>>,
    registry: &'a OpRegistry<E>,
    gp: &'a GraphProto,
    params: HashMap<String, Arc<Parameter<E>>>,
    int_consts: HashMap<String, Vec<i64>>,
    table: HashMap<String, NodeId>,
}

impl<'a, E: Real> Loader<'a, E> {
    fn new(
        engine: Arc<dyn Engine<E>>,
        registry: &'a OpRegistry<E>,
        gp: &'a GraphProto,
    ) -> Result<Self> {
        let mut params = HashMap::new();
        let mut int_consts = HashMap::new();
        for (name, proto) in &gp.parameters {
            let wire = DataType::try_from(proto.dtype).map_err(|_| {
                Error::InvalidArgument(format!(
                    "parameter {:?} carries unknown dtype {}",
                    name, proto.dtype
                ))
            })?;
            if dtype_of(wire).is_float() {
                let value = decode_tensor::<E>(name, proto)?;
                params.insert(name.clone(), Arc::new(Parameter::new(name.clone(), value)?));
            } else {
                // Integer tensors stay out of the trainable set; they feed
                // attribute-level constants such as reshape targets.
                int_consts.insert(name.clone(), decode_int_values(name, proto)?);
            }
        }
        debug!(parameters = params.len(), constants = int_consts.len(), "decoded parameters");
        Ok(Loader {
            engine,
            registry,
            gp,
            params,
            int_consts,
            table: HashMap::new(),
        })
    }

    fn run(mut self) -> Result<Graph<E>> {
        let gp = self.gp;
        let mut builder = Builder::new(self.engine.clone());

        // Inputs that are not parameters become placeholders.
        for vi in &gp.inputs {
            if self.params.contains_key(&vi.name) || self.int_consts.contains_key(&vi.name) {
                continue;
            }
            let dims: Vec<usize> = vi.shape.iter().map(|&d| d.max(0) as usize).collect();
            let id = builder.add_input(dims);
            self.table.insert(vi.name.clone(), id);
        }

        // First pass: construct a node for every proto whose name is free.
        let kept: Vec<&NodeProto> = gp
            .nodes
            .iter()
            .filter(|n| !self.table.contains_key(&n.name))
            .collect();
        let base = builder.len();
        for (j, proto) in kept.iter().enumerate() {
            self.table.insert(proto.name.clone(), NodeId(base + j));
        }

        let mut built: Vec<(Arc<dyn Node<E>>, Vec<String>)> = Vec::with_capacity(kept.len());
        for proto in &kept {
            let (attrs, inputs) = self.fix_up(proto)?;
            let builder_fn = self.registry.lookup(&proto.op_type)?;
            let ctx = BuildContext {
                engine: self.engine.clone(),
                name: &proto.name,
                params: &self.params,
                attrs: &attrs,
            };
            let node = builder_fn.as_ref()(&ctx)?;
            built.push((node, inputs));
        }

        // Second pass: resolve dependency names, promoting parameters to
        // synthesized nodes where needed.
        let mut promoted: Vec<Arc<dyn Node<E>>> = Vec::new();
        let promoted_base = base + kept.len();
        let mut wired: Vec<Vec<NodeId>> = Vec::with_capacity(built.len());
        for ((_, inputs), proto) in built.iter().zip(&kept) {
            let mut ids = Vec::with_capacity(inputs.len());
            for input in inputs {
                ids.push(self.resolve(&proto.name, input, &mut promoted, promoted_base)?);
            }
            wired.push(ids);
        }

        for ((node, _), ids) in built.into_iter().zip(&wired) {
            builder.add_node(node, ids);
        }
        for node in promoted {
            builder.add_node(node, &[]);
        }

        let output = self.resolve_output(&mut builder)?;
        let graph = builder.build(output)?;
        info!(
            nodes = graph.len(),
            parameters = graph.parameters().len(),
            "model graph reconstructed"
        );
        Ok(graph)
    }

    /// Per-operator input adjustments applied before wiring.
    fn fix_up(&self, proto: &NodeProto) -> Result<(crate::types::AttrMap, Vec<String>)> {
        let mut attrs = attrs_from_protos(&proto.attributes)?;
        let mut inputs = proto.inputs.clone();

        match proto.op_type.as_str() {
            // Embedded-table gather: the weight arrives via the parameter
            // map, not as a graph dependency.
            "Gather" => {
                if inputs.len() >= 2 && self.params.contains_key(&inputs[0]) {
                    let table = inputs.remove(0);
                    attrs.insert("table".into(), Attribute::Str(table));
                }
            }
            // A language-model head multiplying by the embedding table reads
            // a transposed view of that parameter.
            "MatMul" => {
                if proto.name.contains("lm_head") && inputs.len() == 2 {
                    if self.params.contains_key(&inputs[1]) {
                        inputs[1] = format!("{}_transposed", inputs[1]);
                    }
                }
            }
            // Gain (and shift) come through the parameter map.
            "SimplifiedLayerNormalization"
            | "RMSNorm"
            | "SkipSimplifiedLayerNormalization"
            | "SkipLayerNorm" => {
                if inputs.len() >= 2 {
                    attrs.insert("gain".into(), Attribute::Str(inputs[1].clone()));
                }
                inputs.truncate(1);
            }
            "LayerNormalization" | "LayerNorm" => {
                if inputs.len() >= 2 {
                    attrs.insert("scale".into(), Attribute::Str(inputs[1].clone()));
                }
                if inputs.len() >= 3 {
                    attrs.insert("bias".into(), Attribute::Str(inputs[2].clone()));
                }
                inputs.truncate(1);
            }
            // A shape carried as a constant tensor becomes a node attribute,
            // which allows validation at build time.
            "Reshape" => {
                if inputs.len() == 2 {
                    if let Some(values) = self.int_consts.get(&inputs[1]) {
                        attrs.insert("shape".into(), Attribute::Ints(values.clone()));
                        inputs.truncate(1);
                    } else if let Some(param) = self.params.get(&inputs[1]) {
                        let values: Vec<i64> =
                            param.value().data().iter().map(|v| v.as_f64() as i64).collect();
                        attrs.insert("shape".into(), Attribute::Ints(values));
                        inputs.truncate(1);
                    }
                }
            }
            _ => {}
        }
        Ok((attrs, inputs))
    }

    /// Strips a trailing `:N` or `/output_N` output selector.
    fn strip_output_suffix(name: &str) -> Option<&str> {
        if name.len() >= 2 {
            let bytes = name.as_bytes();
            if bytes[name.len() - 2] == b':' && bytes[name.len() - 1].is_ascii_digit() {
                return Some(&name[..name.len() - 2]);
            }
        }
        if let Some(pos) = name.rfind("/output_") {
            let tail = &name[pos + "/output_".len()..];
            if tail.len() == 1 && tail.as_bytes()[0].is_ascii_digit() {
                return Some(&name[..pos]);
            }
        }
        None
    }

    /// Applies the name-resolution fallback chain for one dependency.
    fn resolve(
        &mut self,
        node: &str,
        input: &str,
        promoted: &mut Vec<Arc<dyn Node<E>>>,
        promoted_base: usize,
    ) -> Result<NodeId> {
        if let Some(&id) = self.table.get(input) {
            return Ok(id);
        }
        let bare = Self::strip_output_suffix(input);
        if let Some(bare) = bare {
            if let Some(&id) = self.table.get(bare) {
                return Ok(id);
            }
        }
        let stem = bare.unwrap_or(input);
        for tag in LAYER_TAGS {
            if let Some(&id) = self.table.get(&format!("{}{}", stem, tag)) {
                return Ok(id);
            }
        }
        if let Some(param) = self.params.get(input).or_else(|| self.params.get(stem)) {
            let param = param.clone();
            let node = Arc::new(ParamNode::new(self.engine.clone(), param));
            return Ok(self.promote(input, node, promoted, promoted_base));
        }
        if let Some(base_name) = input.strip_suffix("_transposed") {
            if let Some(param) = self.params.get(base_name) {
                let param = param.clone();
                let node = Arc::new(ParamNode::transposed(self.engine.clone(), param)?);
                return Ok(self.promote(input, node, promoted, promoted_base));
            }
        }
        Err(Error::UnresolvedInput {
            node: node.to_string(),
            input: input.to_string(),
        })
    }

    fn promote(
        &mut self,
        name: &str,
        node: Arc<dyn Node<E>>,
        promoted: &mut Vec<Arc<dyn Node<E>>>,
        promoted_base: usize,
    ) -> NodeId {
        let id = NodeId(promoted_base + promoted.len());
        promoted.push(node);
        self.table.insert(name.to_string(), id);
        id
    }

    fn resolve_output(&mut self, builder: &mut Builder<E>) -> Result<NodeId> {
        let gp = self.gp;
        let vi = gp
            .outputs
            .first()
            .ok_or_else(|| Error::InvalidArgument("model declares no outputs".into()))?;
        if let Some(&id) = self.table.get(&vi.name) {
            return Ok(id);
        }
        // Conventional head naming: `logits` is the lm-head matmul.
        if vi.name == "logits" {
            if let Some(&id) = self.table.get("/lm_head/MatMul") {
                return Ok(id);
            }
        }
        let bare = Self::strip_output_suffix(&vi.name);
        if let Some(bare) = bare {
            if let Some(&id) = self.table.get(bare) {
                return Ok(id);
            }
        }
        let stem = bare.unwrap_or(&vi.name);
        for tag in LAYER_TAGS {
            if let Some(&id) = self.table.get(&format!("{}{}", stem, tag)) {
                return Ok(id);
            }
        }
        if let Some(param) = self.params.get(&vi.name).or_else(|| self.params.get(stem)) {
            let param = param.clone();
            let node: Arc<dyn Node<E>> = Arc::new(ParamNode::new(self.engine.clone(), param));
            let id = builder.add_node(node, &[]);
            self.table.insert(vi.name.clone(), id);
            return Ok(id);
        }
        if let Some(base_name) = vi.name.strip_suffix("_transposed") {
            if let Some(param) = self.params.get(base_name) {
                let param = param.clone();
                let node: Arc<dyn Node<E>> =
                    Arc::new(ParamNode::transposed(self.engine.clone(), param)?);
                let id = builder.add_node(node, &[]);
                self.table.insert(vi.name.clone(), id);
                return Ok(id);
            }
        }
        Err(Error::UnresolvedInput {
            node: "output".to_string(),
            input: vi.name.clone(),
        })
    }
}
