//! Operator registry: maps an operator-type string to a builder that
//! constructs a concrete node from an engine, a node name, the decoded
//! parameter map, and the node's attribute map. The registry is an explicit
//! handle seeded with the builtin catalogue and treated as read-only after
//! construction.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::engine::Engine;
use crate::errors::{Error, Result};
use crate::graph::node::{
    ArithOp, ElementwiseNode, GatherNode, IdentityNode, MatMulNode, Node, ReduceSumNode,
    ReshapeNode, TransposeNode,
};
use crate::layers::{
    Attention, Embedding, FastGeluNode, FeedForward, LayerNorm, RmsNorm, RotaryEmbedding,
    SkipRmsNorm, TransformerBlock,
};
use crate::numeric::Real;
use crate::parameter::Parameter;
use crate::types::AttrMap;

/// Everything a builder needs to construct one node.
pub struct BuildContext<'a, E: Real> {
    pub engine: Arc<dyn Engine<E>>,
    pub name: &'a str,
    pub params: &'a HashMap<String, Arc<Parameter<E>>>,
    pub attrs: &'a AttrMap,
}

impl<'a, E: Real> BuildContext<'a, E> {
    pub fn attr_int(&self, key: &str) -> Option<i64> {
        self.attrs.get(key).and_then(|a| a.as_int())
    }

    pub fn attr_float(&self, key: &str) -> Option<f32> {
        self.attrs.get(key).and_then(|a| a.as_float())
    }

    pub fn attr_ints(&self, key: &str) -> Option<Vec<i64>> {
        self.attrs.get(key).and_then(|a| a.as_ints().map(|v| v.to_vec()))
    }

    fn named_param(&self, name: &str) -> Result<Arc<Parameter<E>>> {
        self.params.get(name).cloned().ok_or_else(|| Error::UnresolvedInput {
            node: self.name.to_string(),
            input: name.to_string(),
        })
    }

    /// Resolves the parameter named by attribute `key`, falling back to the
    /// `<node>.<key>` convention, then to the bare node name.
    pub fn param_for(&self, key: &str) -> Result<Arc<Parameter<E>>> {
        if let Some(name) = self.attrs.get(key).and_then(|a| a.as_str()) {
            return self.named_param(name);
        }
        let scoped = format!("{}.{}", self.name, key);
        if self.params.contains_key(&scoped) {
            return self.named_param(&scoped);
        }
        self.named_param(self.name)
    }

    fn epsilon(&self) -> f64 {
        self.attr_float("epsilon").map(|v| v as f64).unwrap_or(1e-5)
    }

    fn rotary(&self, prefix: &str) -> Result<Option<RotaryEmbedding<E>>> {
        let dim = match self.attr_int(&format!("{}dim", prefix)) {
            Some(d) => d as usize,
            None => return Ok(None),
        };
        let base = self
            .attr_float(&format!("{}base", prefix))
            .map(|v| v as f64)
            .unwrap_or(10000.0);
        let max_seq = self
            .attr_int(&format!("{}max_seq_len", prefix))
            .unwrap_or(2048) as usize;
        RotaryEmbedding::new(dim, base, max_seq).map(Some)
    }
}

pub type BuilderFn<E> =
    Arc<dyn Fn(&BuildContext<'_, E>) -> Result<Arc<dyn Node<E>>> + Send + Sync>;

pub struct OpRegistry<E: Real> {
    builders: HashMap<String, BuilderFn<E>>,
}

impl<E: Real> Default for OpRegistry<E> {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl<E: Real> OpRegistry<E> {
    pub fn empty() -> Self {
        OpRegistry { builders: HashMap::new() }
    }

    /// Registers a builder. Re-registration overwrites the prior entry with
    /// a diagnostic.
    pub fn register(
        &mut self,
        op_type: impl Into<String>,
        builder: impl Fn(&BuildContext<'_, E>) -> Result<Arc<dyn Node<E>>> + Send + Sync + 'static,
    ) {
        let op_type = op_type.into();
        if self.builders.insert(op_type.clone(), Arc::new(builder)).is_some() {
            warn!(op_type = %op_type, "operator builder overwritten");
        }
    }

    pub fn lookup(&self, op_type: &str) -> Result<BuilderFn<E>> {
        self.builders
            .get(op_type)
            .cloned()
            .ok_or_else(|| Error::UnknownOperator(op_type.to_string()))
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.builders.contains_key(op_type)
    }

    /// A registry seeded with the builtin operator catalogue.
    pub fn with_builtins() -> Self {
        let mut r = Self::empty();

        for (key, op) in [
            ("Add", ArithOp::Add),
            ("Sub", ArithOp::Sub),
            ("Mul", ArithOp::Mul),
            ("Div", ArithOp::Div),
        ] {
            r.register(key, move |ctx: &BuildContext<'_, E>| {
                Ok(Arc::new(ElementwiseNode::new(ctx.engine.clone(), op)) as Arc<dyn Node<E>>)
            });
        }

        r.register("MatMul", |ctx: &BuildContext<'_, E>| {
            Ok(Arc::new(MatMulNode::new(ctx.engine.clone())) as Arc<dyn Node<E>>)
        });

        r.register("Identity", |_ctx: &BuildContext<'_, E>| {
            Ok(Arc::new(IdentityNode::new()) as Arc<dyn Node<E>>)
        });

        r.register("Reshape", |ctx: &BuildContext<'_, E>| {
            let shape = ctx.attr_ints("shape").ok_or_else(|| {
                Error::InvalidArgument(format!("reshape node {:?} lacks a shape attribute", ctx.name))
            })?;
            Ok(Arc::new(ReshapeNode::new(ctx.engine.clone(), shape)) as Arc<dyn Node<E>>)
        });

        r.register("Transpose", |ctx: &BuildContext<'_, E>| {
            let perm = ctx.attr_ints("perm").ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "transpose node {:?} lacks a perm attribute",
                    ctx.name
                ))
            })?;
            let perm: Vec<usize> = perm.iter().map(|&p| p as usize).collect();
            Ok(Arc::new(TransposeNode::new(ctx.engine.clone(), perm)) as Arc<dyn Node<E>>)
        });

        r.register("Gather", |ctx: &BuildContext<'_, E>| {
            // An embedded table turns the gather into an embedding lookup.
            if ctx.attrs.contains_key("table") {
                let table = ctx.param_for("table")?;
                return Ok(Arc::new(Embedding::new(ctx.engine.clone(), table)?) as Arc<dyn Node<E>>);
            }
            Ok(Arc::new(GatherNode::new(ctx.engine.clone())) as Arc<dyn Node<E>>)
        });

        r.register("ReduceSum", |ctx: &BuildContext<'_, E>| {
            let axes: Vec<isize> = ctx
                .attr_ints("axes")
                .unwrap_or_default()
                .iter()
                .map(|&a| a as isize)
                .collect();
            let keep = ctx.attr_int("keep_dims").unwrap_or(1) != 0;
            Ok(Arc::new(ReduceSumNode::new(ctx.engine.clone(), axes, keep)) as Arc<dyn Node<E>>)
        });

        for key in ["SimplifiedLayerNormalization", "RMSNorm"] {
            r.register(key, move |ctx: &BuildContext<'_, E>| {
                let gain = ctx.param_for("gain")?;
                let norm =
                    RmsNorm::new(ctx.engine.clone(), gain, ctx.epsilon())?.with_op_type(key);
                Ok(Arc::new(norm) as Arc<dyn Node<E>>)
            });
        }

        for key in ["SkipSimplifiedLayerNormalization", "SkipLayerNorm"] {
            r.register(key, |ctx: &BuildContext<'_, E>| {
                let gain = ctx.param_for("gain")?;
                Ok(Arc::new(SkipRmsNorm::new(ctx.engine.clone(), gain, ctx.epsilon())?)
                    as Arc<dyn Node<E>>)
            });
        }

        for key in ["LayerNormalization", "LayerNorm"] {
            r.register(key, |ctx: &BuildContext<'_, E>| {
                let scale = ctx.param_for("scale")?;
                let bias = ctx.param_for("bias")?;
                Ok(
                    Arc::new(LayerNorm::new(ctx.engine.clone(), scale, bias, ctx.epsilon())?)
                        as Arc<dyn Node<E>>,
                )
            });
        }

        r.register("FastGelu", |ctx: &BuildContext<'_, E>| {
            Ok(Arc::new(FastGeluNode::new(ctx.engine.clone())) as Arc<dyn Node<E>>)
        });

        r.register("RotaryEmbedding", |ctx: &BuildContext<'_, E>| {
            let rot = ctx.rotary("")?.ok_or_else(|| {
                Error::InvalidArgument(format!("rotary node {:?} lacks a dim attribute", ctx.name))
            })?;
            Ok(Arc::new(rot) as Arc<dyn Node<E>>)
        });

        r.register("Attention", |ctx: &BuildContext<'_, E>| {
            let heads = ctx.attr_int("num_heads").ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "attention node {:?} lacks a num_heads attribute",
                    ctx.name
                ))
            })? as usize;
            let attn = Attention::new(
                ctx.engine.clone(),
                heads,
                ctx.param_for("wq")?,
                ctx.param_for("wk")?,
                ctx.param_for("wv")?,
                ctx.param_for("wo")?,
                ctx.rotary("rotary_")?,
                ctx.attr_int("causal").unwrap_or(1) != 0,
            )?;
            Ok(Arc::new(attn) as Arc<dyn Node<E>>)
        });

        r.register("FeedForward", |ctx: &BuildContext<'_, E>| {
            let ffn = FeedForward::new(
                ctx.engine.clone(),
                ctx.param_for("w1")?,
                ctx.param_for("b1")?,
                ctx.param_for("w2")?,
                ctx.param_for("b2")?,
            )?;
            Ok(Arc::new(ffn) as Arc<dyn Node<E>>)
        });

        r.register("TransformerBlock", |ctx: &BuildContext<'_, E>| {
            let heads = ctx.attr_int("num_heads").ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "transformer node {:?} lacks a num_heads attribute",
                    ctx.name
                ))
            })? as usize;
            let attn_norm =
                RmsNorm::new(ctx.engine.clone(), ctx.param_for("attn_norm_gain")?, ctx.epsilon())?;
            let ffn_norm =
                RmsNorm::new(ctx.engine.clone(), ctx.param_for("ffn_norm_gain")?, ctx.epsilon())?;
            let post_norm = if ctx.attrs.contains_key("post_norm_gain") {
                Some(RmsNorm::new(
                    ctx.engine.clone(),
                    ctx.param_for("post_norm_gain")?,
                    ctx.epsilon(),
                )?)
            } else {
                None
            };
            let attn = Attention::new(
                ctx.engine.clone(),
                heads,
                ctx.param_for("wq")?,
                ctx.param_for("wk")?,
                ctx.param_for("wv")?,
                ctx.param_for("wo")?,
                ctx.rotary("rotary_")?,
                ctx.attr_int("causal").unwrap_or(1) != 0,
            )?;
            let ffn = FeedForward::new(
                ctx.engine.clone(),
                ctx.param_for("w1")?,
                ctx.param_for("b1")?,
                ctx.param_for("w2")?,
                ctx.param_for("b2")?,
            )?;
            let block = TransformerBlock::new(
                ctx.engine.clone(),
                attn_norm,
                attn,
                post_norm,
                ffn_norm,
                ffn,
            );
            Ok(Arc::new(block) as Arc<dyn Node<E>>)
        });

        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;
    use crate::types::Attribute;

    fn ctx_parts() -> (Arc<dyn Engine<f32>>, HashMap<String, Arc<Parameter<f32>>>) {
        (Arc::new(CpuEngine::new()), HashMap::new())
    }

    #[test]
    fn unknown_operator_fails_lookup() {
        let r = OpRegistry::<f32>::with_builtins();
        assert!(matches!(r.lookup("NoSuchOp"), Err(Error::UnknownOperator(_))));
    }

    #[test]
    fn builtin_matmul_builds() {
        let r = OpRegistry::<f32>::with_builtins();
        let (engine, params) = ctx_parts();
        let attrs = AttrMap::new();
        let ctx = BuildContext { engine, name: "mm", params: &params, attrs: &attrs };
        let builder = r.lookup("MatMul").unwrap();
        let node = builder.as_ref()(&ctx).unwrap();
        assert_eq!(node.op_type(), "MatMul");
    }

    #[test]
    fn rms_norm_resolves_gain_through_attribute() {
        let r = OpRegistry::<f32>::with_builtins();
        let (engine, mut params) = ctx_parts();
        params.insert(
            "model.norm.weight".into(),
            Arc::new(
                Parameter::new("model.norm.weight", crate::tensor::Tensor::filled([4], 1.0))
                    .unwrap(),
            ),
        );
        let mut attrs = AttrMap::new();
        attrs.insert("gain".into(), Attribute::Str("model.norm.weight".into()));
        let ctx = BuildContext { engine, name: "norm", params: &params, attrs: &attrs };
        let builder = r.lookup("SimplifiedLayerNormalization").unwrap();
        let node = builder.as_ref()(&ctx).unwrap();
        assert_eq!(node.op_type(), "SimplifiedLayerNormalization");
        assert_eq!(node.parameters().len(), 1);
    }

    #[test]
    fn re_registration_overwrites() {
        let mut r = OpRegistry::<f32>::with_builtins();
        r.register("MatMul", |_ctx: &BuildContext<'_, f32>| {
            Ok(Arc::new(IdentityNode::new()) as Arc<dyn Node<f32>>)
        });
        let (engine, params) = ctx_parts();
        let attrs = AttrMap::new();
        let ctx = BuildContext { engine, name: "mm", params: &params, attrs: &attrs };
        let builder = r.lookup("MatMul").unwrap();
        let node = builder.as_ref()(&ctx).unwrap();
        assert_eq!(node.op_type(), "Identity");
    }

    #[test]
    fn missing_parameter_reports_unresolved_input() {
        let r = OpRegistry::<f32>::with_builtins();
        let (engine, params) = ctx_parts();
        let mut attrs = AttrMap::new();
        attrs.insert("gain".into(), Attribute::Str("nope".into()));
        let ctx = BuildContext { engine, name: "norm", params: &params, attrs: &attrs };
        let builder = r.lookup("RMSNorm").unwrap();
        assert!(matches!(
            builder.as_ref()(&ctx),
            Err(Error::UnresolvedInput { .. })
        ));
    }
}
