//! Token embedding: a gather whose table is an owned parameter rather than
//! a graph input (the exchange format embeds the weight and the loader drops
//! the corresponding dependency).

use std::sync::Arc;

use crate::engine::Engine;
use crate::errors::{Error, Result};
use crate::graph::node::{expect_arity, Node, ShapeCell};
use crate::numeric::Numeric;
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use crate::types::{AttrMap, Attribute, BackwardMode, RunContext};

pub struct Embedding<E: Numeric> {
    table: Arc<Parameter<E>>,
    engine: Arc<dyn Engine<E>>,
    cell: ShapeCell,
}

impl<E: Numeric> Embedding<E> {
    pub fn new(engine: Arc<dyn Engine<E>>, table: Arc<Parameter<E>>) -> Result<Self> {
        if table.value().rank() < 1 {
            return Err(Error::InvalidArgument(format!(
                "embedding table {:?} must be at least rank 1",
                table.name()
            )));
        }
        Ok(Embedding { table, engine, cell: ShapeCell::new() })
    }

    pub fn table(&self) -> &Arc<Parameter<E>> {
        &self.table
    }
}

impl<E: Numeric> Node<E> for Embedding<E> {
    fn op_type(&self) -> &str {
        "Gather"
    }

    fn attributes(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("table".into(), Attribute::Str(self.table.name().to_string()));
        attrs
    }

    fn shape_cell(&self) -> &ShapeCell {
        &self.cell
    }

    fn forward(&self, ctx: &RunContext, inputs: &[&Tensor<E>]) -> Result<Tensor<E>> {
        expect_arity("Gather", inputs, 1)?;
        self.engine.gather(ctx, self.table.value(), inputs[0], None)
    }

    fn backward(
        &self,
        ctx: &RunContext,
        _mode: BackwardMode,
        grad: &Tensor<E>,
        inputs: &[&Tensor<E>],
    ) -> Result<Vec<Tensor<E>>> {
        expect_arity("Gather", inputs, 1)?;
        let indices = inputs[0];
        let zeros = Tensor::<E>::zeros(self.table.value().shape().clone());
        let dtable = self.engine.scatter_add(ctx, &zeros, indices, grad, None)?;
        self.table.add_gradient(&dtable)?;
        Ok(vec![Tensor::zeros(indices.shape().clone())])
    }

    fn parameters(&self) -> Vec<Arc<Parameter<E>>> {
        vec![self.table.clone()]
    }
}
