//! Parameter-carrying operators: normalization, rotary position encoding,
//! attention, feed-forward, embeddings, and the composed transformer block.

pub mod attention;
pub mod embedding;
pub mod ffn;
pub mod norm;
pub mod rotary;
pub mod transformer;

pub use attention::Attention;
pub use embedding::Embedding;
pub use ffn::{FastGeluNode, FeedForward};
pub use norm::{LayerNorm, RmsNorm, SkipRmsNorm};
pub use rotary::RotaryEmbedding;
pub use transformer::TransformerBlock;
