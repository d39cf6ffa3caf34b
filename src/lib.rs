//! tabpfn-transformer: the PerFeatureTransformer forward pipeline for
//! in-context tabular prediction, built on burn.

pub mod tabpfn;

pub use tabpfn::architectures::base::{
    config::{FeaturePositionalEmbedding, ModelConfig, TransformerOptions},
    error::{Result, TransformerError},
    graph::{DataDAG, NodeMetadata},
    inputs::{FeatureInput, TargetInput, TargetStream, MAIN_KEY},
    transformer::{ForwardOptions, ForwardOutput, PerFeatureTransformer},
};
pub use tabpfn::settings::{settings, Settings};
