//! Base architecture modules

pub mod attention;
pub mod config;
pub mod eigen;
pub mod embedding_cache;
pub mod encoders;
pub mod error;
pub mod graph;
pub mod inputs;
pub mod layer;
pub mod layer_stack;
pub mod linear;
pub mod mlp;
pub mod rng;
pub mod transformer;
