//! Copyright (c) Prior Labs GmbH 2025.
//!
//! Two-layer perceptron used inside each encoder layer and as the decoder head.

use burn::module::{Ignored, Module};
use burn::prelude::*;
use burn::tensor::activation;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::error::{Result, TransformerError};
use super::linear::DeterministicLinear;
use super::rng::DeterministicRngContext;

/// Activation between the two projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Activation {
    #[serde(alias = "gelu")]
    GELU,
    #[serde(alias = "relu")]
    RELU,
}

impl FromStr for Activation {
    type Err = TransformerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "GELU" => Ok(Activation::GELU),
            "RELU" => Ok(Activation::RELU),
            _ => Err(TransformerError::config(format!(
                "Unknown activation function: {s}"
            ))),
        }
    }
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::GELU => activation::gelu(x),
            Activation::RELU => activation::relu(x),
        }
    }
}

/// `linear2(activation(linear1(x)))` over the last dimension.
///
/// The layer MLP has no bias and may start with a zero output projection so
/// a freshly built layer is the identity on its residual path. Decoder heads
/// use biases and a different output width.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    pub linear1: DeterministicLinear<B>,
    pub linear2: DeterministicLinear<B>,
    activation: Ignored<Activation>,
}

impl<B: Backend> Mlp<B> {
    /// Seeds: `linear1 = offset + 100`, `linear2 = offset + 101`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        output_size: usize,
        activation: Activation,
        bias: bool,
        initialize_output_to_zero: bool,
        rng_ctx: &DeterministicRngContext<B>,
        seed_offset: u64,
    ) -> Result<Self> {
        let linear1 =
            rng_ctx.create_deterministic_linear(input_size, hidden_size, bias, seed_offset + 100)?;
        let linear2 = if initialize_output_to_zero {
            rng_ctx.create_zero_linear(hidden_size, output_size, bias)
        } else {
            rng_ctx.create_deterministic_linear(hidden_size, output_size, bias, seed_offset + 101)?
        };

        Ok(Self {
            linear1,
            linear2,
            activation: Ignored(activation),
        })
    }

    pub fn activation(&self) -> Activation {
        *self.activation
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let hidden = self.activation.apply(self.linear1.forward(x));
        self.linear2.forward(hidden)
    }

    /// Same result as [`Mlp::forward`], computed over `factor` row chunks.
    pub fn forward_chunked<const D: usize>(
        &self,
        x: Tensor<B, D>,
        save_peak_mem_factor: Option<usize>,
    ) -> Tensor<B, D> {
        let dims = x.dims();
        let rows: usize = dims[..D - 1].iter().product();
        let factor = match save_peak_mem_factor {
            Some(factor) if factor > 1 && rows >= factor => factor,
            _ => return self.forward(x),
        };

        let flat = x.reshape([rows, dims[D - 1]]);
        let chunks: Vec<Tensor<B, 2>> = flat
            .chunk(factor, 0)
            .into_iter()
            .map(|chunk| self.forward(chunk))
            .collect();

        let mut out_dims = dims;
        out_dims[D - 1] = self.linear2.output_dim();
        Tensor::cat(chunks, 0).reshape(out_dims)
    }
}
