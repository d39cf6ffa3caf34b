//! Multi-head scaled dot-product attention.

use burn::module::{Ignored, Module};
use burn::prelude::*;
use burn::tensor::activation;

use super::error::{Result, TransformerError};
use super::linear::DeterministicLinear;
use super::rng::DeterministicRngContext;

/// Queries come from `x`, keys and values from `x_kv`; both are
/// `[tokens, len, emsize]` with the same number of independent token groups.
#[derive(Module, Debug)]
pub struct MultiHeadAttention<B: Backend> {
    w_q: DeterministicLinear<B>,
    w_k: DeterministicLinear<B>,
    w_v: DeterministicLinear<B>,
    w_out: DeterministicLinear<B>,
    nhead: Ignored<usize>,
    d_head: Ignored<usize>,
}

impl<B: Backend> MultiHeadAttention<B> {
    /// Seeds: `q, k, v = offset + 110..=112`, `out = offset + 113`.
    pub fn new(
        emsize: usize,
        nhead: usize,
        zero_init_output: bool,
        rng_ctx: &DeterministicRngContext<B>,
        seed_offset: u64,
    ) -> Result<Self> {
        if nhead == 0 || emsize % nhead != 0 {
            return Err(TransformerError::config(format!(
                "emsize ({emsize}) must be divisible by nhead ({nhead})"
            )));
        }
        let w_out = if zero_init_output {
            rng_ctx.create_zero_linear(emsize, emsize, false)
        } else {
            rng_ctx.create_deterministic_linear(emsize, emsize, false, seed_offset + 113)?
        };

        Ok(Self {
            w_q: rng_ctx.create_deterministic_linear(emsize, emsize, false, seed_offset + 110)?,
            w_k: rng_ctx.create_deterministic_linear(emsize, emsize, false, seed_offset + 111)?,
            w_v: rng_ctx.create_deterministic_linear(emsize, emsize, false, seed_offset + 112)?,
            w_out,
            nhead: Ignored(nhead),
            d_head: Ignored(emsize / nhead),
        })
    }

    fn split_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 4> {
        let [tokens, len, _] = x.dims();
        x.reshape([tokens, len, *self.nhead, *self.d_head])
            .swap_dims(1, 2)
    }

    pub fn forward(&self, x: Tensor<B, 3>, x_kv: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [tokens, len_q, emsize] = x.dims();
        let [kv_tokens, len_kv, kv_emsize] = x_kv.dims();
        if kv_tokens != tokens || kv_emsize != emsize {
            return Err(TransformerError::shape(
                "attention keys/values",
                &[tokens, len_kv, emsize],
                &[kv_tokens, len_kv, kv_emsize],
            ));
        }
        if len_kv == 0 {
            return Err(TransformerError::usage(
                "attention needs at least one key/value position",
            ));
        }

        let q = self.split_heads(self.w_q.forward(x));
        let k = self.split_heads(self.w_k.forward(x_kv.clone()));
        let v = self.split_heads(self.w_v.forward(x_kv));

        let scale = (*self.d_head as f64).sqrt().recip();
        let scores = q.matmul(k.swap_dims(2, 3)).mul_scalar(scale);
        let weights = activation::softmax(scores, 3);
        let context = weights.matmul(v).swap_dims(1, 2).reshape([tokens, len_q, emsize]);

        Ok(self.w_out.forward(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn attention(zero: bool) -> MultiHeadAttention<TestBackend> {
        let ctx = DeterministicRngContext::new(3, Default::default());
        MultiHeadAttention::new(8, 2, zero, &ctx, 0).unwrap()
    }

    #[test]
    fn test_output_shape_follows_queries() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::ones([3, 5, 8], &device);
        let kv = Tensor::<TestBackend, 3>::ones([3, 2, 8], &device);
        let out = attention(false).forward(x, kv).unwrap();
        assert_eq!(out.dims(), [3, 5, 8]);
    }

    #[test]
    fn test_single_key_returns_its_projected_value() {
        // With one key, softmax weight is 1 regardless of the query.
        let device = Default::default();
        let attn = attention(false);
        let kv = Tensor::<TestBackend, 3>::ones([1, 1, 8], &device);
        let a = attn.forward(Tensor::zeros([1, 1, 8], &device), kv.clone()).unwrap();
        let b = attn.forward(Tensor::ones([1, 1, 8], &device), kv).unwrap();
        let a = a.into_data().to_vec::<f32>().unwrap();
        let b = b.into_data().to_vec::<f32>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rejects_empty_keys() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::ones([1, 2, 8], &device);
        let kv = Tensor::<TestBackend, 3>::zeros([1, 0, 8], &device);
        assert!(attention(true).forward(x, kv).is_err());
    }

    #[test]
    fn test_rejects_bad_head_count() {
        let ctx = DeterministicRngContext::<TestBackend>::new(0, Default::default());
        assert!(MultiHeadAttention::new(10, 3, false, &ctx, 0).is_err());
    }
}
