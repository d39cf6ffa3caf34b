//  Copyright (c) Prior Labs GmbH 2025.

use burn::{
    module::{Ignored, Module},
    nn::{LayerNorm, LayerNormConfig},
    prelude::{Backend, Tensor},
    tensor::TensorData,
};
use log::trace;

use super::{
    attention::MultiHeadAttention,
    config::ModelConfig,
    error::{Result, TransformerError},
    mlp::{Activation, Mlp},
    rng::DeterministicRngContext,
};

/// One block of the layer stack, operating on `[batch, seq, groups, emsize]`.
pub trait EncoderLayer<B: Backend> {
    /// Transform the token grid.
    ///
    /// Rows attend to the first `single_eval_pos` rows, or to `att_src` when
    /// given (then `single_eval_pos` must be 0). With
    /// `cache_trainset_representation` the training rows are remembered, and
    /// a later call with `single_eval_pos == 0` attends to them.
    fn apply(
        &mut self,
        state: Tensor<B, 4>,
        single_eval_pos: usize,
        cache_trainset_representation: bool,
        att_src: Option<Tensor<B, 4>>,
    ) -> Result<Tensor<B, 4>>;

    fn save_peak_mem_factor(&self) -> Option<usize>;

    fn set_save_peak_mem_factor(&mut self, factor: Option<usize>);

    fn empty_trainset_representation_cache(&mut self);
}

/// Post-norm transformer block with attention between feature groups,
/// attention between items (rows), and an MLP.
#[derive(Module, Debug)]
pub struct PerFeatureEncoderLayer<B: Backend> {
    self_attn_between_features: MultiHeadAttention<B>,
    self_attn_between_items: MultiHeadAttention<B>,
    mlp: Mlp<B>,
    layer_norm_features: LayerNorm<B>,
    layer_norm_items: LayerNorm<B>,
    layer_norm_mlp: LayerNorm<B>,
    save_peak_mem_factor: Ignored<Option<usize>>,
    /// Item-attention keys/values of the training rows, `[batch * groups, rows, emsize]`
    trainset_cache: Ignored<Option<TensorData>>,
}

const LAYER_NORM_EPS: f64 = 1e-5;

impl<B: Backend> PerFeatureEncoderLayer<B> {
    pub fn new(
        config: &ModelConfig,
        activation: Activation,
        zero_init: bool,
        rng_ctx: &DeterministicRngContext<B>,
        seed_offset: u64,
    ) -> Result<Self> {
        let emsize = config.emsize;
        let device = rng_ctx.device();
        let layer_norm = || LayerNormConfig::new(emsize).with_epsilon(LAYER_NORM_EPS).init(device);

        Ok(Self {
            self_attn_between_features: MultiHeadAttention::new(
                emsize,
                config.nhead,
                zero_init,
                rng_ctx,
                seed_offset,
            )?,
            self_attn_between_items: MultiHeadAttention::new(
                emsize,
                config.nhead,
                zero_init,
                rng_ctx,
                seed_offset + 10,
            )?,
            mlp: Mlp::new(
                emsize,
                config.nhid(),
                emsize,
                activation,
                false,
                zero_init,
                rng_ctx,
                seed_offset,
            )?,
            layer_norm_features: layer_norm(),
            layer_norm_items: layer_norm(),
            layer_norm_mlp: layer_norm(),
            save_peak_mem_factor: Ignored(None),
            trainset_cache: Ignored(None),
        })
    }

    pub fn has_trainset_cache(&self) -> bool {
        self.trainset_cache.is_some()
    }

    /// Keys/values for the item attention, `[batch * groups, rows, emsize]`.
    fn item_attention_source(
        &mut self,
        items: &Tensor<B, 3>,
        single_eval_pos: usize,
        cache_trainset_representation: bool,
        att_src: Option<Tensor<B, 4>>,
        [batch, seq_len, groups, emsize]: [usize; 4],
    ) -> Result<Tensor<B, 3>> {
        if let Some(src) = att_src {
            if single_eval_pos != 0 || cache_trainset_representation {
                return Err(TransformerError::usage(
                    "att_src cannot be combined with single_eval_pos or the training-set cache",
                ));
            }
            let [src_batch, src_rows, src_groups, src_emsize] = src.dims();
            if src_batch != batch || src_groups != groups || src_emsize != emsize {
                return Err(TransformerError::shape(
                    "att_src",
                    &[batch, src_rows, groups, emsize],
                    &[src_batch, src_rows, src_groups, src_emsize],
                ));
            }
            return Ok(src.swap_dims(1, 2).reshape([batch * groups, src_rows, emsize]));
        }

        if single_eval_pos == 0 {
            if !cache_trainset_representation {
                return Err(TransformerError::usage(
                    "single_eval_pos is 0 and no att_src was given: no rows to attend to",
                ));
            }
            let data = (*self.trainset_cache).clone().ok_or_else(|| {
                TransformerError::usage("no cached training-set representation to attend to")
            })?;
            let cached = Tensor::<B, 3>::from_data(data, &items.device());
            let [tokens, _, cached_emsize] = cached.dims();
            if tokens != batch * groups || cached_emsize != emsize {
                return Err(TransformerError::shape(
                    "cached training-set representation",
                    &[batch * groups, emsize],
                    &[tokens, cached_emsize],
                ));
            }
            trace!("item attention uses cached training rows");
            return Ok(cached);
        }

        if single_eval_pos > seq_len {
            return Err(TransformerError::usage(format!(
                "single_eval_pos {single_eval_pos} exceeds sequence length {seq_len}"
            )));
        }
        let train_rows = items
            .clone()
            .slice([0..batch * groups, 0..single_eval_pos, 0..emsize]);
        if cache_trainset_representation {
            self.trainset_cache.0 = Some(train_rows.clone().detach().into_data());
        }
        Ok(train_rows)
    }
}

impl<B: Backend> EncoderLayer<B> for PerFeatureEncoderLayer<B> {
    fn apply(
        &mut self,
        state: Tensor<B, 4>,
        single_eval_pos: usize,
        cache_trainset_representation: bool,
        att_src: Option<Tensor<B, 4>>,
    ) -> Result<Tensor<B, 4>> {
        let dims = state.dims();
        let [batch, seq_len, groups, emsize] = dims;

        // Attention between the feature groups of one row.
        let tokens = state.reshape([batch * seq_len, groups, emsize]);
        let attended = self
            .self_attn_between_features
            .forward(tokens.clone(), tokens.clone())?;
        let x = self.layer_norm_features.forward(tokens + attended);

        // Attention between rows, per feature group.
        let items = x
            .reshape([batch, seq_len, groups, emsize])
            .swap_dims(1, 2)
            .reshape([batch * groups, seq_len, emsize]);
        let kv = self.item_attention_source(
            &items,
            single_eval_pos,
            cache_trainset_representation,
            att_src,
            dims,
        )?;
        let attended = self.self_attn_between_items.forward(items.clone(), kv)?;
        let x = self.layer_norm_items.forward(items + attended);

        let mlp_out = self.mlp.forward_chunked(x.clone(), *self.save_peak_mem_factor);
        let x = self.layer_norm_mlp.forward(x + mlp_out);

        Ok(x.reshape([batch, groups, seq_len, emsize]).swap_dims(1, 2))
    }

    fn save_peak_mem_factor(&self) -> Option<usize> {
        *self.save_peak_mem_factor
    }

    fn set_save_peak_mem_factor(&mut self, factor: Option<usize>) {
        self.save_peak_mem_factor.0 = factor;
    }

    fn empty_trainset_representation_cache(&mut self) {
        self.trainset_cache.0 = None;
    }
}
