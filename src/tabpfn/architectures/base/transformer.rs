//! The per-feature transformer and its forward pipeline.
//!
//! Features are grouped, every group of every row becomes a token, and the
//! row's target becomes one extra token. Layers alternate attention between
//! the tokens of a row and attention between rows; evaluation rows only ever
//! attend to training rows, so their targets cannot leak into predictions.

use burn::{
    module::{Ignored, Module},
    prelude::*,
    tensor::{ElementConversion, Int},
};
use log::{debug, trace};
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{
    config::{FeaturePositionalEmbedding, LayerCounts, ModelConfig, TransformerOptions, LEARNED_EMBEDDING_VOCAB},
    eigen::NalgebraEigenSolver,
    embedding_cache::EmbeddingCache,
    encoders::{InputEncoder, SequentialEncoder},
    error::{Result, TransformerError},
    graph::{graph_positional_encodings, DataDAG},
    inputs::{
        align_target_streams, group_features, pad_features_to_group, remap_categorical_indices,
        FeatureInput, NamedTensors, TargetInput, TargetStream, MAIN_KEY,
    },
    layer::{EncoderLayer, PerFeatureEncoderLayer},
    layer_stack::{LayerCall, LayerStack},
    linear::{DeterministicEmbedding, DeterministicLinear},
    mlp::{Activation, Mlp},
    rng::{isolate_rng, normal_values, tensor_from_values, uniform_values, with_global_rng, DeterministicRngContext},
};

pub const STANDARD_HEAD: &str = "standard";
pub const TRAIN_EMBEDDINGS_KEY: &str = "train_embeddings";
pub const TEST_EMBEDDINGS_KEY: &str = "test_embeddings";

/// Learned global tokens the training rows are compressed into.
pub const COMPRESSION_TOKENS: usize = 512;
const COMPRESSION_LAYERS: usize = 2;

// Parameter seed offsets, see `DeterministicRngContext`.
const ENCODER_LAYERS_OFFSET: u64 = 10_000;
const DECODER_LAYERS_OFFSET: u64 = 500_000;
const COMPRESSION_LAYERS_OFFSET: u64 = 900_000;
const LAYER_STRIDE: u64 = 1_000;

/// Number of NaN entries in a tensor.
pub fn count_nan<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> i64 {
    tensor
        .clone()
        .is_nan()
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>()
}

/// Named readout MLP applied to the evaluation-row embeddings.
#[derive(Module, Debug)]
pub struct DecoderHead<B: Backend> {
    name: Ignored<String>,
    mlp: Mlp<B>,
}

impl<B: Backend> DecoderHead<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `[rows, batch, emsize]` to `[rows, batch, n_out]`.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [rows, batch_size, _] = x.dims();
        if rows == 0 {
            return Tensor::zeros([0, batch_size, self.mlp.linear2.output_dim()], &x.device());
        }
        self.mlp.forward(x)
    }
}

/// Per-call options shared by every entry point.
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Rows before this index are training rows.
    pub single_eval_pos: Option<usize>,
    /// Return only the "standard" head instead of every output.
    pub only_return_standard_out: bool,
    /// One DAG per batch element (a prefix of the batch is allowed).
    pub data_dags: Option<Vec<DataDAG>>,
    /// Categorical feature indices per batch element.
    pub categorical_inds: Option<Vec<Vec<usize>>>,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            single_eval_pos: None,
            only_return_standard_out: true,
            data_dags: None,
            categorical_inds: None,
        }
    }
}

/// Keys accepted by [`ForwardOptions::from_json`].
///
/// `half_layers` is not among them: truncated runs are only available
/// through [`PerFeatureTransformer::get_embedding`].
pub const SUPPORTED_FORWARD_KEYS: [&str; 3] = [
    "single_eval_pos",
    "only_return_standard_out",
    "categorical_inds",
];

#[derive(Deserialize)]
struct ForwardFlags {
    #[serde(default)]
    single_eval_pos: Option<usize>,
    #[serde(default = "default_only_standard")]
    only_return_standard_out: bool,
    #[serde(default)]
    categorical_inds: Option<Vec<Vec<usize>>>,
}

fn default_only_standard() -> bool {
    true
}

impl ForwardOptions {
    pub fn with_single_eval_pos(mut self, single_eval_pos: usize) -> Self {
        self.single_eval_pos = Some(single_eval_pos);
        self
    }

    pub fn with_all_outputs(mut self) -> Self {
        self.only_return_standard_out = false;
        self
    }

    pub fn with_data_dags(mut self, data_dags: Vec<DataDAG>) -> Self {
        self.data_dags = Some(data_dags);
        self
    }

    pub fn with_categorical_inds(mut self, categorical_inds: Vec<Vec<usize>>) -> Self {
        self.categorical_inds = Some(categorical_inds);
        self
    }

    /// Parse keyword options from a JSON object, naming any unsupported keys.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| TransformerError::usage("forward options must be a JSON object"))?;
        let mut unsupported: Vec<&str> = object
            .keys()
            .map(String::as_str)
            .filter(|key| !SUPPORTED_FORWARD_KEYS.contains(key))
            .collect();
        if !unsupported.is_empty() {
            unsupported.sort_unstable();
            return Err(TransformerError::usage(format!(
                "unsupported forward options: {}",
                unsupported.join(", ")
            )));
        }

        let flags: ForwardFlags = serde_json::from_value(value.clone())
            .map_err(|e| TransformerError::usage(format!("invalid forward options: {e}")))?;
        Ok(Self {
            single_eval_pos: flags.single_eval_pos,
            only_return_standard_out: flags.only_return_standard_out,
            data_dags: None,
            categorical_inds: flags.categorical_inds,
        })
    }
}

/// Result of a forward call, all tensors `[eval_rows, batch, width]`
/// except `train_embeddings` (`[train_rows, batch, emsize]`).
#[derive(Debug, Clone)]
pub enum ForwardOutput<B: Backend> {
    Standard(Tensor<B, 3>),
    All(BTreeMap<String, Tensor<B, 3>>),
}

impl<B: Backend> ForwardOutput<B> {
    /// The "standard" head output.
    pub fn standard(self) -> Option<Tensor<B, 3>> {
        match self {
            Self::Standard(out) => Some(out),
            Self::All(mut outputs) => outputs.remove(STANDARD_HEAD),
        }
    }

    pub fn into_map(self) -> Option<BTreeMap<String, Tensor<B, 3>>> {
        match self {
            Self::Standard(_) => None,
            Self::All(outputs) => Some(outputs),
        }
    }
}

/// `E` encodes the grouped features, `Y` the targets.
#[derive(Module, Debug)]
pub struct PerFeatureTransformer<B: Backend, E = SequentialEncoder<B>, Y = SequentialEncoder<B>> {
    encoder: E,
    y_encoder: Y,
    transformer_encoder: LayerStack<B>,
    transformer_decoder: Option<LayerStack<B>>,
    global_att_embeddings_for_compression: Option<DeterministicEmbedding<B>>,
    encoder_compression_layer: Option<LayerStack<B>>,
    decoder_heads: Vec<DecoderHead<B>>,
    feature_positional_embedding_embeddings: Option<DeterministicEmbedding<B>>,
    feature_positional_embedding_projection: Option<DeterministicLinear<B>>,
    ninp: Ignored<usize>,
    features_per_group: Ignored<usize>,
    n_out: Ignored<usize>,
    feature_positional_embedding: Ignored<Option<FeaturePositionalEmbedding>>,
    dag_pos_enc_dim: Ignored<Option<usize>>,
    cache_trainset_representation: Ignored<bool>,
    seed: Ignored<u64>,
    cached_embeddings: Ignored<EmbeddingCache>,
    eigen_solver: Ignored<NalgebraEigenSolver>,
}

fn build_stack<B: Backend>(
    config: &ModelConfig,
    options: &TransformerOptions,
    rng_ctx: &DeterministicRngContext<B>,
    num_layers: usize,
    base_offset: u64,
    min_num_layers_layer_dropout: Option<usize>,
) -> Result<LayerStack<B>> {
    let make_layer = |offset: u64| {
        PerFeatureEncoderLayer::new(config, options.activation, options.zero_init, rng_ctx, offset)
    };
    if options.repeat_same_layer {
        let layer = make_layer(base_offset)?;
        LayerStack::new(
            |_| Ok(layer.clone()),
            num_layers,
            config.recompute_layer,
            min_num_layers_layer_dropout,
        )
    } else {
        LayerStack::new(
            |i| make_layer(base_offset + i as u64 * LAYER_STRIDE),
            num_layers,
            config.recompute_layer,
            min_num_layers_layer_dropout,
        )
    }
}

impl<B: Backend> PerFeatureTransformer<B> {
    /// Model with the default encoders.
    pub fn new(config: &ModelConfig, options: &TransformerOptions, device: &B::Device) -> Result<Self> {
        config.validate_consistent()?;
        let rng_ctx = DeterministicRngContext::<B>::new(config.seed, device.clone());
        let encoder =
            SequentialEncoder::default_x_encoder(config.features_per_group, config.emsize, &rng_ctx)?;
        let y_encoder = SequentialEncoder::default_y_encoder(config.emsize, &rng_ctx)?;
        Self::with_encoders(config, options, encoder, y_encoder, device)
    }
}

impl<B, E, Y> PerFeatureTransformer<B, E, Y>
where
    B: Backend,
    E: InputEncoder<B> + Module<B>,
    Y: InputEncoder<B> + Module<B>,
{
    /// Model with caller-supplied feature and target encoders.
    ///
    /// The feature encoder sees `[seq, batch * groups, features_per_group]`
    /// streams, the target encoder `[seq, batch, channels]`; both must
    /// produce `emsize` channels.
    pub fn with_encoders(
        config: &ModelConfig,
        options: &TransformerOptions,
        encoder: E,
        y_encoder: Y,
        device: &B::Device,
    ) -> Result<Self> {
        config.validate_consistent()?;
        if options.n_out == 0 {
            return Err(TransformerError::config("n_out must be at least 1"));
        }
        let counts = LayerCounts::resolve(config, options)?;
        let rng_ctx = DeterministicRngContext::<B>::new(config.seed, device.clone());
        let emsize = config.emsize;

        let mut transformer_encoder = build_stack(
            config,
            options,
            &rng_ctx,
            counts.encoder,
            ENCODER_LAYERS_OFFSET,
            options.min_num_layers_layer_dropout,
        )?;
        for layer in transformer_encoder.layers_mut() {
            layer.set_save_peak_mem_factor(options.save_peak_mem_factor);
        }

        let transformer_decoder = counts
            .decoder
            .map(|n| build_stack(config, options, &rng_ctx, n, DECODER_LAYERS_OFFSET, None))
            .transpose()?;

        let (global_att_embeddings_for_compression, encoder_compression_layer) =
            if options.use_encoder_compression_layer {
                (
                    Some(rng_ctx.create_deterministic_embedding(COMPRESSION_TOKENS, emsize, 300)?),
                    Some(build_stack(
                        config,
                        options,
                        &rng_ctx,
                        COMPRESSION_LAYERS,
                        COMPRESSION_LAYERS_OFFSET,
                        None,
                    )?),
                )
            } else {
                (None, None)
            };

        let standard_head = DecoderHead {
            name: Ignored(STANDARD_HEAD.to_string()),
            mlp: Mlp::new(
                emsize,
                config.nhid(),
                options.n_out,
                Activation::GELU,
                true,
                false,
                &rng_ctx,
                600,
            )?,
        };

        let (feature_positional_embedding_embeddings, feature_positional_embedding_projection) =
            match config.feature_positional_embedding {
                Some(FeaturePositionalEmbedding::Learned) => (
                    Some(rng_ctx.create_deterministic_embedding(LEARNED_EMBEDDING_VOCAB, emsize, 200)?),
                    None,
                ),
                Some(FeaturePositionalEmbedding::Subspace) => (
                    None,
                    Some(rng_ctx.create_deterministic_linear(emsize / 4, emsize, true, 210)?),
                ),
                _ => (None, None),
            };

        debug!(
            "built transformer: {} encoder layers, {:?} decoder layers, compression: {}",
            counts.encoder, counts.decoder, options.use_encoder_compression_layer
        );

        Ok(Self {
            encoder,
            y_encoder,
            transformer_encoder,
            transformer_decoder,
            global_att_embeddings_for_compression,
            encoder_compression_layer,
            decoder_heads: vec![standard_head],
            feature_positional_embedding_embeddings,
            feature_positional_embedding_projection,
            ninp: Ignored(emsize),
            features_per_group: Ignored(config.features_per_group),
            n_out: Ignored(options.n_out),
            feature_positional_embedding: Ignored(config.feature_positional_embedding),
            dag_pos_enc_dim: Ignored(config.dag_pos_enc_dim),
            cache_trainset_representation: Ignored(options.cache_trainset_representation),
            seed: Ignored(config.seed),
            cached_embeddings: Ignored(EmbeddingCache::default()),
            eigen_solver: Ignored(NalgebraEigenSolver::default()),
        })
    }

    pub fn ninp(&self) -> usize {
        *self.ninp
    }

    pub fn n_out(&self) -> usize {
        *self.n_out
    }

    pub fn decoder_head_names(&self) -> Vec<&str> {
        self.decoder_heads.iter().map(DecoderHead::name).collect()
    }

    pub fn encoder_stack(&self) -> &LayerStack<B> {
        &self.transformer_encoder
    }

    pub fn decoder_stack(&self) -> Option<&LayerStack<B>> {
        self.transformer_decoder.as_ref()
    }

    pub fn has_cached_embeddings(&self) -> bool {
        self.cached_embeddings.is_populated()
    }

    /// Train/test call: rows of `train_x` are training rows with targets
    /// `train_y`, rows of `test_x` are evaluated.
    pub fn forward_train_test(
        &mut self,
        train_x: Tensor<B, 3>,
        train_y: impl Into<TargetStream<B>>,
        test_x: Option<Tensor<B, 3>>,
        options: ForwardOptions,
    ) -> Result<ForwardOutput<B>> {
        if options.single_eval_pos.is_some() {
            return Err(TransformerError::usage(
                "single_eval_pos is implied by the training targets and cannot be passed",
            ));
        }

        let train_y: TargetStream<B> = train_y.into();
        let single_eval_pos = train_y.len();
        let [train_rows, batch_size, num_features] = train_x.dims();
        if train_rows != single_eval_pos {
            return Err(TransformerError::shape(
                "train_x rows vs train_y rows",
                &[single_eval_pos],
                &[train_rows],
            ));
        }

        let x = match test_x {
            Some(test_x) => {
                let [_, test_batch, test_features] = test_x.dims();
                if test_batch != batch_size || test_features != num_features {
                    return Err(TransformerError::shape(
                        "test_x (batch, features)",
                        &[batch_size, num_features],
                        &[test_batch, test_features],
                    ));
                }
                Tensor::cat(vec![train_x, test_x], 0)
            }
            None => train_x,
        };

        let x = FeatureInput::from(x).into_named()?;
        let y = TargetInput::from(train_y).into_named()?;
        self.run_forward(
            x,
            Some(y),
            ForwardOptions {
                single_eval_pos: Some(single_eval_pos),
                ..options
            },
        )
    }

    /// Call with the full sequence `x`, targets `y` (None only when
    /// evaluating against a cached training set) and `single_eval_pos`.
    pub fn forward_xy(
        &mut self,
        x: impl Into<FeatureInput<B>>,
        y: Option<TargetInput<B>>,
        options: ForwardOptions,
    ) -> Result<ForwardOutput<B>> {
        let x = x.into().into_named()?;
        let y = y.map(TargetInput::into_named).transpose()?;
        self.run_forward(x, y, options)
    }

    /// Same as [`Self::forward_xy`]; style conditioning is not supported and
    /// a present style is rejected.
    pub fn forward_styled_xy(
        &mut self,
        style: Option<Tensor<B, 2>>,
        x: impl Into<FeatureInput<B>>,
        y: Option<TargetInput<B>>,
        options: ForwardOptions,
    ) -> Result<ForwardOutput<B>> {
        if style.is_some() {
            return Err(TransformerError::usage("style conditioning is not supported"));
        }
        self.forward_xy(x, y, options)
    }

    /// Run the encoder stack directly on an embedded token grid
    /// `[batch, seq, slots, emsize]`.
    pub fn get_embedding(
        &mut self,
        x: Tensor<B, 4>,
        half_layers: bool,
        single_eval_pos: usize,
    ) -> Result<Tensor<B, 4>> {
        self.transformer_encoder
            .forward(x, half_layers, &LayerCall::new(single_eval_pos))
    }

    /// Set the MLP chunking factor of every encoder layer.
    pub fn reset_save_peak_mem_factor(&mut self, factor: Option<usize>) {
        for layer in self.transformer_encoder.layers_mut() {
            layer.set_save_peak_mem_factor(factor);
        }
    }

    /// Drop the cached training rows of the decoder if there is one,
    /// otherwise of the encoder.
    pub fn empty_trainset_representation_cache(&mut self) {
        let stack = match self.transformer_decoder.as_mut() {
            Some(decoder) => decoder,
            None => &mut self.transformer_encoder,
        };
        for layer in stack.layers_mut() {
            layer.empty_trainset_representation_cache();
        }
    }

    fn run_forward(
        &mut self,
        x: NamedTensors<B, 3>,
        y: Option<NamedTensors<B, 3>>,
        options: ForwardOptions,
    ) -> Result<ForwardOutput<B>> {
        let ForwardOptions {
            single_eval_pos,
            only_return_standard_out,
            data_dags,
            categorical_inds,
        } = options;
        let cache_trainset = *self.cache_trainset_representation;
        let has_train_rows = single_eval_pos.is_some_and(|pos| pos > 0);

        if cache_trainset && !has_train_rows {
            if y.is_some() {
                return Err(TransformerError::usage(
                    "targets cannot be given when evaluating against the cached training set",
                ));
            }
        } else {
            if y.is_none() {
                return Err(TransformerError::usage("targets y are required"));
            }
            if !has_train_rows {
                return Err(TransformerError::usage(
                    "single_eval_pos must be a positive number of training rows",
                ));
            }
        }

        let main = x
            .get(MAIN_KEY)
            .ok_or_else(|| TransformerError::usage(format!("feature input has no '{MAIN_KEY}' stream")))?;
        let [seq_len, batch_size, num_features] = main.dims();
        let device = main.device();
        let single_eval_pos_ = single_eval_pos.unwrap_or(0);
        if num_features == 0 || seq_len == 0 || batch_size == 0 {
            return Err(TransformerError::usage(format!(
                "x must have at least one row, batch element and feature, got [{seq_len}, {batch_size}, {num_features}]"
            )));
        }
        if single_eval_pos_ > seq_len {
            return Err(TransformerError::usage(format!(
                "single_eval_pos {single_eval_pos_} exceeds the {seq_len} rows of x"
            )));
        }
        let dag_encodings_configured = (*self.dag_pos_enc_dim).is_some_and(|k| k > 0);
        match &data_dags {
            Some(_) if !dag_encodings_configured => {
                return Err(TransformerError::config(
                    "data_dags were given but dag_pos_enc_dim is not set",
                ))
            }
            Some(dags) if dags.len() > batch_size => {
                return Err(TransformerError::usage(format!(
                    "{} DAGs given for a batch of {batch_size}",
                    dags.len()
                )));
            }
            None if dag_encodings_configured => {
                return Err(TransformerError::config(
                    "dag_pos_enc_dim is set but no data_dags were given",
                ))
            }
            _ => {}
        }
        debug!(
            "forward: seq {seq_len}, batch {batch_size}, features {num_features}, single_eval_pos {single_eval_pos_}"
        );

        let y = y.unwrap_or_else(|| {
            NamedTensors::from([(MAIN_KEY.to_string(), Tensor::zeros([0, batch_size, 1], &device))])
        });

        let fpg = *self.features_per_group;
        let x: BTreeMap<String, Tensor<B, 4>> = x
            .into_iter()
            .map(|(key, stream)| (key, group_features(pad_features_to_group(stream, fpg), fpg)))
            .collect();
        let n_groups = x[MAIN_KEY].dims()[2];

        let categorical_inds = categorical_inds
            .map(|inds| remap_categorical_indices(&inds, batch_size, n_groups, fpg))
            .transpose()?;

        let y = align_target_streams(y, seq_len, single_eval_pos_)?;
        let emsize = *self.ninp;

        let embedded_y = self
            .y_encoder
            .encode(&y, single_eval_pos_, cache_trainset, None)?;
        if embedded_y.dims() != [seq_len, batch_size, emsize] {
            return Err(TransformerError::shape(
                "y encoder output",
                &[seq_len, batch_size, emsize],
                &embedded_y.dims(),
            ));
        }
        let embedded_y = embedded_y.swap_dims(0, 1);
        let nan_count = count_nan(&embedded_y);
        if nan_count > 0 {
            return Err(TransformerError::data_quality(
                "y_encoder",
                format!(
                    "{nan_count} NaN values in the embedded targets; the target encoder must handle NaN"
                ),
            ));
        }

        let flat_x: NamedTensors<B, 3> = x
            .into_iter()
            .map(|(key, stream)| {
                let [b, s, g, n] = stream.dims();
                (key, stream.swap_dims(0, 1).reshape([s, b * g, n]))
            })
            .collect();
        let encoder_categorical = if self.encoder.accepts_categorical_inds() {
            categorical_inds.as_deref()
        } else {
            None
        };
        let embedded_x = self.encoder.encode(
            &flat_x,
            single_eval_pos_,
            cache_trainset,
            encoder_categorical,
        )?;
        if embedded_x.dims() != [seq_len, batch_size * n_groups, emsize] {
            return Err(TransformerError::shape(
                "x encoder output",
                &[seq_len, batch_size * n_groups, emsize],
                &embedded_x.dims(),
            ));
        }
        let embedded_x = embedded_x
            .reshape([seq_len, batch_size, n_groups, emsize])
            .swap_dims(0, 1);

        let (embedded_x, embedded_y) = self.add_embeddings(
            embedded_x,
            embedded_y,
            data_dags.as_deref(),
            num_features,
            cache_trainset && single_eval_pos.is_some(),
            cache_trainset && single_eval_pos.is_none(),
        )?;

        let x_nan = count_nan(&embedded_x);
        let y_nan = count_nan(&embedded_y);
        if x_nan + y_nan > 0 {
            return Err(TransformerError::data_quality(
                "embedded_input",
                format!("{x_nan} NaN values from the features, {y_nan} from the targets"),
            ));
        }
        let embedded_input = Tensor::cat(vec![embedded_x, embedded_y.unsqueeze_dim(2)], 2);
        let slots = n_groups + 1;
        trace!("embedded input shape {:?}", embedded_input.dims());

        let encoder_input = if self.transformer_decoder.is_some() {
            embedded_input
                .clone()
                .slice([0..batch_size, 0..single_eval_pos_, 0..slots, 0..emsize])
        } else {
            embedded_input.clone()
        };
        let mut encoder_out = self.transformer_encoder.forward(
            encoder_input,
            false,
            &LayerCall::new(single_eval_pos_).with_cache(cache_trainset),
        )?;

        if let Some(decoder) = self.transformer_decoder.as_mut() {
            let encoded_rows = encoder_out.dims()[1];
            if encoded_rows != single_eval_pos_ {
                return Err(TransformerError::shape(
                    "encoder output rows",
                    &[single_eval_pos_],
                    &[encoded_rows],
                ));
            }

            let att_src = match (
                &self.global_att_embeddings_for_compression,
                self.encoder_compression_layer.as_mut(),
            ) {
                (Some(tokens), Some(compression)) => {
                    let table = tokens.weight();
                    let [n_tokens, _] = table.dims();
                    let grid = table
                        .reshape([1, n_tokens, 1, emsize])
                        .expand([batch_size, n_tokens, slots, emsize]);
                    compression.forward(
                        grid,
                        false,
                        &LayerCall::new(0).with_att_src(encoder_out.clone()),
                    )?
                }
                _ => encoder_out.clone(),
            };

            if single_eval_pos_ < seq_len {
                let test_input = embedded_input.slice([
                    0..batch_size,
                    single_eval_pos_..seq_len,
                    0..slots,
                    0..emsize,
                ]);
                let test_out =
                    decoder.forward(test_input, false, &LayerCall::new(0).with_att_src(att_src))?;
                encoder_out = Tensor::cat(vec![encoder_out, test_out], 1);
            }
        }

        let last = slots - 1;
        let target_slot = |from: usize, to: usize| -> Tensor<B, 3> {
            if from == to {
                return Tensor::zeros([0, batch_size, emsize], &device);
            }
            encoder_out
                .clone()
                .slice([0..batch_size, from..to, last..slots, 0..emsize])
                .reshape([batch_size, to - from, emsize])
                .swap_dims(0, 1)
        };
        let test_encoder_out = target_slot(single_eval_pos_, seq_len);

        if only_return_standard_out {
            let head = self
                .decoder_heads
                .iter()
                .find(|head| head.name() == STANDARD_HEAD)
                .ok_or_else(|| TransformerError::config("no standard decoder head"))?;
            return Ok(ForwardOutput::Standard(head.forward(test_encoder_out)));
        }

        let mut outputs: BTreeMap<String, Tensor<B, 3>> = self
            .decoder_heads
            .iter()
            .map(|head| (head.name().to_string(), head.forward(test_encoder_out.clone())))
            .collect();
        outputs.insert(TRAIN_EMBEDDINGS_KEY.to_string(), target_slot(0, single_eval_pos_));
        outputs.insert(TEST_EMBEDDINGS_KEY.to_string(), test_encoder_out);
        Ok(ForwardOutput::All(outputs))
    }

    /// Add per-group feature embeddings (sampled under a fixed seed, or
    /// taken from the cache) and, with DAGs, graph positional encodings.
    fn add_embeddings(
        &mut self,
        x: Tensor<B, 4>,
        y: Tensor<B, 3>,
        data_dags: Option<&[DataDAG]>,
        num_features: usize,
        cache_embeddings: bool,
        use_cached_embeddings: bool,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 3>)> {
        let [batch_size, seq_len, n_groups, emsize] = x.dims();
        let device = x.device();
        let dags_present = data_dags.is_some();

        if use_cached_embeddings {
            if let Some(embs) = self
                .cached_embeddings
                .consult::<B>(dags_present, n_groups, &device)?
            {
                let embs = embs.unsqueeze::<4>().expand([batch_size, seq_len, n_groups, emsize]);
                return Ok((x + embs, y));
            }
        }

        let embs = isolate_rng(*self.seed, || {
            self.sample_feature_embeddings(n_groups, emsize, &device)
        })?;
        let x = match &embs {
            Some(embs) => {
                x + embs
                    .clone()
                    .unsqueeze::<4>()
                    .expand([batch_size, seq_len, n_groups, emsize])
            }
            None => x,
        };
        self.cached_embeddings
            .0
            .store(embs.as_ref(), cache_embeddings, dags_present);

        match (data_dags, *self.dag_pos_enc_dim) {
            (Some(dags), Some(k)) => self.add_dag_embeddings(x, y, dags, num_features, k),
            _ => Ok((x, y)),
        }
    }

    /// `[groups, emsize]` embeddings drawn from the global generator.
    fn sample_feature_embeddings(
        &self,
        n_groups: usize,
        emsize: usize,
        device: &B::Device,
    ) -> Result<Option<Tensor<B, 2>>> {
        let Some(kind) = *self.feature_positional_embedding else {
            return Ok(None);
        };
        let embs = match kind {
            FeaturePositionalEmbedding::NormalRandVec => {
                let values = with_global_rng(|rng| normal_values(rng, n_groups * emsize));
                tensor_from_values(values, [n_groups, emsize], device)
            }
            FeaturePositionalEmbedding::UniRandVec => {
                let values = with_global_rng(|rng| uniform_values(rng, n_groups * emsize));
                tensor_from_values(values, [n_groups, emsize], device)
            }
            FeaturePositionalEmbedding::Learned => {
                let table = self
                    .feature_positional_embedding_embeddings
                    .as_ref()
                    .ok_or_else(|| TransformerError::config("learned feature embeddings are missing"))?;
                let vocab = table.num_embeddings();
                let indices: Vec<i64> = with_global_rng(|rng| {
                    (0..n_groups).map(|_| rng.random_range(0..vocab) as i64).collect()
                });
                table.forward(Tensor::<B, 1, Int>::from_ints(indices.as_slice(), device))
            }
            FeaturePositionalEmbedding::Subspace => {
                let projection = self
                    .feature_positional_embedding_projection
                    .as_ref()
                    .ok_or_else(|| TransformerError::config("subspace projection is missing"))?;
                let sub_dim = projection.input_dim();
                let values = with_global_rng(|rng| normal_values(rng, n_groups * sub_dim));
                projection.forward(tensor_from_values(values, [n_groups, sub_dim], device))
            }
        };
        Ok(Some(embs))
    }

    /// Add centred DAG positional encodings to the first `k` channels of
    /// each feature token and the target token of the matching batch element.
    fn add_dag_embeddings(
        &self,
        mut x: Tensor<B, 4>,
        mut y: Tensor<B, 3>,
        dags: &[DataDAG],
        num_features: usize,
        k: usize,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 3>)> {
        let [_, seq_len, n_groups, _] = x.dims();
        if n_groups != num_features {
            return Err(TransformerError::usage(format!(
                "DAG positional encodings need one feature per group, got {num_features} features in {n_groups} groups"
            )));
        }
        let device = x.device();

        for (b, dag) in dags.iter().enumerate() {
            let encoded =
                with_global_rng(|rng| graph_positional_encodings(dag, k, &*self.eigen_solver, rng))?;

            let mut feature_pe = vec![0.0f32; num_features * k];
            let mut target_pe = vec![0.0f32; k];
            for node in encoded.node_indices() {
                let meta = &encoded[node];
                let Some(pe) = &meta.positional_encoding else {
                    continue;
                };
                for &f in &meta.feature_idxs {
                    if f >= num_features {
                        return Err(TransformerError::usage(format!(
                            "DAG {b} references feature {f} but there are only {num_features}"
                        )));
                    }
                    feature_pe[f * k..(f + 1) * k].copy_from_slice(pe);
                }
                for &t in &meta.target_idxs {
                    if t != 0 {
                        return Err(TransformerError::usage(format!(
                            "DAG {b} references target {t} but there is only one target"
                        )));
                    }
                    target_pe.copy_from_slice(pe);
                }
            }

            for c in 0..k {
                let mean = (0..num_features).map(|f| feature_pe[f * k + c]).sum::<f32>()
                    / num_features as f32;
                for f in 0..num_features {
                    feature_pe[f * k + c] -= mean;
                }
                target_pe[c] -= mean;
            }

            let features = tensor_from_values::<B, 4>(feature_pe, [1, 1, num_features, k], &device)
                .expand([1, seq_len, num_features, k]);
            let ranges = [b..b + 1, 0..seq_len, 0..n_groups, 0..k];
            let current = x.clone().slice(ranges.clone());
            x = x.slice_assign(ranges, current + features);

            let targets =
                tensor_from_values::<B, 3>(target_pe, [1, 1, k], &device).expand([1, seq_len, k]);
            let ranges = [b..b + 1, 0..seq_len, 0..k];
            let current = y.clone().slice(ranges.clone());
            y = y.slice_assign(ranges, current + targets);
        }

        Ok((x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabpfn::architectures::base::graph::NodeMetadata;
    use crate::tabpfn::architectures::base::rng::seed_global_rng;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn make_test_config() -> ModelConfig {
        ModelConfig {
            emsize: 8,
            features_per_group: 2,
            nhead: 2,
            nhid_factor: 2,
            nlayers: 2,
            seed: 42,
            ..ModelConfig::default()
        }
    }

    fn make_test_options() -> TransformerOptions {
        TransformerOptions {
            n_out: 3,
            zero_init: false,
            ..TransformerOptions::default()
        }
    }

    fn make_test_input(seq: usize, batch: usize, features: usize) -> Tensor<TestBackend, 3> {
        let values: Vec<f32> = (0..seq * batch * features)
            .map(|i| ((i as f32) * 0.71).cos())
            .collect();
        Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &Default::default())
            .reshape([seq, batch, features])
    }

    fn targets(rows: usize, batch: usize) -> Tensor<TestBackend, 2> {
        let values: Vec<f32> = (0..rows * batch).map(|i| (i % 2) as f32).collect();
        Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &Default::default())
            .reshape([rows, batch])
    }

    fn model(config: &ModelConfig, options: &TransformerOptions) -> PerFeatureTransformer<TestBackend> {
        PerFeatureTransformer::new(config, options, &Default::default()).unwrap()
    }

    #[test]
    fn test_count_nan() {
        let t = Tensor::<TestBackend, 2>::from_floats([[1.0, f32::NAN], [f32::NAN, 0.0]], &Default::default());
        assert_eq!(count_nan(&t), 2);
    }

    #[test]
    fn test_forward_options_from_json() {
        let options = ForwardOptions::from_json(&serde_json::json!({
            "single_eval_pos": 3,
            "only_return_standard_out": false
        }))
        .unwrap();
        assert_eq!(options.single_eval_pos, Some(3));
        assert!(!options.only_return_standard_out);

        let err = ForwardOptions::from_json(&serde_json::json!({"foo": 1, "bar": 2, "half_layers": true}))
            .unwrap_err();
        assert!(matches!(err, TransformerError::Usage(msg) if msg.contains("bar, foo")));

        let err = ForwardOptions::from_json(&serde_json::json!({"half_layers": true})).unwrap_err();
        assert!(matches!(err, TransformerError::Usage(msg) if msg.contains("half_layers")));
    }

    #[test]
    fn test_empty_batch_is_usage_error() {
        let mut m = model(&make_test_config(), &make_test_options());
        let err = m
            .forward_xy(
                Tensor::<TestBackend, 3>::zeros([4, 0, 3], &Default::default()),
                Some(Tensor::<TestBackend, 2>::zeros([2, 0], &Default::default()).into()),
                ForwardOptions::default().with_single_eval_pos(2),
            )
            .unwrap_err();
        assert!(matches!(err, TransformerError::Usage(msg) if msg.contains("batch")));
    }

    #[test]
    fn test_odd_feature_count_is_padded() {
        let mut m = model(&make_test_config(), &make_test_options());
        let out = m
            .forward_xy(
                make_test_input(5, 2, 3),
                Some(targets(3, 2).into()),
                ForwardOptions::default().with_single_eval_pos(3),
            )
            .unwrap()
            .standard()
            .unwrap();
        assert_eq!(out.dims(), [2, 2, 3]);
    }

    #[test]
    fn test_missing_targets_is_usage_error() {
        let mut m = model(&make_test_config(), &make_test_options());
        let err = m
            .forward_xy(make_test_input(4, 1, 2), None, ForwardOptions::default().with_single_eval_pos(2))
            .unwrap_err();
        assert!(matches!(err, TransformerError::Usage(_)));
    }

    #[test]
    fn test_style_is_rejected() {
        let mut m = model(&make_test_config(), &make_test_options());
        let style = Tensor::<TestBackend, 2>::zeros([1, 4], &Default::default());
        let err = m
            .forward_styled_xy(
                Some(style),
                make_test_input(4, 1, 2),
                Some(targets(2, 1).into()),
                ForwardOptions::default().with_single_eval_pos(2),
            )
            .unwrap_err();
        assert!(matches!(err, TransformerError::Usage(_)));
    }

    #[test]
    fn test_dags_without_encoding_dim_is_config_error() {
        let mut m = model(&make_test_config(), &make_test_options());
        let err = m
            .forward_xy(
                make_test_input(4, 1, 2),
                Some(targets(2, 1).into()),
                ForwardOptions::default()
                    .with_single_eval_pos(2)
                    .with_data_dags(vec![DataDAG::new()]),
            )
            .unwrap_err();
        assert!(matches!(err, TransformerError::Config(_)));
    }

    #[test]
    fn test_dag_feature_index_out_of_range() {
        let config = ModelConfig {
            features_per_group: 1,
            dag_pos_enc_dim: Some(2),
            ..make_test_config()
        };
        let mut m = model(&config, &make_test_options());
        let mut dag = DataDAG::new();
        let a = dag.add_node(NodeMetadata::new().with_feature_indices(vec![0]));
        let b = dag.add_node(NodeMetadata::new().with_feature_indices(vec![7]));
        dag.add_edge(a, b, ());

        let err = m
            .forward_xy(
                make_test_input(4, 1, 2),
                Some(targets(2, 1).into()),
                ForwardOptions::default()
                    .with_single_eval_pos(2)
                    .with_data_dags(vec![dag]),
            )
            .unwrap_err();
        assert!(matches!(err, TransformerError::Usage(msg) if msg.contains("feature 7")));
    }

    #[test]
    fn test_sampled_embeddings_do_not_disturb_global_rng() {
        let mut m = model(&make_test_config(), &make_test_options());
        seed_global_rng(77);
        let before = crate::tabpfn::architectures::base::rng::global_rng_snapshot();
        m.forward_xy(
            make_test_input(4, 1, 4),
            Some(targets(2, 1).into()),
            ForwardOptions::default().with_single_eval_pos(2),
        )
        .unwrap();
        // Only the layer-count draw consumes the global generator.
        let mut expected = before;
        let _ = expected.random_range(2..=2usize);
        assert_eq!(crate::tabpfn::architectures::base::rng::global_rng_snapshot(), expected);
    }

    #[test]
    fn test_repeat_same_layer_shares_weights() {
        let options = TransformerOptions {
            repeat_same_layer: true,
            ..make_test_options()
        };
        let m = model(&make_test_config(), &options);
        let layers = m.encoder_stack().layers();
        assert_eq!(layers.len(), 2);
        assert_eq!(format!("{:?}", layers[0]), format!("{:?}", layers[1]));
    }
}
