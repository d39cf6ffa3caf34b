//  Copyright (c) Prior Labs GmbH 2025.

use serde::{Deserialize, Serialize};

use super::error::{Result, TransformerError};
use super::mlp::Activation;
use crate::tabpfn::settings::Settings;

/// How per-feature-group positional embeddings are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeaturePositionalEmbedding {
    /// Standard-normal vector of size `emsize` per group.
    NormalRandVec,
    /// Uniform `[-1, 1)` vector of size `emsize` per group.
    UniRandVec,
    /// Random row of a learned table with [`LEARNED_EMBEDDING_VOCAB`] rows.
    Learned,
    /// Standard-normal vector of size `emsize / 4`, projected to `emsize`.
    #[default]
    Subspace,
}

/// Rows of the learned feature-embedding table.
pub const LEARNED_EMBEDDING_VOCAB: usize = 1_000;

/// Architecture hyper-parameters of a [`PerFeatureTransformer`].
///
/// [`PerFeatureTransformer`]: super::transformer::PerFeatureTransformer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// The embedding dimension
    #[serde(default = "default_emsize")]
    pub emsize: usize,

    /// If > 1, the features will be grouped into groups of this size and the attention
    /// is across groups
    #[serde(default = "default_features_per_group")]
    pub features_per_group: usize,

    /// Number of attention heads for both between-item and between-feature attention
    #[serde(default = "default_nhead")]
    pub nhead: usize,

    /// Hidden dimension in the MLP layers is emsize * nhid_factor
    #[serde(default = "default_nhid_factor")]
    pub nhid_factor: usize,

    /// Number of layers in the encoder, each consisting of
    /// a multi-head attention and an MLP layer
    #[serde(default = "default_nlayers")]
    pub nlayers: usize,

    #[serde(default = "default_feature_positional_embedding")]
    pub feature_positional_embedding: Option<FeaturePositionalEmbedding>,

    /// Ask for each PerFeatureEncoderLayer to be recomputed in the backward
    /// pass. The flag does nothing on its own: recomputation only happens when
    /// the model runs on an `Autodiff` backend built with a checkpointing
    /// strategy, and the forward outputs are the same either way.
    #[serde(default = "default_true")]
    pub recompute_layer: bool,

    /// If True, the eval rows are decoded by a separate layer stack
    #[serde(default)]
    pub use_separate_decoder: bool,

    /// Width of the DAG positional encodings, None disables them
    #[serde(default)]
    pub dag_pos_enc_dim: Option<usize>,

    /// Seed for parameter initialization and positional-embedding sampling
    #[serde(default)]
    pub seed: u64,
}

fn default_emsize() -> usize {
    192
}
fn default_features_per_group() -> usize {
    2
}
fn default_nhead() -> usize {
    6
}
fn default_nhid_factor() -> usize {
    4
}
fn default_nlayers() -> usize {
    12
}
fn default_true() -> bool {
    true
}
fn default_feature_positional_embedding() -> Option<FeaturePositionalEmbedding> {
    Some(FeaturePositionalEmbedding::Subspace)
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            emsize: default_emsize(),
            features_per_group: default_features_per_group(),
            nhead: default_nhead(),
            nhid_factor: default_nhid_factor(),
            nlayers: default_nlayers(),
            feature_positional_embedding: default_feature_positional_embedding(),
            recompute_layer: true,
            use_separate_decoder: false,
            dag_pos_enc_dim: None,
            seed: 0,
        }
    }
}

impl ModelConfig {
    pub fn nhid(&self) -> usize {
        self.emsize * self.nhid_factor
    }

    pub fn validate_consistent(&self) -> Result<()> {
        if self.nhead == 0 || self.emsize % self.nhead != 0 {
            return Err(TransformerError::config(format!(
                "emsize ({}) must be divisible by nhead ({})",
                self.emsize, self.nhead
            )));
        }
        if self.features_per_group == 0 {
            return Err(TransformerError::config("features_per_group must be at least 1"));
        }
        if self.nlayers == 0 {
            return Err(TransformerError::config("nlayers must be at least 1"));
        }
        if let Some(k) = self.dag_pos_enc_dim {
            if k > self.emsize {
                return Err(TransformerError::config(format!(
                    "dag_pos_enc_dim ({k}) cannot exceed emsize ({})",
                    self.emsize
                )));
            }
        }
        if self.feature_positional_embedding == Some(FeaturePositionalEmbedding::Subspace)
            && self.emsize < 4
        {
            return Err(TransformerError::config(
                "subspace feature embeddings need emsize >= 4",
            ));
        }
        Ok(())
    }
}

/// Construction options that are not part of the architecture config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerOptions {
    /// Width of the "standard" decoder head output
    #[serde(default = "default_n_out")]
    pub n_out: usize,

    #[serde(default = "default_activation")]
    pub activation: Activation,

    /// Lower bound for the number of encoder layers drawn per call.
    /// None means every call runs all layers.
    #[serde(default)]
    pub min_num_layers_layer_dropout: Option<usize>,

    /// Stack clones of one layer instead of independently initialized layers
    #[serde(default)]
    pub repeat_same_layer: bool,

    /// Zero the output projections of attention and MLP blocks
    #[serde(default = "default_true")]
    pub zero_init: bool,

    /// Decoder depth; defaults to nlayers / 3 when a separate decoder is used
    #[serde(default)]
    pub nlayers_decoder: Option<usize>,

    #[serde(default)]
    pub use_encoder_compression_layer: bool,

    #[serde(default)]
    pub cache_trainset_representation: bool,

    /// Row chunking factor for the layer MLPs
    #[serde(default)]
    pub save_peak_mem_factor: Option<usize>,
}

fn default_n_out() -> usize {
    1
}
fn default_activation() -> Activation {
    Activation::GELU
}

impl Default for TransformerOptions {
    fn default() -> Self {
        Self {
            n_out: default_n_out(),
            activation: default_activation(),
            min_num_layers_layer_dropout: None,
            repeat_same_layer: false,
            zero_init: true,
            nlayers_decoder: None,
            use_encoder_compression_layer: false,
            cache_trainset_representation: false,
            save_peak_mem_factor: None,
        }
    }
}

impl TransformerOptions {
    /// Defaults overridden by the runtime inference settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cache_trainset_representation: settings.inference.cache_trainset_representation,
            save_peak_mem_factor: settings.inference.save_peak_mem_factor,
            ..Self::default()
        }
    }
}

/// Encoder and decoder depths after applying the separate-decoder split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerCounts {
    pub encoder: usize,
    pub decoder: Option<usize>,
}

impl LayerCounts {
    pub fn resolve(config: &ModelConfig, options: &TransformerOptions) -> Result<Self> {
        if options.use_encoder_compression_layer && !config.use_separate_decoder {
            return Err(TransformerError::config(
                "use_encoder_compression_layer requires use_separate_decoder",
            ));
        }
        if !config.use_separate_decoder {
            return Ok(Self {
                encoder: config.nlayers,
                decoder: None,
            });
        }
        if options.cache_trainset_representation {
            return Err(TransformerError::config(
                "cache_trainset_representation is not supported with a separate decoder",
            ));
        }
        match options.nlayers_decoder {
            Some(0) => Err(TransformerError::config("nlayers_decoder must be at least 1")),
            Some(decoder) => Ok(Self {
                encoder: config.nlayers,
                decoder: Some(decoder),
            }),
            None => Ok(Self {
                encoder: (config.nlayers / 3 * 2).max(1),
                decoder: Some((config.nlayers / 3).max(1)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.emsize, 192);
        assert_eq!(config.features_per_group, 2);
        assert_eq!(config.nhead, 6);
        assert_eq!(config.nhid_factor, 4);
        assert_eq!(config.nlayers, 12);
        assert_eq!(
            config.feature_positional_embedding,
            Some(FeaturePositionalEmbedding::Subspace)
        );
        assert!(config.recompute_layer);
        assert!(!config.use_separate_decoder);
        assert_eq!(config.dag_pos_enc_dim, None);
        assert_eq!(config.seed, 0);
        assert_eq!(config.nhid(), 768);
    }

    #[test]
    fn test_validate_consistent() {
        let mut config = ModelConfig::default();
        assert!(config.validate_consistent().is_ok());

        config.emsize = 193;
        assert!(config.validate_consistent().is_err());

        config.emsize = 192;
        config.features_per_group = 0;
        assert!(config.validate_consistent().is_err());

        config.features_per_group = 3;
        assert!(config.validate_consistent().is_ok());

        config.dag_pos_enc_dim = Some(500);
        assert!(matches!(
            config.validate_consistent(),
            Err(TransformerError::Config(_))
        ));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ModelConfig =
            serde_json::from_str(r#"{"emsize": 8, "nhead": 2, "feature_positional_embedding": "normal_rand_vec"}"#)
                .unwrap();
        assert_eq!(config.emsize, 8);
        assert_eq!(config.nlayers, 12);
        assert_eq!(
            config.feature_positional_embedding,
            Some(FeaturePositionalEmbedding::NormalRandVec)
        );

        let config: ModelConfig =
            serde_json::from_str(r#"{"feature_positional_embedding": null}"#).unwrap();
        assert_eq!(config.feature_positional_embedding, None);
    }

    #[test]
    fn test_separate_decoder_split() {
        let mut config = ModelConfig::default();
        config.use_separate_decoder = true;
        let counts = LayerCounts::resolve(&config, &TransformerOptions::default()).unwrap();
        assert_eq!(counts, LayerCounts { encoder: 8, decoder: Some(4) });

        config.nlayers = 2;
        let counts = LayerCounts::resolve(&config, &TransformerOptions::default()).unwrap();
        assert_eq!(counts, LayerCounts { encoder: 1, decoder: Some(1) });

        let options = TransformerOptions {
            nlayers_decoder: Some(3),
            ..TransformerOptions::default()
        };
        let counts = LayerCounts::resolve(&config, &options).unwrap();
        assert_eq!(counts, LayerCounts { encoder: 2, decoder: Some(3) });
    }

    #[test]
    fn test_compression_requires_decoder() {
        let options = TransformerOptions {
            use_encoder_compression_layer: true,
            ..TransformerOptions::default()
        };
        let err = LayerCounts::resolve(&ModelConfig::default(), &options).unwrap_err();
        assert!(matches!(err, TransformerError::Config(_)));
    }

    #[test]
    fn test_options_from_settings() {
        let mut settings = Settings::default();
        settings.inference.cache_trainset_representation = true;
        settings.inference.save_peak_mem_factor = Some(4);
        let options = TransformerOptions::from_settings(&settings);
        assert!(options.cache_trainset_representation);
        assert_eq!(options.save_peak_mem_factor, Some(4));
        assert_eq!(options.n_out, 1);
    }
}
