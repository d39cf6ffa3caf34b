//! Forward-pass inputs and the reshaping they go through before encoding.

use burn::tensor::{backend::Backend, Tensor};
use log::{debug, trace};
use std::collections::BTreeMap;

use super::error::{Result, TransformerError};

/// Key of the primary stream in every named input.
pub const MAIN_KEY: &str = "main";

/// Named tensor streams, ordered by name.
pub type NamedTensors<B, const D: usize> = BTreeMap<String, Tensor<B, D>>;

/// Features: one `[seq, batch, features]` tensor or several named ones.
#[derive(Debug, Clone)]
pub enum FeatureInput<B: Backend> {
    Bare(Tensor<B, 3>),
    Named(NamedTensors<B, 3>),
}

impl<B: Backend> From<Tensor<B, 3>> for FeatureInput<B> {
    fn from(x: Tensor<B, 3>) -> Self {
        Self::Bare(x)
    }
}

impl<B: Backend> From<NamedTensors<B, 3>> for FeatureInput<B> {
    fn from(x: NamedTensors<B, 3>) -> Self {
        Self::Named(x)
    }
}

impl<B: Backend> FeatureInput<B> {
    /// Normalize to named streams. All streams must share `[seq, batch]`.
    pub fn into_named(self) -> Result<NamedTensors<B, 3>> {
        let named = match self {
            Self::Bare(x) => BTreeMap::from([(MAIN_KEY.to_string(), x)]),
            Self::Named(named) => named,
        };
        let main = named.get(MAIN_KEY).ok_or_else(|| {
            TransformerError::usage(format!("feature input has no '{MAIN_KEY}' stream"))
        })?;
        let [seq_len, batch_size, _] = main.dims();
        for (key, tensor) in &named {
            let [s, b, _] = tensor.dims();
            if s != seq_len || b != batch_size {
                debug!("feature stream '{key}' disagrees with '{MAIN_KEY}'");
                return Err(TransformerError::shape(
                    "feature stream (seq, batch)",
                    &[seq_len, batch_size],
                    &[s, b],
                ));
            }
        }
        Ok(named)
    }
}

/// One target stream of rank 1 (`[seq]`), 2 (`[seq, batch]`) or 3.
#[derive(Debug, Clone)]
pub enum TargetStream<B: Backend> {
    Rank1(Tensor<B, 1>),
    Rank2(Tensor<B, 2>),
    Rank3(Tensor<B, 3>),
}

impl<B: Backend> TargetStream<B> {
    /// `[seq, batch, channels]`, appending unit dimensions as needed.
    pub fn into_3d(self) -> Tensor<B, 3> {
        match self {
            Self::Rank1(y) => y.unsqueeze_dim::<2>(1).unsqueeze_dim(2),
            Self::Rank2(y) => y.unsqueeze_dim(2),
            Self::Rank3(y) => y,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Rank1(y) => y.dims()[0],
            Self::Rank2(y) => y.dims()[0],
            Self::Rank3(y) => y.dims()[0],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: Backend> From<Tensor<B, 1>> for TargetStream<B> {
    fn from(y: Tensor<B, 1>) -> Self {
        Self::Rank1(y)
    }
}

impl<B: Backend> From<Tensor<B, 2>> for TargetStream<B> {
    fn from(y: Tensor<B, 2>) -> Self {
        Self::Rank2(y)
    }
}

impl<B: Backend> From<Tensor<B, 3>> for TargetStream<B> {
    fn from(y: Tensor<B, 3>) -> Self {
        Self::Rank3(y)
    }
}

/// Targets: one stream or several named ones.
#[derive(Debug, Clone)]
pub enum TargetInput<B: Backend> {
    Bare(TargetStream<B>),
    Named(BTreeMap<String, TargetStream<B>>),
}

impl<B: Backend> From<TargetStream<B>> for TargetInput<B> {
    fn from(y: TargetStream<B>) -> Self {
        Self::Bare(y)
    }
}

impl<B: Backend> From<Tensor<B, 1>> for TargetInput<B> {
    fn from(y: Tensor<B, 1>) -> Self {
        Self::Bare(y.into())
    }
}

impl<B: Backend> From<Tensor<B, 2>> for TargetInput<B> {
    fn from(y: Tensor<B, 2>) -> Self {
        Self::Bare(y.into())
    }
}

impl<B: Backend> From<Tensor<B, 3>> for TargetInput<B> {
    fn from(y: Tensor<B, 3>) -> Self {
        Self::Bare(y.into())
    }
}

impl<B: Backend> From<BTreeMap<String, TargetStream<B>>> for TargetInput<B> {
    fn from(y: BTreeMap<String, TargetStream<B>>) -> Self {
        Self::Named(y)
    }
}

impl<B: Backend> TargetInput<B> {
    /// Build a named input from 3D tensors.
    pub fn named(streams: NamedTensors<B, 3>) -> Self {
        Self::Named(
            streams
                .into_iter()
                .map(|(k, v)| (k, TargetStream::Rank3(v)))
                .collect(),
        )
    }

    /// Normalize to named 3D streams.
    pub fn into_named(self) -> Result<NamedTensors<B, 3>> {
        let named: NamedTensors<B, 3> = match self {
            Self::Bare(y) => BTreeMap::from([(MAIN_KEY.to_string(), y.into_3d())]),
            Self::Named(streams) => streams.into_iter().map(|(k, v)| (k, v.into_3d())).collect(),
        };
        if !named.contains_key(MAIN_KEY) {
            return Err(TransformerError::usage(format!(
                "target input has no '{MAIN_KEY}' stream"
            )));
        }
        Ok(named)
    }
}

/// Right-pad the feature axis with zeros up to a multiple of `features_per_group`.
pub fn pad_features_to_group<B: Backend>(
    x: Tensor<B, 3>,
    features_per_group: usize,
) -> Tensor<B, 3> {
    let [seq_len, batch_size, num_features] = x.dims();
    let missing = (features_per_group - num_features % features_per_group) % features_per_group;
    if missing == 0 {
        return x;
    }
    trace!("padding {num_features} features with {missing} zero columns");
    let padding = Tensor::zeros([seq_len, batch_size, missing], &x.device());
    Tensor::cat(vec![x, padding], 2)
}

/// `[seq, batch, groups * n]` to `[batch, seq, groups, n]`.
pub fn group_features<B: Backend>(x: Tensor<B, 3>, features_per_group: usize) -> Tensor<B, 4> {
    let [seq_len, batch_size, num_features] = x.dims();
    x.reshape([
        seq_len,
        batch_size,
        num_features / features_per_group,
        features_per_group,
    ])
    .swap_dims(0, 1)
}

/// Per-group offsets of categorical features for one example.
///
/// Feature `i` lands in group `i / features_per_group` at offset
/// `i % features_per_group`.
pub fn transform_categorical_indices_feat_groups(
    categorical_inds: &[usize],
    n_groups: usize,
    features_per_group: usize,
) -> Result<Vec<Vec<usize>>> {
    let mut groups = vec![Vec::new(); n_groups];
    for &idx in categorical_inds {
        let group = idx / features_per_group;
        let slot = groups.get_mut(group).ok_or_else(|| {
            TransformerError::usage(format!(
                "categorical feature index {idx} is outside the {} available features",
                n_groups * features_per_group
            ))
        })?;
        slot.push(idx % features_per_group);
    }
    Ok(groups)
}

/// Remap per-example categorical indices to one list per (example, group)
/// token, example-major, the order in which the encoder sees the tokens.
pub fn remap_categorical_indices(
    categorical_inds: &[Vec<usize>],
    batch_size: usize,
    n_groups: usize,
    features_per_group: usize,
) -> Result<Vec<Vec<usize>>> {
    if categorical_inds.len() != batch_size {
        return Err(TransformerError::usage(format!(
            "categorical_inds has {} entries for a batch of {batch_size}",
            categorical_inds.len()
        )));
    }
    let mut remapped = Vec::with_capacity(batch_size * n_groups);
    for inds in categorical_inds {
        remapped.extend(transform_categorical_indices_feat_groups(
            inds,
            n_groups,
            features_per_group,
        )?);
    }
    Ok(remapped)
}

/// Align target streams to `seq_len` rows and hide the main stream's
/// evaluation rows.
///
/// A stream shorter than `seq_len` must have exactly `single_eval_pos` rows
/// and is padded with NaN. The main stream may also be supplied for all rows,
/// in which case rows from `single_eval_pos` on are overwritten with NaN;
/// any other length for it is target leakage.
pub fn align_target_streams<B: Backend>(
    y: NamedTensors<B, 3>,
    seq_len: usize,
    single_eval_pos: usize,
) -> Result<NamedTensors<B, 3>> {
    let mut aligned = BTreeMap::new();
    for (key, tensor) in y {
        let [rows, batch_size, channels] = tensor.dims();
        let device = tensor.device();
        let is_main = key == MAIN_KEY;

        let tensor = if rows == seq_len {
            tensor
        } else if rows > seq_len {
            return Err(TransformerError::shape(
                "target stream rows",
                &[seq_len],
                &[rows],
            ));
        } else if rows != single_eval_pos {
            return Err(if is_main {
                TransformerError::usage(format!(
                    "target '{MAIN_KEY}' has {rows} rows but single_eval_pos is {single_eval_pos}; \
                     targets of evaluation rows must not be supplied"
                ))
            } else {
                TransformerError::usage(format!(
                    "target stream '{key}' has {rows} rows, expected {single_eval_pos} or {seq_len}"
                ))
            });
        } else if rows == 0 {
            Tensor::full([seq_len, batch_size, channels], f32::NAN, &device)
        } else {
            let padding = Tensor::full([seq_len - rows, batch_size, channels], f32::NAN, &device);
            Tensor::cat(vec![tensor, padding], 0)
        };

        let tensor = if is_main && single_eval_pos < seq_len {
            let masked = Tensor::full(
                [seq_len - single_eval_pos, batch_size, channels],
                f32::NAN,
                &device,
            );
            tensor.slice_assign(
                [single_eval_pos..seq_len, 0..batch_size, 0..channels],
                masked,
            )
        } else {
            tensor
        };
        aligned.insert(key, tensor);
    }
    Ok(aligned)
}
