//! Input encoders turning raw feature groups and targets into embeddings.

use burn::module::{Ignored, Module};
use burn::prelude::*;
use log::trace;

use super::error::{Result, TransformerError};
use super::inputs::{NamedTensors, MAIN_KEY};
use super::linear::DeterministicLinear;
use super::rng::DeterministicRngContext;

/// Key under which [`NanHandlingEncoderStep`] stores its indicator channels.
pub const NAN_INDICATORS_KEY: &str = "nan_indicators";

/// Base trait for input encoders.
///
/// Inputs are named `[seq, tokens, channels]` streams; the output is
/// `[seq, tokens, emsize]`.
pub trait InputEncoder<B: Backend> {
    fn encode(
        &self,
        inputs: &NamedTensors<B, 3>,
        single_eval_pos: usize,
        cache_trainset_representation: bool,
        categorical_inds: Option<&[Vec<usize>]>,
    ) -> Result<Tensor<B, 3>>;

    /// Whether [`InputEncoder::encode`] should be handed categorical indices.
    ///
    /// Such an encoder gets one list per token: token `b * n_groups + g`
    /// holds the within-group offsets of the categorical features of group
    /// `g` in batch element `b`.
    fn accepts_categorical_inds(&self) -> bool {
        false
    }
}

/// Replaces NaN and ±inf with zero and records where they were.
///
/// Indicator values: NaN `-2`, +inf `2`, -inf `4`, finite `0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NanHandlingEncoderStep {
    pub keep_nans: bool,
    nan_indicator: f32,
    inf_indicator: f32,
    neg_inf_indicator: f32,
}

impl NanHandlingEncoderStep {
    pub fn new(keep_nans: bool) -> Self {
        Self {
            keep_nans,
            nan_indicator: -2.0,
            inf_indicator: 2.0,
            neg_inf_indicator: 4.0,
        }
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 3>) -> (Tensor<B, 3>, Option<Tensor<B, 3>>) {
        let nan_mask = x.clone().is_nan();
        let inf_mask = x.clone().is_inf();

        let indicators = self.keep_nans.then(|| {
            let pos_inf_mask = inf_mask.clone().bool_and(x.clone().greater_elem(0.0));
            let neg_inf_mask = inf_mask.clone().bool_and(x.clone().lower_elem(0.0));
            nan_mask.clone().float() * self.nan_indicator
                + pos_inf_mask.float() * self.inf_indicator
                + neg_inf_mask.float() * self.neg_inf_indicator
        });

        let cleaned = x.mask_fill(nan_mask.bool_or(inf_mask), 0.0);
        (cleaned, indicators)
    }

    /// Rewrites `main` in place and adds the indicator stream.
    pub fn apply<B: Backend>(&self, state: &mut NamedTensors<B, 3>) -> Result<()> {
        let main = state
            .remove(MAIN_KEY)
            .ok_or_else(|| TransformerError::usage(format!("no '{MAIN_KEY}' stream to clean")))?;
        let (cleaned, indicators) = self.forward(main);
        state.insert(MAIN_KEY.to_string(), cleaned);
        if let Some(indicators) = indicators {
            state.insert(NAN_INDICATORS_KEY.to_string(), indicators);
        }
        Ok(())
    }
}

/// Linear projection of the concatenated `in_keys` channels.
#[derive(Module, Debug)]
pub struct LinearInputEncoderStep<B: Backend> {
    layer: DeterministicLinear<B>,
    in_keys: Ignored<Vec<String>>,
    replace_nan_by_zero: Ignored<bool>,
}

impl<B: Backend> LinearInputEncoderStep<B> {
    pub fn new(
        num_features: usize,
        emsize: usize,
        in_keys: &[&str],
        replace_nan_by_zero: bool,
        bias: bool,
        rng_ctx: &DeterministicRngContext<B>,
        seed_offset: u64,
    ) -> Result<Self> {
        Ok(Self {
            layer: rng_ctx.create_deterministic_linear(num_features, emsize, bias, seed_offset)?,
            in_keys: Ignored(in_keys.iter().map(|k| k.to_string()).collect()),
            replace_nan_by_zero: Ignored(replace_nan_by_zero),
        })
    }

    pub fn forward(&self, state: &NamedTensors<B, 3>) -> Result<Tensor<B, 3>> {
        let inputs = self
            .in_keys
            .iter()
            .map(|key| {
                state.get(key).cloned().ok_or_else(|| {
                    TransformerError::usage(format!("encoder input '{key}' is missing"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut input = Tensor::cat(inputs, 2);

        let channels = input.dims()[2];
        if channels != self.layer.input_dim() {
            return Err(TransformerError::shape(
                "linear encoder channels",
                &[self.layer.input_dim()],
                &[channels],
            ));
        }

        if *self.replace_nan_by_zero {
            let nan_mask = input.clone().is_nan();
            input = input.mask_fill(nan_mask, 0.0);
        }

        Ok(self.layer.forward(input))
    }
}

/// Optional NaN handling followed by a linear step.
#[derive(Module, Debug)]
pub struct SequentialEncoder<B: Backend> {
    nan_handling: Ignored<Option<NanHandlingEncoderStep>>,
    linear: LinearInputEncoderStep<B>,
}

impl<B: Backend> SequentialEncoder<B> {
    pub fn new(nan_handling: Option<NanHandlingEncoderStep>, linear: LinearInputEncoderStep<B>) -> Self {
        Self {
            nan_handling: Ignored(nan_handling),
            linear,
        }
    }

    /// Default feature encoder: one linear step over the values of a group.
    pub fn default_x_encoder(
        features_per_group: usize,
        emsize: usize,
        rng_ctx: &DeterministicRngContext<B>,
    ) -> Result<Self> {
        let linear = LinearInputEncoderStep::new(
            features_per_group,
            emsize,
            &[MAIN_KEY],
            false,
            true,
            rng_ctx,
            400,
        )?;
        Ok(Self::new(None, linear))
    }

    /// Default target encoder: NaN handling, then a linear step over the
    /// value and its indicator.
    pub fn default_y_encoder(emsize: usize, rng_ctx: &DeterministicRngContext<B>) -> Result<Self> {
        let linear = LinearInputEncoderStep::new(
            2,
            emsize,
            &[MAIN_KEY, NAN_INDICATORS_KEY],
            false,
            true,
            rng_ctx,
            500,
        )?;
        Ok(Self::new(Some(NanHandlingEncoderStep::new(true)), linear))
    }
}

impl<B: Backend> InputEncoder<B> for SequentialEncoder<B> {
    fn encode(
        &self,
        inputs: &NamedTensors<B, 3>,
        _single_eval_pos: usize,
        _cache_trainset_representation: bool,
        _categorical_inds: Option<&[Vec<usize>]>,
    ) -> Result<Tensor<B, 3>> {
        let mut state = inputs.clone();
        if let Some(step) = &*self.nan_handling {
            step.apply(&mut state)?;
        }
        trace!("sequential encoder inputs: {:?}", state.keys().collect::<Vec<_>>());
        self.linear.forward(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn ctx() -> DeterministicRngContext<TestBackend> {
        DeterministicRngContext::new(0, Default::default())
    }

    fn named(x: Tensor<TestBackend, 3>) -> NamedTensors<TestBackend, 3> {
        NamedTensors::from([(MAIN_KEY.to_string(), x)])
    }

    #[test]
    fn test_nan_handling_indicators() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::from_floats(
            [[[f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 1.5]]],
            &device,
        );
        let (cleaned, indicators) = NanHandlingEncoderStep::new(true).forward(x);
        assert_eq!(
            cleaned.into_data().to_vec::<f32>().unwrap(),
            vec![0.0, 0.0, 0.0, 1.5]
        );
        assert_eq!(
            indicators.unwrap().into_data().to_vec::<f32>().unwrap(),
            vec![-2.0, 2.0, 4.0, 0.0]
        );
    }

    #[test]
    fn test_default_y_encoder_tolerates_nan() {
        let device = Default::default();
        let encoder = SequentialEncoder::default_y_encoder(8, &ctx()).unwrap();
        let y = Tensor::<TestBackend, 3>::from_floats([[[1.0]], [[f32::NAN]]], &device);
        let out = encoder.encode(&named(y), 1, false, None).unwrap();
        assert_eq!(out.dims(), [2, 1, 8]);
        assert!(out.into_data().to_vec::<f32>().unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_x_encoder_propagates_nan() {
        let device = Default::default();
        let encoder = SequentialEncoder::default_x_encoder(2, 8, &ctx()).unwrap();
        let x = Tensor::<TestBackend, 3>::from_floats([[[f32::NAN, 1.0]]], &device);
        let out = encoder.encode(&named(x), 1, false, None).unwrap();
        assert!(out.into_data().to_vec::<f32>().unwrap().iter().any(|v| v.is_nan()));
    }

    #[test]
    fn test_sequential_encoder_ignores_categorical_inds() {
        let device = Default::default();
        let encoder = SequentialEncoder::default_x_encoder(2, 8, &ctx()).unwrap();
        assert!(!encoder.accepts_categorical_inds());
        let x = Tensor::<TestBackend, 3>::ones([3, 2, 2], &device);
        let plain = encoder.encode(&named(x.clone()), 1, false, None).unwrap();
        let with_inds = encoder
            .encode(&named(x), 1, false, Some(&[vec![1], vec![]][..]))
            .unwrap();
        assert_eq!(
            plain.into_data().to_vec::<f32>().unwrap(),
            with_inds.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_missing_in_key_is_reported() {
        let device = Default::default();
        let step = LinearInputEncoderStep::new(2, 4, &["main", "extra"], false, false, &ctx(), 0)
            .unwrap();
        let state = named(Tensor::<TestBackend, 3>::zeros([1, 1, 1], &device));
        let err = step.forward(&state).unwrap_err();
        assert!(err.to_string().contains("extra"));
    }
}
