//! Ordered stack of encoder layers with stochastic depth.

use burn::module::{Ignored, Module};
use burn::prelude::*;
use log::{debug, trace};
use rand::Rng;

use super::error::{Result, TransformerError};
use super::layer::{EncoderLayer, PerFeatureEncoderLayer};
use super::rng::with_global_rng;

/// Per-call arguments forwarded to every layer.
#[derive(Debug, Clone)]
pub struct LayerCall<B: Backend> {
    pub single_eval_pos: usize,
    pub cache_trainset_representation: bool,
    pub att_src: Option<Tensor<B, 4>>,
}

impl<B: Backend> LayerCall<B> {
    pub fn new(single_eval_pos: usize) -> Self {
        Self {
            single_eval_pos,
            cache_trainset_representation: false,
            att_src: None,
        }
    }

    pub fn with_cache(mut self, cache_trainset_representation: bool) -> Self {
        self.cache_trainset_representation = cache_trainset_representation;
        self
    }

    pub fn with_att_src(mut self, att_src: Tensor<B, 4>) -> Self {
        self.att_src = Some(att_src);
        self
    }
}

/// Number of layers to run this call.
///
/// Draws uniformly from `[min_layers, num_layers]` with the global generator
/// (the draw happens even when the range has one value). With `half_layers`
/// stochastic depth must be off and exactly `num_layers / 2` layers run.
pub fn sample_num_layers(num_layers: usize, min_layers: usize, half_layers: bool) -> Result<usize> {
    if min_layers > num_layers {
        return Err(TransformerError::config(format!(
            "min_num_layers_layer_dropout ({min_layers}) exceeds the number of layers ({num_layers})"
        )));
    }
    if half_layers {
        if min_layers != num_layers {
            return Err(TransformerError::usage(
                "half_layers cannot be combined with layer dropout",
            ));
        }
        return Ok(num_layers / 2);
    }
    Ok(with_global_rng(|rng| rng.random_range(min_layers..=num_layers)))
}

/// Run the first `n` layers of `layers`, `n` drawn by [`sample_num_layers`].
///
/// With `recompute_each_layer` and a gradient-tracked input, each layer's
/// activations are left to the autodiff backend's checkpointing strategy to
/// rebuild during backward.
pub fn run_layers<B: Backend, L: EncoderLayer<B>>(
    layers: &mut [L],
    min_num_layers: usize,
    recompute_each_layer: bool,
    x: Tensor<B, 4>,
    half_layers: bool,
    call: &LayerCall<B>,
) -> Result<Tensor<B, 4>> {
    let n_layers = sample_num_layers(layers.len(), min_num_layers, half_layers)?;
    let checkpointed = recompute_each_layer && x.is_require_grad();
    debug!(
        "running {n_layers} of {} layers (checkpointed: {checkpointed})",
        layers.len()
    );

    let mut output = x;
    for (i, layer) in layers.iter_mut().take(n_layers).enumerate() {
        output = layer.apply(
            output,
            call.single_eval_pos,
            call.cache_trainset_representation,
            call.att_src.clone(),
        )?;
        trace!("layer {i} output shape {:?}", output.dims());
    }
    Ok(output)
}

#[derive(Module, Debug)]
pub struct LayerStack<B: Backend> {
    layers: Vec<PerFeatureEncoderLayer<B>>,
    min_num_layers_layer_dropout: Ignored<usize>,
    recompute_each_layer: Ignored<bool>,
}

impl<B: Backend> LayerStack<B> {
    /// `layer_creator(i)` builds layer `i`. Without a minimum, all layers run
    /// on every call.
    pub fn new(
        mut layer_creator: impl FnMut(usize) -> Result<PerFeatureEncoderLayer<B>>,
        num_layers: usize,
        recompute_each_layer: bool,
        min_num_layers_layer_dropout: Option<usize>,
    ) -> Result<Self> {
        let min_layers = min_num_layers_layer_dropout.unwrap_or(num_layers);
        if min_layers > num_layers {
            return Err(TransformerError::config(format!(
                "min_num_layers_layer_dropout ({min_layers}) exceeds the number of layers ({num_layers})"
            )));
        }
        let layers = (0..num_layers)
            .map(&mut layer_creator)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            min_num_layers_layer_dropout: Ignored(min_layers),
            recompute_each_layer: Ignored(recompute_each_layer),
        })
    }

    pub fn forward(
        &mut self,
        x: Tensor<B, 4>,
        half_layers: bool,
        call: &LayerCall<B>,
    ) -> Result<Tensor<B, 4>> {
        run_layers(
            &mut self.layers,
            *self.min_num_layers_layer_dropout,
            *self.recompute_each_layer,
            x,
            half_layers,
            call,
        )
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[PerFeatureEncoderLayer<B>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [PerFeatureEncoderLayer<B>] {
        &mut self.layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabpfn::architectures::base::rng::{isolate_rng, seed_global_rng};
    use burn_ndarray::NdArray;
    use std::cell::Cell;
    use std::rc::Rc;

    type TestBackend = NdArray<f32>;

    /// Adds 1 to the grid and counts invocations.
    struct CountingLayer {
        calls: Rc<Cell<usize>>,
    }

    impl EncoderLayer<TestBackend> for CountingLayer {
        fn apply(
            &mut self,
            state: Tensor<TestBackend, 4>,
            _single_eval_pos: usize,
            _cache_trainset_representation: bool,
            _att_src: Option<Tensor<TestBackend, 4>>,
        ) -> Result<Tensor<TestBackend, 4>> {
            self.calls.set(self.calls.get() + 1);
            Ok(state.add_scalar(1.0))
        }

        fn save_peak_mem_factor(&self) -> Option<usize> {
            None
        }

        fn set_save_peak_mem_factor(&mut self, _factor: Option<usize>) {}

        fn empty_trainset_representation_cache(&mut self) {}
    }

    fn counting_layers(n: usize) -> (Vec<CountingLayer>, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let layers = (0..n)
            .map(|_| CountingLayer {
                calls: Rc::clone(&calls),
            })
            .collect();
        (layers, calls)
    }

    fn input() -> Tensor<TestBackend, 4> {
        Tensor::zeros([1, 2, 1, 4], &Default::default())
    }

    #[test]
    fn test_all_layers_run_without_dropout() {
        let (mut layers, calls) = counting_layers(6);
        let out = run_layers(&mut layers, 6, false, input(), false, &LayerCall::new(1)).unwrap();
        assert_eq!(calls.get(), 6);
        assert!(out.into_data().to_vec::<f32>().unwrap().iter().all(|v| *v == 6.0));
    }

    #[test]
    fn test_half_layers_runs_floor_half() {
        let (mut layers, calls) = counting_layers(5);
        run_layers(&mut layers, 5, false, input(), true, &LayerCall::new(1)).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_half_layers_with_dropout_is_rejected() {
        let (mut layers, calls) = counting_layers(4);
        let err = run_layers(&mut layers, 2, false, input(), true, &LayerCall::new(1)).unwrap_err();
        assert!(matches!(err, TransformerError::Usage(_)));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_layer_count_covers_range_uniformly() {
        seed_global_rng(1234);
        let mut counts = [0usize; 7];
        let draws = 7000;
        for _ in 0..draws {
            counts[sample_num_layers(6, 2, false).unwrap()] += 1;
        }
        assert_eq!(counts[0] + counts[1], 0);
        for &c in &counts[2..] {
            // Expected 1400 per value.
            assert!((1150..1650).contains(&c), "counts {counts:?}");
        }
    }

    #[test]
    fn test_layer_count_reproducible_under_seed() {
        let a: Vec<usize> = isolate_rng(5, || (0..20).map(|_| sample_num_layers(12, 1, false).unwrap()).collect());
        let b: Vec<usize> = isolate_rng(5, || (0..20).map(|_| sample_num_layers(12, 1, false).unwrap()).collect());
        assert_eq!(a, b);
    }

    #[test]
    fn test_min_above_count_is_config_error() {
        assert!(matches!(
            sample_num_layers(3, 4, false),
            Err(TransformerError::Config(_))
        ));
    }
}
