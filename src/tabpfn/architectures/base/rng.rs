//! Random number generation for the transformer.
//!
//! Two sources of randomness exist:
//!
//! * The *global* generator. Forward-time sampling (layer-count draws,
//!   positional-embedding vectors, eigenvector sign flips) pulls from it, so a
//!   caller can make a whole forward pass reproducible with
//!   [`seed_global_rng`]. [`isolate_rng`] temporarily reseeds it and restores
//!   the previous state afterwards.
//! * [`DeterministicRngContext`], which seeds a fresh local generator for each
//!   parameter tensor. Building a model never touches the global generator.
//!
//! The global generator is thread-local. A model is driven from one thread at
//! a time, and tests running in parallel threads do not disturb each other.

use burn::tensor::{backend::Backend, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use std::cell::RefCell;
use std::marker::PhantomData;

use super::error::{Result, TransformerError};
use super::linear::{DeterministicEmbedding, DeterministicLinear};

/// Seed the global generator starts from before anyone calls [`seed_global_rng`].
pub const DEFAULT_GLOBAL_SEED: u64 = 0;

thread_local! {
    static GLOBAL_RNG: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(DEFAULT_GLOBAL_SEED));
}

/// Reseed the global generator.
pub fn seed_global_rng(seed: u64) {
    GLOBAL_RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

/// Run `f` with mutable access to the global generator.
///
/// `f` must not call back into [`with_global_rng`] or [`isolate_rng`].
pub fn with_global_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    GLOBAL_RNG.with(|rng| f(&mut rng.borrow_mut()))
}

/// Snapshot of the global generator's state, mainly useful in tests.
pub fn global_rng_snapshot() -> StdRng {
    GLOBAL_RNG.with(|rng| rng.borrow().clone())
}

/// Restores the global generator when dropped.
///
/// Created by [`RngIsolationGuard::enter`], which swaps in a generator seeded
/// with the requested seed. The guard is `!Send` so it is always dropped on
/// the thread whose generator it replaced.
pub struct RngIsolationGuard {
    saved: Option<StdRng>,
    _not_send: PhantomData<*const ()>,
}

impl RngIsolationGuard {
    pub fn enter(seed: u64) -> Self {
        let saved = GLOBAL_RNG.with(|rng| rng.replace(StdRng::seed_from_u64(seed)));
        Self {
            saved: Some(saved),
            _not_send: PhantomData,
        }
    }
}

impl Drop for RngIsolationGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            GLOBAL_RNG.with(|rng| *rng.borrow_mut() = saved);
        }
    }
}

/// Run `f` with the global generator reseeded to `seed`.
///
/// The prior state is restored on every exit path, including unwinding, and
/// nested scopes restore in LIFO order.
pub fn isolate_rng<R>(seed: u64, f: impl FnOnce() -> R) -> R {
    let _guard = RngIsolationGuard::enter(seed);
    f()
}

/// `n` standard-normal draws.
pub fn normal_values(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| StandardNormal.sample(rng)).collect()
}

/// `n` uniform draws from `[-1, 1)`.
pub fn uniform_values(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect()
}

/// Build a tensor of the given shape from row-major host values.
pub fn tensor_from_values<B: Backend, const D: usize>(
    values: Vec<f32>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape(shape)
}

/// Seeded factory for model parameters.
///
/// Every parameter tensor gets its own `StdRng` seeded from the context seed
/// plus a fixed offset, so construction is reproducible and independent of
/// creation order.
///
/// Seed offsets used by the transformer:
/// - `+100`/`+101`: the two projections of an MLP
/// - `+110..+113`: attention projections
/// - `+200`: learned feature embedding table, `+210` subspace projection
/// - `+300`: compression tokens
/// - `+400`/`+500`: x and y encoders, `+600` decoder heads
/// - `10_000 + i * 1000`: encoder layer `i`; decoder layers start at
///   `500_000` and compression layers at `900_000`
#[derive(Debug, Clone)]
pub struct DeterministicRngContext<B: Backend> {
    pub seed: u64,
    device: B::Device,
}

impl<B: Backend> DeterministicRngContext<B> {
    pub fn new(seed: u64, device: B::Device) -> Self {
        Self { seed, device }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Context whose seed is shifted by `offset`.
    pub fn fork(&self, offset: u64) -> Self {
        Self::new(self.seed.wrapping_add(offset), self.device.clone())
    }

    /// Xavier-normal weights, small normal bias.
    pub fn create_deterministic_linear(
        &self,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        offset: u64,
    ) -> Result<DeterministicLinear<B>> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(offset));
        let std = (2.0 / (input_dim + output_dim) as f32).sqrt();
        let weight = self.generate_normal_tensor([output_dim, input_dim], &mut rng, 0.0, std)?;
        let bias = if bias {
            Some(self.generate_normal_tensor([output_dim], &mut rng, 0.0, 0.01)?)
        } else {
            None
        };
        Ok(DeterministicLinear::new(weight, bias))
    }

    /// Linear layer whose weight (and bias) start at zero.
    pub fn create_zero_linear(
        &self,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
    ) -> DeterministicLinear<B> {
        let weight = Tensor::zeros([output_dim, input_dim], &self.device);
        let bias = bias.then(|| Tensor::zeros([output_dim], &self.device));
        DeterministicLinear::new(weight, bias)
    }

    pub fn create_deterministic_embedding(
        &self,
        vocab_size: usize,
        embedding_dim: usize,
        offset: u64,
    ) -> Result<DeterministicEmbedding<B>> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(offset));
        let std = (1.0 / embedding_dim as f32).sqrt();
        let weight =
            self.generate_normal_tensor([vocab_size, embedding_dim], &mut rng, 0.0, std)?;
        Ok(DeterministicEmbedding::new(weight))
    }

    pub fn generate_normal_tensor<const D: usize>(
        &self,
        shape: [usize; D],
        rng: &mut StdRng,
        mean: f32,
        std: f32,
    ) -> Result<Tensor<B, D>> {
        let normal = Normal::new(mean, std).map_err(|e| {
            TransformerError::numerical(format!("invalid normal distribution ({mean}, {std}): {e}"))
        })?;
        let total: usize = shape.iter().product();
        let data: Vec<f32> = (0..total).map(|_| normal.sample(rng)).collect();
        Ok(tensor_from_values(data, shape, &self.device))
    }
}
