//! Linear and embedding layers holding pre-initialized weights.

use burn::{
    module::{Module, Param},
    tensor::{backend::Backend, Int, Tensor},
};

/// Same interface as `burn::nn::Linear`, but the weights are supplied by the
/// caller (see [`DeterministicRngContext`]) instead of drawn from the backend RNG.
///
/// [`DeterministicRngContext`]: super::rng::DeterministicRngContext
#[derive(Module, Debug)]
pub struct DeterministicLinear<B: Backend> {
    /// Weight matrix of shape [output_dim, input_dim]
    pub weight: Param<Tensor<B, 2>>,
    /// Optional bias vector of shape [output_dim]
    pub bias: Option<Param<Tensor<B, 1>>>,
}

impl<B: Backend> DeterministicLinear<B> {
    pub fn new(weight: Tensor<B, 2>, bias: Option<Tensor<B, 1>>) -> Self {
        Self {
            weight: Param::from_tensor(weight),
            bias: bias.map(Param::from_tensor),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.val().dims()[1]
    }

    pub fn output_dim(&self) -> usize {
        self.weight.val().dims()[0]
    }

    /// Applies the projection to the last dimension of a tensor of any rank.
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let dims = input.dims();
        let rows: usize = dims[..D - 1].iter().product();
        let flat = input.reshape([rows, dims[D - 1]]);

        let output = flat.matmul(self.weight.val().transpose());
        let output = match &self.bias {
            Some(bias) => output + bias.val().unsqueeze::<2>(),
            None => output,
        };

        let mut out_dims = dims;
        out_dims[D - 1] = self.output_dim();
        output.reshape(out_dims)
    }
}

/// Lookup table with pre-initialized rows.
#[derive(Module, Debug)]
pub struct DeterministicEmbedding<B: Backend> {
    /// Embedding weight matrix of shape [vocab_size, embedding_dim]
    weight: Param<Tensor<B, 2>>,
}

impl<B: Backend> DeterministicEmbedding<B> {
    pub fn new(weight: Tensor<B, 2>) -> Self {
        Self {
            weight: Param::from_tensor(weight),
        }
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.val().dims()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.val().dims()[1]
    }

    /// The whole table, `[vocab_size, embedding_dim]`.
    pub fn weight(&self) -> Tensor<B, 2> {
        self.weight.val()
    }

    /// Rows selected by `indices`, `[len, embedding_dim]`.
    pub fn forward(&self, indices: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        self.weight.val().select(0, indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_linear_forward_on_rank_four() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]], &device);
        let bias = Tensor::<TestBackend, 1>::from_floats([0.5, 0.0, -1.0], &device);
        let linear = DeterministicLinear::new(weight, Some(bias));

        let x = Tensor::<TestBackend, 4>::ones([2, 3, 1, 2], &device);
        let y = linear.forward(x);
        assert_eq!(y.dims(), [2, 3, 1, 3]);

        let values = y.into_data().to_vec::<f32>().unwrap();
        assert_eq!(&values[..3], &[1.5, 2.0, 1.0]);
    }

    #[test]
    fn test_embedding_selects_rows() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]], &device);
        let embedding = DeterministicEmbedding::new(weight);
        let idx = Tensor::<TestBackend, 1, Int>::from_ints([2, 0], &device);
        let rows = embedding.forward(idx).into_data().to_vec::<f32>().unwrap();
        assert_eq!(rows, vec![2.0, 2.0, 0.0, 0.0]);
    }
}
