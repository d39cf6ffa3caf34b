//! Cache for the per-group feature positional embeddings.
//!
//! A call that evaluates test rows against a cached training set must add
//! the same positional embeddings the training call used. The cache is only
//! meaningful without DAG encodings.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use log::debug;

use super::error::{Result, TransformerError};

#[derive(Debug, Clone, Default)]
pub enum EmbeddingCache {
    #[default]
    Empty,
    Populated {
        /// `[groups, emsize]`
        embeddings: TensorData,
        num_groups: usize,
    },
}

impl EmbeddingCache {
    pub fn is_populated(&self) -> bool {
        matches!(self, Self::Populated { .. })
    }

    pub fn invalidate(&mut self) {
        if self.is_populated() {
            debug!("dropping cached feature embeddings");
        }
        *self = Self::Empty;
    }

    /// Replace the cache with the embeddings of this call, or clear it when
    /// caching was not requested, no embeddings were drawn, or DAGs are present.
    pub fn store<B: Backend>(
        &mut self,
        embeddings: Option<&Tensor<B, 2>>,
        cache_requested: bool,
        dags_present: bool,
    ) {
        self.invalidate();
        match embeddings {
            Some(embeddings) if cache_requested && !dags_present => {
                let num_groups = embeddings.dims()[0];
                debug!("caching feature embeddings for {num_groups} groups");
                *self = Self::Populated {
                    embeddings: embeddings.clone().detach().into_data(),
                    num_groups,
                };
            }
            _ => {}
        }
    }

    /// Cached embeddings on `device`, if usable for this call.
    ///
    /// DAG calls never consult the cache. A cache built for a different
    /// number of feature groups is an error.
    pub fn consult<B: Backend>(
        &self,
        dags_present: bool,
        num_groups: usize,
        device: &B::Device,
    ) -> Result<Option<Tensor<B, 2>>> {
        match self {
            Self::Populated { .. } if dags_present => Ok(None),
            Self::Populated {
                embeddings,
                num_groups: cached_groups,
            } => {
                if *cached_groups != num_groups {
                    return Err(TransformerError::shape(
                        "cached feature embeddings (groups)",
                        &[num_groups],
                        &[*cached_groups],
                    ));
                }
                debug!("reusing cached feature embeddings");
                Ok(Some(Tensor::from_data(embeddings.clone(), device)))
            }
            Self::Empty => Ok(None),
        }
    }
}
