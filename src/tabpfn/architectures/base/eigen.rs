//! Eigen-solver seam used by the graph positional encodings.

use log::warn;
use nalgebra::{DMatrix, SymmetricEigen};

use super::error::{Result, TransformerError};

/// Which end of the spectrum a solver should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EigenMode {
    /// Smallest real part, for general (directed) matrices.
    SmallestReal,
    /// Smallest algebraic value, for symmetric matrices.
    SmallestAlgebraic,
}

/// Eigenvalues in ascending order with matching eigenvectors as columns.
#[derive(Debug, Clone)]
pub struct EigenPairs {
    pub values: Vec<f64>,
    pub vectors: DMatrix<f64>,
}

impl EigenPairs {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Returns up to `k` eigenpairs at the small end of the spectrum.
///
/// Implementations may return fewer than `k` pairs when the matrix is too
/// small; callers zero-pad.
pub trait EigenSolver {
    fn smallest_k_eigenpairs(
        &self,
        matrix: &DMatrix<f64>,
        k: usize,
        mode: EigenMode,
    ) -> Result<EigenPairs>;
}

/// Dense solver backed by `nalgebra::SymmetricEigen`.
///
/// Only the symmetric part `(M + Mᵀ) / 2` is decomposed, which is exact for
/// the Laplacians built in [`super::graph`].
#[derive(Debug, Clone, Copy)]
pub struct NalgebraEigenSolver {
    pub eps: f64,
    pub max_iterations: usize,
}

impl Default for NalgebraEigenSolver {
    fn default() -> Self {
        Self {
            eps: f64::EPSILON,
            max_iterations: 10_000,
        }
    }
}

const SYMMETRY_TOLERANCE: f64 = 1e-9;

impl EigenSolver for NalgebraEigenSolver {
    fn smallest_k_eigenpairs(
        &self,
        matrix: &DMatrix<f64>,
        k: usize,
        mode: EigenMode,
    ) -> Result<EigenPairs> {
        let n = matrix.nrows();
        if n != matrix.ncols() {
            return Err(TransformerError::shape(
                "eigen-solver input",
                &[n, n],
                &[matrix.nrows(), matrix.ncols()],
            ));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(TransformerError::numerical(
                "matrix passed to the eigen-solver has non-finite entries",
            ));
        }
        if n == 0 || k == 0 {
            return Ok(EigenPairs {
                values: Vec::new(),
                vectors: DMatrix::zeros(n, 0),
            });
        }

        let symmetric = (matrix + matrix.transpose()) * 0.5;
        let asymmetry = (matrix - &symmetric).amax();
        if asymmetry > SYMMETRY_TOLERANCE {
            warn!("eigen-solver ({mode:?}) decomposing symmetric part of a matrix with asymmetry {asymmetry:e}");
        }

        let eigen = SymmetricEigen::try_new(symmetric, self.eps, self.max_iterations)
            .ok_or_else(|| {
                TransformerError::numerical(format!(
                    "symmetric eigen-decomposition did not converge in {} iterations",
                    self.max_iterations
                ))
            })?;

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

        let taken = k.min(n);
        let mut vectors = DMatrix::zeros(n, taken);
        let mut values = Vec::with_capacity(taken);
        for (col, &idx) in order.iter().take(taken).enumerate() {
            values.push(eigen.eigenvalues[idx]);
            vectors.set_column(col, &eigen.eigenvectors.column(idx));
        }

        Ok(EigenPairs { values, vectors })
    }
}
