//! Error type shared by every stage of the transformer pipeline.

use thiserror::Error;

/// Failures raised while building or running a [`PerFeatureTransformer`].
///
/// Every variant carries enough context to identify the offending stage or
/// argument; nothing in the forward pass panics on bad caller input.
///
/// [`PerFeatureTransformer`]: super::transformer::PerFeatureTransformer
#[derive(Debug, Error)]
pub enum TransformerError {
    /// The caller violated a calling contract (bad argument combination,
    /// unknown option, target leakage, out-of-range index).
    #[error("usage error: {0}")]
    Usage(String),

    /// The model configuration is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// NaN values appeared after an encoding stage.
    #[error("NaN values found in {stage}: {message}")]
    DataQuality {
        stage: &'static str,
        message: String,
    },

    /// A numeric routine (eigen-solve, stationary distribution) failed.
    #[error("numerical failure: {0}")]
    Numerical(String),

    /// Two tensors that must agree in shape do not.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    Shape {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl TransformerError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn numerical(message: impl Into<String>) -> Self {
        Self::Numerical(message.into())
    }

    pub fn data_quality(stage: &'static str, message: impl Into<String>) -> Self {
        Self::DataQuality {
            stage,
            message: message.into(),
        }
    }

    pub fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::Shape {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransformerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_quality_message_names_stage() {
        let err = TransformerError::data_quality("y_encoder", "2 NaN values");
        assert_eq!(err.to_string(), "NaN values found in y_encoder: 2 NaN values");
    }

    #[test]
    fn test_shape_message_lists_both_shapes() {
        let err = TransformerError::shape("x stream", &[4, 1, 3], &[4, 2, 3]);
        let msg = err.to_string();
        assert!(msg.contains("x stream"));
        assert!(msg.contains("[4, 1, 3]"));
        assert!(msg.contains("[4, 2, 3]"));
    }
}
