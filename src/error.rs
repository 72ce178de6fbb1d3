//! Domain errors for configuration, model assembly and the training loop.
//!
//! Anything that is not a decision the harness makes itself (I/O, tensor
//! ops, SQLite) travels as `anyhow::Error`; these variants are the ones
//! callers and tests match on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    /// `modality` is neither "image" nor "text".
    #[error("Unknown modality: {0}")]
    UnknownModality(String),

    /// `voxel_dims` is not 1 or 3.
    #[error("voxel_dims must be 1 or 3, not {0}")]
    UnsupportedVoxelDims(usize),

    /// An option parsed but holds a value outside its domain.
    #[error("Invalid option {key}: {message}")]
    InvalidOption { key: String, message: String },

    /// An override names an option that does not exist.
    #[error("Unknown config key: {0}")]
    UnknownOption(String),

    /// Encoder, extractor and prior disagree on the embedding width.
    #[error("Embedding dimension mismatch: {component} produces {actual}, expected {expected}")]
    EmbeddingDimMismatch {
        component: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A loss tensor contains NaN.
    #[error("NaN loss in {stage}")]
    InvalidLoss { stage: &'static str },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A data shard lacks the tensor the config asks for.
    #[error("Shard {shard} has no record key '{key}'")]
    MissingRecordKey { shard: String, key: String },

    #[error("Checkpoint format error: {0}")]
    CheckpointFormat(String),

    /// Another replica failed and tore down the group.
    #[error("A peer replica failed")]
    ReplicaAborted,
}

impl TrainError {
    pub fn invalid_option(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error is a startup configuration error (raised before
    /// any training state exists).
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownModality(_)
                | Self::UnsupportedVoxelDims(_)
                | Self::InvalidOption { .. }
                | Self::UnknownOption(_)
                | Self::EmbeddingDimMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            TrainError::UnsupportedVoxelDims(2).to_string(),
            "voxel_dims must be 1 or 3, not 2"
        );
        assert_eq!(
            TrainError::InvalidLoss { stage: "train/prior" }.to_string(),
            "NaN loss in train/prior"
        );
        let e = TrainError::EmbeddingDimMismatch {
            component: "voxel encoder",
            expected: 768,
            actual: 512,
        };
        assert!(e.to_string().contains("voxel encoder produces 512"));
    }

    #[test]
    fn test_config_error_classification() {
        assert!(TrainError::UnknownModality("audio".into()).is_config_error());
        assert!(TrainError::invalid_option("batch_size", "must be > 0").is_config_error());
        assert!(!TrainError::InvalidLoss { stage: "val/prior" }.is_config_error());
        assert!(!TrainError::ShapeMismatch("x".into()).is_config_error());
    }
}
