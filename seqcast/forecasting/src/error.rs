//! Error taxonomy shared by every stage of a run.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ForecastError>;

/// Broad category of a [`ForecastError`], telling the operator which
/// precondition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An operation needing a prior fit/build ran before it.
    State,
    /// Not enough rows to build windows or seed a forecast.
    InsufficientData,
    /// A required checkpoint does not exist.
    NotFound,
    /// Writing a checkpoint, log or forecast failed.
    Persistence,
    /// Malformed input table, configuration or array shape.
    Input,
}

/// Errors raised by the forecasting core. All of them are fatal to the
/// current run; nothing is retried.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// Scaler used before `fit`.
    #[error("scaler has not been fitted")]
    ScalerNotFitted,
    /// Second `fit` in the same session.
    #[error("scaler is already fitted for this session; refitting would change the normalization basis")]
    ScalerAlreadyFitted,
    /// Scaler fitted on a reference series with no rows or no features.
    #[error("scaler reference series is empty ({rows} rows x {features} features)")]
    EmptyReference {
        /// Rows in the reference.
        rows: usize,
        /// Features in the reference.
        features: usize,
    },
    /// A feature has no usable spread in the reference series.
    #[error("feature {feature} has fewer than 2 distinct values; spread is undefined")]
    DegenerateFeature {
        /// Column index of the offending feature.
        feature: usize,
    },
    /// Model used before construction.
    #[error("model has not been built")]
    ModelNotBuilt,
    /// Checkpoint lifecycle called out of order.
    #[error("checkpoint manager: {0}")]
    Phase(String),
    /// Series shorter than what the operation needs.
    #[error("series has {rows} rows, at least {required} required")]
    InsufficientData {
        /// Rows available.
        rows: usize,
        /// Rows required.
        required: usize,
    },
    /// Training requested on a dataset with zero windows.
    #[error("window dataset is empty; nothing to train on")]
    EmptyDataset,
    /// Fewer history rows than the model's sample size.
    #[error("forecast needs {required} history rows, only {available} available")]
    InsufficientHistory {
        /// Rows available.
        available: usize,
        /// Rows required (sample size).
        required: usize,
    },
    /// No checkpoint found where one is required.
    #[error("no checkpoints found in {}", dir.display())]
    CheckpointNotFound {
        /// Directory that was searched.
        dir: PathBuf,
    },
    /// Failed to write a persisted artifact.
    #[error("failed to persist {}: {source}", path.display())]
    Persistence {
        /// Final destination of the artifact.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// Array dimensions disagree.
    #[error("shape mismatch: expected {expected}, found {found}")]
    Shape {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        found: String,
    },
    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Malformed input table.
    #[error("invalid series: {0}")]
    Series(String),
    /// Filesystem error outside checkpoint persistence.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// CSV parsing or encoding failure.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl ForecastError {
    /// Returns the category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ScalerNotFitted
            | Self::ScalerAlreadyFitted
            | Self::EmptyReference { .. }
            | Self::DegenerateFeature { .. }
            | Self::ModelNotBuilt
            | Self::Phase(_) => ErrorKind::State,
            Self::InsufficientData { .. }
            | Self::EmptyDataset
            | Self::InsufficientHistory { .. } => ErrorKind::InsufficientData,
            Self::CheckpointNotFound { .. } => ErrorKind::NotFound,
            Self::Persistence { .. } => ErrorKind::Persistence,
            Self::Shape { .. }
            | Self::InvalidConfig(_)
            | Self::Series(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Csv(_) => ErrorKind::Input,
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn shape(expected: impl std::fmt::Debug, found: impl std::fmt::Debug) -> Self {
        Self::Shape {
            expected: format!("{expected:?}"),
            found: format!("{found:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(ForecastError::ScalerNotFitted.kind(), ErrorKind::State);
        assert_eq!(ForecastError::ModelNotBuilt.kind(), ErrorKind::State);
        assert_eq!(ForecastError::EmptyDataset.kind(), ErrorKind::InsufficientData);
        assert_eq!(
            ForecastError::CheckpointNotFound { dir: "w".into() }.kind(),
            ErrorKind::NotFound
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = ForecastError::persistence("ckpt.json", io);
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert!(err.to_string().contains("ckpt.json"));
    }
}
