#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Seqcast forecasting core: robust scaling, sliding-window datasets,
//! checkpointed training and autoregressive multi-step forecasts for
//! multivariate time series.

/// Error taxonomy.
pub mod error;

/// Timestamped feature tables.
pub mod series;

/// Robust feature scaling.
pub mod scaler;

/// Sliding-window datasets.
pub mod window;

/// Sequence model contract and the built-in linear model.
pub mod model;

/// Checkpoint lifecycle and loss log.
pub mod checkpoint;

/// Autoregressive forecast roller.
pub mod roller;

/// Run configuration.
pub mod config;

/// Structured run logging.
pub mod telemetry;

/// Atomic file writes.
pub mod persist;

/// Train/predict orchestration.
pub mod pipeline;

pub use checkpoint::{
    latest_checkpoint, list_checkpoints, CheckpointManager, CheckpointPhase, CheckpointRef,
    LossLog, LossRow,
};
pub use config::{RunConfig, RunMode};
pub use error::{ErrorKind, ForecastError, Result};
pub use model::{
    EpochHook, EpochLosses, FitOptions, LinearModelConfig, LinearSequenceModel, LossSummary,
    ModelShape, NullHook, SequenceModel,
};
pub use pipeline::{ForecastPipeline, PredictionOutcome, RunReport, TrainingOutcome};
pub use roller::{ContinuityCorrection, Forecast, ForecastEvaluation, ForecastRoller};
pub use scaler::{Scaler, ScalerState};
pub use series::TimeSeries;
pub use telemetry::{RunTelemetry, RunTelemetryBuilder};
pub use window::{Window, WindowDataset};
