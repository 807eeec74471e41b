//! Sequence model contract and the per-epoch hook it drives.
//!
//! The core only ever talks to a model through [`SequenceModel`]. Training
//! progress flows back through [`EpochHook`]: the fit loop asks the hook for a
//! fresh [`EpochLosses`] accumulator at epoch start, records every batch loss
//! into it, and hands it back by value at epoch end.

/// Dense linear window-to-window model.
pub mod linear;

use std::path::Path;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::{error::Result, window::WindowDataset};

pub use linear::{LinearModelConfig, LinearSequenceModel};

/// Window geometry of a built model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    /// Input rows S.
    pub sample_size: usize,
    /// Output rows O.
    pub output_size: usize,
    /// Features per row F.
    pub features: usize,
}

/// Training schedule passed to [`SequenceModel::fit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitOptions {
    /// Number of passes over the dataset.
    pub epochs: usize,
    /// Windows per gradient step.
    pub batch_size: usize,
}

/// Trainable window-to-window predictor.
pub trait SequenceModel {
    /// Allocates fresh trainable state for `shape`.
    fn build(&mut self, shape: ModelShape) -> Result<()>;

    /// Geometry, or `ModelNotBuilt`.
    fn shape(&self) -> Result<ModelShape>;

    /// Trains on every window of `dataset`, calling `hook` synchronously per
    /// batch and per epoch. Blocks until all epochs finish or a hook fails.
    fn fit(
        &mut self,
        dataset: &WindowDataset,
        options: FitOptions,
        hook: &mut dyn EpochHook,
    ) -> Result<()>;

    /// Predicts one `O x F` normalized window from one `S x F` normalized
    /// window. Pure: same input and weights give the same output.
    fn infer(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// Writes the trainable state to `path`.
    fn save(&self, path: &Path) -> Result<()>;

    /// Restores trainable state from `path`. An unbuilt model takes the
    /// geometry stored in the file; a built one must match it.
    fn load(&mut self, path: &Path) -> Result<()>;
}

/// Batch losses of the epoch in progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochLosses {
    epoch: usize,
    batch_losses: Vec<f64>,
}

/// Mean and population standard deviation of one epoch's batch losses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossSummary {
    /// Mean batch loss.
    pub mean: f64,
    /// Population standard deviation of batch losses.
    pub std: f64,
    /// Number of batches recorded.
    pub batches: usize,
}

impl EpochLosses {
    /// Empty accumulator for `epoch`.
    #[must_use]
    pub const fn new(epoch: usize) -> Self {
        Self {
            epoch,
            batch_losses: Vec::new(),
        }
    }

    /// Epoch this accumulator belongs to.
    #[must_use]
    pub const fn epoch(&self) -> usize {
        self.epoch
    }

    /// Appends one batch loss.
    pub fn record(&mut self, loss: f64) {
        self.batch_losses.push(loss);
    }

    /// Recorded losses in batch order.
    #[must_use]
    pub fn losses(&self) -> &[f64] {
        &self.batch_losses
    }

    /// Whether no batch finished yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch_losses.is_empty()
    }

    /// Mean and population std, `None` when nothing was recorded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self) -> Option<LossSummary> {
        if self.batch_losses.is_empty() {
            return None;
        }
        let n = self.batch_losses.len() as f64;
        let mean = self.batch_losses.iter().sum::<f64>() / n;
        let var = self
            .batch_losses
            .iter()
            .map(|l| (l - mean).powi(2))
            .sum::<f64>()
            / n;
        Some(LossSummary {
            mean,
            std: var.sqrt(),
            batches: self.batch_losses.len(),
        })
    }
}

/// Observer driven by [`SequenceModel::fit`]. `epoch` is the 0-based index
/// within the current `fit` call.
pub trait EpochHook {
    /// Epoch start; returns the accumulator the fit loop fills.
    fn begin_epoch(&mut self, epoch: usize) -> Result<EpochLosses>;

    /// Batch completion; the default just records the loss.
    fn end_batch(&mut self, batch: usize, loss: f64, losses: &mut EpochLosses) -> Result<()> {
        let _ = batch;
        losses.record(loss);
        Ok(())
    }

    /// Epoch completion; consumes the accumulator.
    fn end_epoch(
        &mut self,
        epoch: usize,
        losses: EpochLosses,
        model: &dyn SequenceModel,
    ) -> Result<()>;
}

/// Hook that records nothing persistent; used for throwaway fits.
#[derive(Debug, Default)]
pub struct NullHook;

impl EpochHook for NullHook {
    fn begin_epoch(&mut self, epoch: usize) -> Result<EpochLosses> {
        Ok(EpochLosses::new(epoch))
    }

    fn end_epoch(
        &mut self,
        _epoch: usize,
        _losses: EpochLosses,
        _model: &dyn SequenceModel,
    ) -> Result<()> {
        Ok(())
    }
}
