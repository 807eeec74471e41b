use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::DEFAULT_SAVE_DIR,
    error::{ForecastError, Result},
    model::{FitOptions, LinearModelConfig},
    roller::ContinuityCorrection,
};

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Train and checkpoint only.
    Train,
    /// Forecast from the latest checkpoint only.
    Predict,
    /// Train, then forecast from the latest checkpoint.
    #[default]
    All,
}

impl RunMode {
    /// Whether the mode trains.
    #[must_use]
    pub const fn trains(self) -> bool {
        matches!(self, Self::Train | Self::All)
    }

    /// Whether the mode forecasts.
    #[must_use]
    pub const fn forecasts(self) -> bool {
        matches!(self, Self::Predict | Self::All)
    }
}

/// Training and forecasting parameters for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Input window length S.
    pub sample_size: usize,
    /// Output window length O; defaults to `sample_size`.
    pub output_size: Option<usize>,
    /// Epochs to train.
    pub epochs: usize,
    /// Windows per batch.
    pub batch_size: usize,
    /// Checkpoint every this many epochs.
    pub save_every: usize,
    /// SGD step size of the built-in model.
    pub learning_rate: f64,
    /// Seed for weight init and shuffling.
    pub seed: u64,
    /// Shuffle windows each epoch.
    pub shuffle: bool,
    /// Root of checkpoints and loss log.
    pub save_dir: PathBuf,
    /// Feature used for continuity correction and evaluation.
    pub target_feature: usize,
    /// Correction policy; defaults to `Feature(target_feature)`.
    pub correction: Option<ContinuityCorrection>,
    /// Forecast horizon when no ground truth table is given.
    pub horizon: Option<usize>,
    /// Stages to run.
    pub mode: RunMode,
    /// Continue from the latest checkpoint instead of fresh weights.
    pub resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sample_size: 0,
            output_size: None,
            epochs: 10,
            batch_size: 32,
            save_every: 5,
            learning_rate: 0.01,
            seed: 42,
            shuffle: false,
            save_dir: PathBuf::from(DEFAULT_SAVE_DIR),
            target_feature: 2,
            correction: None,
            horizon: None,
            mode: RunMode::All,
            resume: false,
        }
    }
}

impl RunConfig {
    /// Reads a JSON config; absent keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Rejects values no run could use.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ForecastError::InvalidConfig(msg.to_owned()));
        if self.sample_size == 0 {
            return invalid("sample_size must be at least 1");
        }
        if self.output_size() == 0 {
            return invalid("output_size must be at least 1");
        }
        if self.mode.trains() && self.epochs == 0 {
            return invalid("epochs must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.save_every == 0 {
            return invalid("save_every must be at least 1");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid("learning_rate must be a positive number");
        }
        Ok(())
    }

    /// Effective output window length.
    #[must_use]
    pub fn output_size(&self) -> usize {
        self.output_size.unwrap_or(self.sample_size)
    }

    /// Effective correction policy.
    #[must_use]
    pub fn correction(&self) -> ContinuityCorrection {
        self.correction
            .unwrap_or(ContinuityCorrection::Feature(self.target_feature))
    }

    /// Schedule handed to the model.
    #[must_use]
    pub const fn fit_options(&self) -> FitOptions {
        FitOptions {
            epochs: self.epochs,
            batch_size: self.batch_size,
        }
    }

    /// Settings for the built-in model.
    #[must_use]
    pub const fn model_config(&self) -> LinearModelConfig {
        LinearModelConfig {
            learning_rate: self.learning_rate,
            seed: self.seed,
            shuffle: self.shuffle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn json_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(
            &path,
            r#"{ "sample_size": 20, "epochs": 12, "mode": "predict", "correction": "all_features" }"#,
        )
        .unwrap();
        let config = RunConfig::from_json_file(&path).unwrap();
        assert_eq!(config.sample_size, 20);
        assert_eq!(config.output_size(), 20);
        assert_eq!(config.epochs, 12);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.mode, RunMode::Predict);
        assert_eq!(config.correction(), ContinuityCorrection::AllFeatures);
        config.validate().unwrap();
    }

    #[test]
    fn defaults_need_a_sample_size() {
        let config = RunConfig::default();
        assert!(config.validate().is_err());
        assert_eq!(config.correction(), ContinuityCorrection::Feature(2));
        let config = RunConfig {
            sample_size: 5,
            save_every: 0,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn predict_mode_allows_zero_epochs() {
        let config = RunConfig {
            sample_size: 5,
            epochs: 0,
            mode: RunMode::Predict,
            ..RunConfig::default()
        };
        config.validate().unwrap();
    }
}
