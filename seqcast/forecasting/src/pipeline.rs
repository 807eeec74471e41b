//! End-to-end runs: train, predict, or both, sharing one scaler state.

use std::path::{Path, PathBuf};

use ndarray::ArrayView2;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    checkpoint::{latest_checkpoint, CheckpointManager, CheckpointRef, LossRow, WEIGHT_DIR},
    config::RunConfig,
    error::{ForecastError, Result},
    model::{ModelShape, SequenceModel},
    persist,
    roller::{ContinuityCorrection, Forecast, ForecastEvaluation, ForecastRoller},
    scaler::{Scaler, ScalerState},
    series::TimeSeries,
    telemetry::RunTelemetry,
    window::WindowDataset,
};

/// File holding the scaler state fitted by the last training run.
pub const SCALER_FILE: &str = "scaler.json";

/// Result of the training stage.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// Windows trained on.
    pub windows: usize,
    /// Checkpoint the run resumed from, if any.
    pub resumed_from: Option<CheckpointRef>,
    /// Checkpoints written by this run.
    pub checkpoints: Vec<CheckpointRef>,
    /// Loss log after the run.
    pub loss_rows: Vec<LossRow>,
}

/// Result of the forecast stage.
#[derive(Debug, Clone)]
pub struct PredictionOutcome {
    /// Checkpoint whose weights produced the forecast.
    pub checkpoint: CheckpointRef,
    /// Corrected raw forecast.
    pub forecast: Forecast,
    /// Error against the ground-truth table, when one was given.
    pub evaluation: Option<ForecastEvaluation>,
    /// CSV the forecast was written to.
    pub output_path: PathBuf,
}

/// What a run produced.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Present when the mode trains.
    pub training: Option<TrainingOutcome>,
    /// Present when the mode forecasts.
    pub prediction: Option<PredictionOutcome>,
}

/// Runs the stages selected by [`RunConfig::mode`].
#[derive(Debug)]
pub struct ForecastPipeline {
    config: RunConfig,
    telemetry: RunTelemetry,
}

impl ForecastPipeline {
    /// Validates `config`.
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            telemetry: RunTelemetry::disabled(),
        })
    }

    /// Attaches telemetry sinks for structured logging.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: RunTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Directory holding weight files.
    #[must_use]
    pub fn weight_dir(&self) -> PathBuf {
        self.config.save_dir.join(WEIGHT_DIR)
    }

    /// Fits the session scaler on `training` and runs the configured stages
    /// against `model`.
    pub fn run(
        &self,
        model: &mut dyn SequenceModel,
        training: &TimeSeries,
        ground_truth: Option<&TimeSeries>,
    ) -> Result<RunReport> {
        let result = self.run_stages(model, training, ground_truth);
        if let Err(err) = &result {
            self.telemetry.log(
                LogLevel::Error,
                "run_failed",
                json!({ "error": err.to_string(), "kind": format!("{:?}", err.kind()) }),
            );
        }
        result
    }

    fn run_stages(
        &self,
        model: &mut dyn SequenceModel,
        training: &TimeSeries,
        ground_truth: Option<&TimeSeries>,
    ) -> Result<RunReport> {
        if self.config.mode.forecasts() {
            self.check_forecast_features(training)?;
        }
        let mut scaler = Scaler::new();
        let state = scaler.fit(training.values())?;
        let mut report = RunReport::default();
        if self.config.mode.trains() {
            report.training = Some(self.train(model, state, training)?);
        }
        if self.config.mode.forecasts() {
            report.prediction = Some(self.predict(model, state, training, ground_truth)?);
        }
        Ok(report)
    }

    /// Builds windows, trains with periodic checkpoints, and stores the scaler.
    pub fn train(
        &self,
        model: &mut dyn SequenceModel,
        state: &ScalerState,
        training: &TimeSeries,
    ) -> Result<TrainingOutcome> {
        let shape = self.shape_for(training);
        let normalized = state.transform(training.values())?;
        let dataset = WindowDataset::build(normalized.view(), shape.sample_size, shape.output_size)?;
        self.telemetry.info(
            "dataset_built",
            json!({ "rows": training.len(), "windows": dataset.len() }),
        );
        dataset.ensure_trainable().map_err(|_| ForecastError::InsufficientData {
            rows: training.len(),
            required: shape.sample_size + shape.output_size,
        })?;

        model.build(shape)?;
        let (manager, resumed_from) = if self.config.resume {
            let ckpt = latest_checkpoint(&self.weight_dir())?;
            model.load(&ckpt.path)?;
            self.telemetry.info(
                "checkpoint_loaded",
                json!({ "epoch": ckpt.epoch, "path": ckpt.path.display().to_string() }),
            );
            let manager =
                CheckpointManager::resume(&self.config.save_dir, self.config.save_every, ckpt.epoch)?;
            (manager, Some(ckpt))
        } else {
            let manager = CheckpointManager::create(&self.config.save_dir, self.config.save_every)?;
            (manager, None)
        };
        let mut manager = manager.with_telemetry(self.telemetry.clone());

        self.telemetry.info(
            "training_start",
            json!({
                "epochs": self.config.epochs,
                "batch_size": self.config.batch_size,
                "save_every": self.config.save_every,
                "resumed_from": resumed_from.as_ref().map(|c| c.epoch),
            }),
        );
        model.fit(&dataset, self.config.fit_options(), &mut manager)?;
        manager.finish()?;

        let scaler_path = self.config.save_dir.join(SCALER_FILE);
        persist::write_bytes(&scaler_path, &serde_json::to_vec_pretty(state)?)?;

        Ok(TrainingOutcome {
            windows: dataset.len(),
            resumed_from,
            checkpoints: manager.saved().to_vec(),
            loss_rows: manager.loss_rows().to_vec(),
        })
    }

    /// Loads the latest checkpoint and rolls a corrected forecast after
    /// `training`. The horizon is the ground-truth length when given,
    /// otherwise the configured horizon.
    pub fn predict(
        &self,
        model: &mut dyn SequenceModel,
        state: &ScalerState,
        training: &TimeSeries,
        ground_truth: Option<&TimeSeries>,
    ) -> Result<PredictionOutcome> {
        let horizon = match (ground_truth, self.config.horizon) {
            (Some(truth), _) => {
                if truth.feature_count() != training.feature_count() {
                    return Err(ForecastError::Series(format!(
                        "ground truth has {} features, training has {}",
                        truth.feature_count(),
                        training.feature_count()
                    )));
                }
                truth.len()
            }
            (None, Some(horizon)) => horizon,
            (None, None) => {
                return Err(ForecastError::InvalidConfig(
                    "forecast needs a ground-truth table or an explicit horizon".into(),
                ))
            }
        };

        let checkpoint = latest_checkpoint(&self.weight_dir())?;
        model.load(&checkpoint.path)?;
        let expected = self.shape_for(training);
        let loaded = model.shape()?;
        if loaded != expected {
            return Err(ForecastError::shape(expected, loaded));
        }
        self.telemetry.info(
            "checkpoint_loaded",
            json!({ "epoch": checkpoint.epoch, "path": checkpoint.path.display().to_string() }),
        );
        self.check_stored_scaler(state);

        let forecast = ForecastRoller::new(&*model, state).roll_corrected(
            training.values(),
            horizon,
            self.config.correction(),
        )?;
        let evaluation = ground_truth
            .map(|truth| {
                ForecastEvaluation::compare(forecast.values(), truth.values(), self.config.target_feature)
            })
            .transpose()?;

        let output_path = self
            .config
            .save_dir
            .join(format!("predict_{}.csv", checkpoint.epoch_label()));
        write_forecast_csv(&output_path, training.columns(), forecast.values(), ground_truth)?;
        self.telemetry.info(
            "forecast_complete",
            json!({
                "horizon": horizon,
                "inferences": forecast.inferences(),
                "output": output_path.display().to_string(),
                "mae": evaluation.map(|e| e.mae),
                "rmse": evaluation.map(|e| e.rmse),
            }),
        );

        Ok(PredictionOutcome {
            checkpoint,
            forecast,
            evaluation,
            output_path,
        })
    }

    fn shape_for(&self, training: &TimeSeries) -> ModelShape {
        ModelShape {
            sample_size: self.config.sample_size,
            output_size: self.config.output_size(),
            features: training.feature_count(),
        }
    }

    /// Rejects a designated feature the table does not have before any
    /// training time is spent.
    fn check_forecast_features(&self, training: &TimeSeries) -> Result<()> {
        let features = training.feature_count();
        let mut designated = vec![self.config.target_feature];
        if let ContinuityCorrection::Feature(f) = self.config.correction() {
            designated.push(f);
        }
        match designated.into_iter().find(|&f| f >= features) {
            Some(f) => Err(ForecastError::InvalidConfig(format!(
                "target feature {f} out of range for {features} features"
            ))),
            None => Ok(()),
        }
    }

    fn check_stored_scaler(&self, state: &ScalerState) {
        let path = self.config.save_dir.join(SCALER_FILE);
        let Ok(bytes) = std::fs::read(&path) else {
            return;
        };
        match serde_json::from_slice::<ScalerState>(&bytes) {
            Ok(stored) if stored.max_deviation(state) > 1e-9 => self.telemetry.warn(
                "scaler_mismatch",
                json!({
                    "path": path.display().to_string(),
                    "max_deviation": stored.max_deviation(state),
                }),
            ),
            Ok(_) => {}
            Err(err) => self.telemetry.warn(
                "scaler_unreadable",
                json!({ "path": path.display().to_string(), "error": err.to_string() }),
            ),
        }
    }
}

/// Writes forecast rows with ground-truth timestamps when available,
/// 1-based step numbers otherwise.
fn write_forecast_csv(
    path: &Path,
    columns: &[String],
    values: ArrayView2<'_, f64>,
    ground_truth: Option<&TimeSeries>,
) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let index_header = if ground_truth.is_some() { "timestamp" } else { "step" };
    writer.write_record(std::iter::once(index_header).chain(columns.iter().map(String::as_str)))?;
    for (t, row) in values.rows().into_iter().enumerate() {
        let index = ground_truth
            .and_then(|truth| truth.timestamps().get(t))
            .map_or_else(|| (t + 1).to_string(), |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string());
        writer.write_record(std::iter::once(index).chain(row.iter().map(ToString::to_string)))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| ForecastError::persistence(path, err.into_error()))?;
    persist::write_bytes(path, &bytes)
}
