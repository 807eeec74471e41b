//! Autoregressive multi-step forecasting.
//!
//! The model only predicts `O` steps from `S` steps. To cover a longer
//! horizon the roller feeds each denormalized prediction back into a raw
//! buffer of the last `S` rows and predicts again. Errors compound: drift is
//! non-decreasing with horizon and nothing here bounds it.

use ndarray::{concatenate, s, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ForecastError, Result},
    model::SequenceModel,
    scaler::ScalerState,
};

/// How a forecast is shifted to meet the last observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityCorrection {
    /// Leave the forecast as predicted.
    None,
    /// Shift only this feature so its first forecast step equals its last
    /// observation. Other features keep their bias.
    Feature(usize),
    /// Shift every feature independently.
    AllFeatures,
}

impl Default for ContinuityCorrection {
    fn default() -> Self {
        Self::Feature(2)
    }
}

/// Raw-scale forecast, `target_length x features`.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    values: Array2<f64>,
    inferences: usize,
}

impl Forecast {
    /// Forecast rows.
    #[must_use]
    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// Consumes the forecast, returning its rows.
    #[must_use]
    pub fn into_values(self) -> Array2<f64> {
        self.values
    }

    /// Number of forecast steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    /// Whether the horizon was zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    /// How many times the model was invoked.
    #[must_use]
    pub const fn inferences(&self) -> usize {
        self.inferences
    }

    /// One feature across the horizon.
    #[must_use]
    pub fn column(&self, feature: usize) -> ArrayView1<'_, f64> {
        self.values.column(feature)
    }

    /// Applies `policy` so that corrected features start at `last_observed`.
    pub fn correct(
        &mut self,
        last_observed: ArrayView1<'_, f64>,
        policy: ContinuityCorrection,
    ) -> Result<()> {
        let features = self.values.ncols();
        if last_observed.len() != features {
            return Err(ForecastError::shape(features, last_observed.len()));
        }
        let targets: Vec<usize> = match policy {
            ContinuityCorrection::None => return Ok(()),
            ContinuityCorrection::Feature(f) if f >= features => {
                return Err(ForecastError::InvalidConfig(format!(
                    "correction feature {f} out of range for {features} features"
                )))
            }
            ContinuityCorrection::Feature(f) => vec![f],
            ContinuityCorrection::AllFeatures => (0..features).collect(),
        };
        if self.is_empty() {
            return Ok(());
        }
        for f in targets {
            let offset = last_observed[f] - self.values[[0, f]];
            self.values.column_mut(f).mapv_inplace(|v| v + offset);
            // Exact continuity even when the addition rounds.
            self.values[[0, f]] = last_observed[f];
        }
        Ok(())
    }
}

/// Drives a model across a horizon longer than one output window.
pub struct ForecastRoller<'a, M: SequenceModel + ?Sized> {
    model: &'a M,
    scaler: &'a ScalerState,
}

impl<'a, M: SequenceModel + ?Sized> ForecastRoller<'a, M> {
    /// Borrows a built model and the session's scaler state.
    pub const fn new(model: &'a M, scaler: &'a ScalerState) -> Self {
        Self { model, scaler }
    }

    /// Predicts `target_length` raw steps after `history`, whose last `S`
    /// rows seed the buffer.
    pub fn roll(&self, history: ArrayView2<'_, f64>, target_length: usize) -> Result<Forecast> {
        let shape = self.model.shape()?;
        let (sample_size, output_size) = (shape.sample_size, shape.output_size);
        if history.nrows() < sample_size {
            return Err(ForecastError::InsufficientHistory {
                available: history.nrows(),
                required: sample_size,
            });
        }
        if history.ncols() != shape.features {
            return Err(ForecastError::shape(shape.features, history.ncols()));
        }

        let iters = target_length / output_size;
        let rem = target_length % output_size;
        let mut buffer = history.slice(s![history.nrows() - sample_size.., ..]).to_owned();
        let mut segments: Vec<Array2<f64>> = Vec::with_capacity(iters + 1);

        for _ in 0..iters {
            let predicted = self.predict_raw(buffer.view())?;
            let joined = concatenate(Axis(0), &[buffer.view(), predicted.view()])
                .map_err(|err| ForecastError::Series(err.to_string()))?;
            buffer = joined.slice(s![joined.nrows() - sample_size.., ..]).to_owned();
            segments.push(predicted);
        }
        if rem > 0 {
            let predicted = self.predict_raw(buffer.view())?;
            segments.push(predicted.slice(s![..rem, ..]).to_owned());
        }

        let inferences = segments.len();
        let values = if segments.is_empty() {
            Array2::zeros((0, shape.features))
        } else {
            let views: Vec<ArrayView2<'_, f64>> = segments.iter().map(|seg| seg.view()).collect();
            concatenate(Axis(0), &views).map_err(|err| ForecastError::Series(err.to_string()))?
        };
        Ok(Forecast { values, inferences })
    }

    /// [`Self::roll`] followed by continuity correction against the last row of `history`.
    pub fn roll_corrected(
        &self,
        history: ArrayView2<'_, f64>,
        target_length: usize,
        policy: ContinuityCorrection,
    ) -> Result<Forecast> {
        let mut forecast = self.roll(history, target_length)?;
        let last = history.row(history.nrows() - 1);
        forecast.correct(last, policy)?;
        Ok(forecast)
    }

    fn predict_raw(&self, raw: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let normalized = self.scaler.transform(raw)?;
        let predicted = self.model.infer(normalized.view())?;
        self.scaler.inverse(predicted.view())
    }
}

/// Error statistics of one feature of a forecast against ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastEvaluation {
    /// Feature compared.
    pub feature: usize,
    /// Steps compared (shorter of the two lengths).
    pub steps: usize,
    /// Mean absolute error.
    pub mae: f64,
    /// Root mean squared error.
    pub rmse: f64,
    /// Mean of forecast minus truth.
    pub bias: f64,
}

impl ForecastEvaluation {
    /// Compares the common prefix of `forecast` and `truth` on `feature`.
    #[allow(clippy::cast_precision_loss)]
    pub fn compare(
        forecast: ArrayView2<'_, f64>,
        truth: ArrayView2<'_, f64>,
        feature: usize,
    ) -> Result<Self> {
        if feature >= forecast.ncols() || feature >= truth.ncols() {
            return Err(ForecastError::InvalidConfig(format!(
                "evaluation feature {feature} out of range"
            )));
        }
        let steps = forecast.nrows().min(truth.nrows());
        if steps == 0 {
            return Err(ForecastError::InsufficientData { rows: 0, required: 1 });
        }
        let errors: Vec<f64> = (0..steps)
            .map(|t| forecast[[t, feature]] - truth[[t, feature]])
            .collect();
        let n = steps as f64;
        Ok(Self {
            feature,
            steps,
            mae: errors.iter().map(|e| e.abs()).sum::<f64>() / n,
            rmse: (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt(),
            bias: errors.iter().sum::<f64>() / n,
        })
    }
}
