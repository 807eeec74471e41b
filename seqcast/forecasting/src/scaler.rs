//! Robust per-feature scaling (median center, interquartile spread).

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

/// Fitted center/spread statistics. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    center: Array1<f64>,
    spread: Array1<f64>,
}

impl ScalerState {
    /// Computes median and interquartile range for every column of `reference`.
    pub fn fit(reference: ArrayView2<'_, f64>) -> Result<Self> {
        let (rows, cols) = reference.dim();
        if rows == 0 || cols == 0 {
            return Err(ForecastError::EmptyReference {
                rows,
                features: cols,
            });
        }
        let mut center = Array1::zeros(cols);
        let mut spread = Array1::zeros(cols);
        for (feature, column) in reference.axis_iter(Axis(1)).enumerate() {
            let mut sorted = column.to_vec();
            sorted.sort_by(f64::total_cmp);
            if sorted.windows(2).all(|w| w[0].total_cmp(&w[1]).is_eq()) {
                return Err(ForecastError::DegenerateFeature { feature });
            }
            let iqr = quantile(&sorted, 0.75) - quantile(&sorted, 0.25);
            center[feature] = quantile(&sorted, 0.5);
            // Tied quartiles with distinct outliers: keep the data unscaled.
            spread[feature] = if iqr > 0.0 { iqr } else { 1.0 };
        }
        Ok(Self { center, spread })
    }

    /// Number of features the state was fitted on.
    #[must_use]
    pub fn feature_count(&self) -> usize {
        self.center.len()
    }

    /// Per-feature centers (medians).
    #[must_use]
    pub const fn center(&self) -> &Array1<f64> {
        &self.center
    }

    /// Per-feature spreads (interquartile ranges).
    #[must_use]
    pub const fn spread(&self) -> &Array1<f64> {
        &self.spread
    }

    /// Raw to normalized: `(x - center) / spread`.
    pub fn transform(&self, raw: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.check_width(raw)?;
        Ok((&raw - &self.center) / &self.spread)
    }

    /// Normalized to raw: `x * spread + center`.
    pub fn inverse(&self, normalized: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.check_width(normalized)?;
        Ok(&normalized * &self.spread + &self.center)
    }

    /// Largest absolute difference in center or spread against another state.
    #[must_use]
    pub fn max_deviation(&self, other: &Self) -> f64 {
        if self.feature_count() != other.feature_count() {
            return f64::INFINITY;
        }
        let diffs = (&self.center - &other.center)
            .iter()
            .chain((&self.spread - &other.spread).iter())
            .map(|d| d.abs())
            .collect::<Vec<_>>();
        diffs.into_iter().fold(0.0, f64::max)
    }

    fn check_width(&self, data: ArrayView2<'_, f64>) -> Result<()> {
        if data.ncols() == self.feature_count() {
            Ok(())
        } else {
            Err(ForecastError::shape(
                ("_", self.feature_count()),
                data.dim(),
            ))
        }
    }
}

/// Linear-interpolated quantile of an ascending, non-empty slice.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Session holder enforcing a single fit. Consumers borrow the fitted
/// [`ScalerState`] through [`Scaler::state`].
#[derive(Debug, Default)]
pub struct Scaler {
    state: Option<ScalerState>,
}

impl Scaler {
    /// Creates an unfitted scaler.
    #[must_use]
    pub const fn new() -> Self {
        Self { state: None }
    }

    /// Fits on the reference series. Fails if already fitted this session.
    pub fn fit(&mut self, reference: ArrayView2<'_, f64>) -> Result<&ScalerState> {
        if self.state.is_some() {
            return Err(ForecastError::ScalerAlreadyFitted);
        }
        Ok(self.state.insert(ScalerState::fit(reference)?))
    }

    /// Fitted state, or `ScalerNotFitted`.
    pub fn state(&self) -> Result<&ScalerState> {
        self.state.as_ref().ok_or(ForecastError::ScalerNotFitted)
    }

    /// Whether `fit` has succeeded.
    #[must_use]
    pub const fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    /// Normalizes with the session state.
    pub fn transform(&self, raw: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.state()?.transform(raw)
    }

    /// Denormalizes with the session state.
    pub fn inverse(&self, normalized: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.state()?.inverse(normalized)
    }
}
