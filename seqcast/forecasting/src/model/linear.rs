use std::{fs, path::Path};

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{EpochHook, FitOptions, ModelShape, SequenceModel};
use crate::{
    error::{ForecastError, Result},
    window::{Window, WindowDataset},
};

/// Optimizer settings for [`LinearSequenceModel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModelConfig {
    /// SGD step size.
    pub learning_rate: f64,
    /// Seed for weight init and batch shuffling.
    pub seed: u64,
    /// Shuffle window order each epoch.
    pub shuffle: bool,
}

impl Default for LinearModelConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            seed: 42,
            shuffle: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinearWeights {
    shape: ModelShape,
    /// `(S*F) x (O*F)`
    weights: Array2<f64>,
    /// `O*F`
    bias: Array1<f64>,
}

/// Dense map from a flattened `S x F` window to an `O x F` window, trained
/// with mini-batch SGD on mean absolute error.
#[derive(Debug, Clone)]
pub struct LinearSequenceModel {
    config: LinearModelConfig,
    rng: SmallRng,
    state: Option<LinearWeights>,
}

impl LinearSequenceModel {
    /// Creates an unbuilt model.
    #[must_use]
    pub fn new(config: LinearModelConfig) -> Self {
        let rng = SmallRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            state: None,
        }
    }

    /// Whether `build` or a load has happened.
    #[must_use]
    pub const fn is_built(&self) -> bool {
        self.state.is_some()
    }

    fn built(&self) -> Result<&LinearWeights> {
        self.state.as_ref().ok_or(ForecastError::ModelNotBuilt)
    }

    /// One SGD step on a batch; returns the pre-update MAE.
    #[allow(clippy::cast_precision_loss)]
    fn step(&mut self, batch: &[&Window]) -> Result<f64> {
        let lr = self.config.learning_rate;
        let state = self.state.as_mut().ok_or(ForecastError::ModelNotBuilt)?;
        let x = stack(batch.iter().map(|w| &w.input), state.weights.nrows())?;
        let y = stack(batch.iter().map(|w| &w.target), state.weights.ncols())?;

        let diff = x.dot(&state.weights) + &state.bias - &y;
        let loss = diff.mapv(f64::abs).mean().unwrap_or(0.0);
        let grad = diff.mapv(sign) / diff.len() as f64;

        state.weights.scaled_add(-lr, &x.t().dot(&grad));
        state.bias.scaled_add(-lr, &grad.sum_axis(Axis(0)));
        Ok(loss)
    }
}

impl Default for LinearSequenceModel {
    fn default() -> Self {
        Self::new(LinearModelConfig::default())
    }
}

impl SequenceModel for LinearSequenceModel {
    fn build(&mut self, shape: ModelShape) -> Result<()> {
        if shape.sample_size == 0 || shape.output_size == 0 || shape.features == 0 {
            return Err(ForecastError::InvalidConfig(format!(
                "model dimensions must be non-zero, got {shape:?}"
            )));
        }
        let inputs = shape.sample_size * shape.features;
        let outputs = shape.output_size * shape.features;
        let rng = &mut self.rng;
        let weights = Array2::from_shape_fn((inputs, outputs), |_| rng.gen_range(-0.1..0.1));
        self.state = Some(LinearWeights {
            shape,
            weights,
            bias: Array1::zeros(outputs),
        });
        Ok(())
    }

    fn shape(&self) -> Result<ModelShape> {
        Ok(self.built()?.shape)
    }

    fn fit(
        &mut self,
        dataset: &WindowDataset,
        options: FitOptions,
        hook: &mut dyn EpochHook,
    ) -> Result<()> {
        let shape = self.shape()?;
        dataset.ensure_trainable()?;
        let found = (
            dataset.sample_size(),
            dataset.output_size(),
            dataset.feature_count(),
        );
        if found != (shape.sample_size, shape.output_size, shape.features) {
            return Err(ForecastError::shape(shape, found));
        }

        let mut order: Vec<usize> = (0..dataset.len()).collect();
        for epoch in 0..options.epochs {
            let mut losses = hook.begin_epoch(epoch)?;
            if self.config.shuffle {
                order.shuffle(&mut self.rng);
            }
            for (batch, chunk) in order.chunks(options.batch_size.max(1)).enumerate() {
                let windows: Vec<&Window> = chunk.iter().map(|&i| &dataset.windows()[i]).collect();
                let loss = self.step(&windows)?;
                hook.end_batch(batch, loss, &mut losses)?;
            }
            hook.end_epoch(epoch, losses, &*self)?;
        }
        Ok(())
    }

    fn infer(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let state = self.built()?;
        let shape = state.shape;
        if input.dim() != (shape.sample_size, shape.features) {
            return Err(ForecastError::shape(
                (shape.sample_size, shape.features),
                input.dim(),
            ));
        }
        let flat = Array1::from_iter(input.iter().copied());
        let out = flat.dot(&state.weights) + &state.bias;
        out.into_shape((shape.output_size, shape.features))
            .map_err(|err| ForecastError::Shape {
                expected: format!("{:?}", (shape.output_size, shape.features)),
                found: err.to_string(),
            })
    }

    fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self.built()?)?;
        fs::write(path, bytes).map_err(|err| ForecastError::persistence(path, err))
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let bytes = fs::read(path)?;
        let loaded: LinearWeights = serde_json::from_slice(&bytes)?;
        let (rows, cols) = loaded.weights.dim();
        let shape = loaded.shape;
        if rows != shape.sample_size * shape.features
            || cols != shape.output_size * shape.features
            || loaded.bias.len() != cols
        {
            return Err(ForecastError::shape(shape, (rows, cols, loaded.bias.len())));
        }
        if let Some(current) = &self.state {
            if current.shape != shape {
                return Err(ForecastError::shape(current.shape, shape));
            }
        }
        self.state = Some(loaded);
        Ok(())
    }
}

/// Flattens each `rows x F` matrix into one row of the result.
fn stack<'a>(mats: impl Iterator<Item = &'a Array2<f64>>, width: usize) -> Result<Array2<f64>> {
    let mut flat = Vec::new();
    let mut count = 0;
    for m in mats {
        if m.len() != width {
            return Err(ForecastError::shape(width, m.dim()));
        }
        flat.extend(m.iter().copied());
        count += 1;
    }
    Array2::from_shape_vec((count, width), flat)
        .map_err(|err| ForecastError::Series(err.to_string()))
}

fn sign(d: f64) -> f64 {
    if d > 0.0 {
        1.0
    } else if d < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EpochLosses, NullHook};
    use ndarray::Array2;
    use tempfile::tempdir;

    fn shape() -> ModelShape {
        ModelShape {
            sample_size: 4,
            output_size: 2,
            features: 2,
        }
    }

    fn dataset() -> WindowDataset {
        let data = Array2::from_shape_fn((30, 2), |(t, f)| ((t as f64) * 0.2 + f as f64).sin());
        WindowDataset::build(data.view(), 4, 2).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        epochs: Vec<Vec<f64>>,
    }

    impl EpochHook for Recorder {
        fn begin_epoch(&mut self, epoch: usize) -> Result<EpochLosses> {
            Ok(EpochLosses::new(epoch))
        }

        fn end_epoch(
            &mut self,
            _epoch: usize,
            losses: EpochLosses,
            _model: &dyn SequenceModel,
        ) -> Result<()> {
            self.epochs.push(losses.losses().to_vec());
            Ok(())
        }
    }

    #[test]
    fn unbuilt_model_refuses_work() {
        let mut model = LinearSequenceModel::default();
        let input = Array2::zeros((4, 2));
        assert!(matches!(model.infer(input.view()), Err(ForecastError::ModelNotBuilt)));
        let options = FitOptions {
            epochs: 1,
            batch_size: 4,
        };
        assert!(matches!(
            model.fit(&dataset(), options, &mut NullHook),
            Err(ForecastError::ModelNotBuilt)
        ));
    }

    #[test]
    fn fit_reports_every_batch_and_reduces_loss() {
        let mut model = LinearSequenceModel::new(LinearModelConfig {
            learning_rate: 0.05,
            ..LinearModelConfig::default()
        });
        model.build(shape()).unwrap();
        let ds = dataset();
        let mut recorder = Recorder::default();
        model
            .fit(
                &ds,
                FitOptions {
                    epochs: 30,
                    batch_size: 8,
                },
                &mut recorder,
            )
            .unwrap();
        assert_eq!(recorder.epochs.len(), 30);
        let batches = ds.len().div_ceil(8);
        assert!(recorder.epochs.iter().all(|e| e.len() == batches));
        let first: f64 = recorder.epochs[0].iter().sum();
        let last: f64 = recorder.epochs[29].iter().sum();
        assert!(last < first);
    }

    #[test]
    fn infer_is_deterministic_and_survives_reload() {
        let mut model = LinearSequenceModel::default();
        model.build(shape()).unwrap();
        let input = Array2::from_shape_fn((4, 2), |(r, c)| (r + c) as f64 * 0.1);
        let a = model.infer(input.view()).unwrap();
        let b = model.infer(input.view()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), (2, 2));

        let dir = tempdir().unwrap();
        let path = dir.path().join("w.json");
        model.save(&path).unwrap();
        let mut restored = LinearSequenceModel::default();
        restored.load(&path).unwrap();
        assert_eq!(restored.infer(input.view()).unwrap(), a);
    }

    #[test]
    fn load_rejects_other_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.json");
        let mut other = LinearSequenceModel::default();
        other
            .build(ModelShape {
                sample_size: 3,
                output_size: 3,
                features: 2,
            })
            .unwrap();
        other.save(&path).unwrap();

        let mut model = LinearSequenceModel::default();
        model.build(shape()).unwrap();
        assert!(matches!(model.load(&path), Err(ForecastError::Shape { .. })));
    }

    #[test]
    fn wrong_input_shape_is_rejected() {
        let mut model = LinearSequenceModel::default();
        model.build(shape()).unwrap();
        let input = Array2::zeros((3, 2));
        assert!(matches!(model.infer(input.view()), Err(ForecastError::Shape { .. })));
    }
}
