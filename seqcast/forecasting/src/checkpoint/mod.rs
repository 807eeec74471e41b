//! Periodic weight checkpoints and the per-epoch loss log.
//!
//! Layout under a save directory:
//!
//! ```text
//! <save_dir>/loss_log.csv
//! <save_dir>/weight/model_weights_epoch_005.json
//! <save_dir>/weight/model_weights_epoch_010.json
//! ```
//!
//! Every file is written through [`crate::persist`], so a failed epoch never
//! leaves a partial checkpoint or loss row behind.

/// CSV loss table.
pub mod loss_log;

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    error::{ForecastError, Result},
    model::{EpochHook, EpochLosses, SequenceModel},
    persist,
    telemetry::RunTelemetry,
};

pub use loss_log::{LossLog, LossRow};

/// Default save directory name.
pub const DEFAULT_SAVE_DIR: &str = "checkpoint_saved";
/// Weight sub-directory name.
pub const WEIGHT_DIR: &str = "weight";
/// Loss log file name.
pub const LOSS_LOG_FILE: &str = "loss_log.csv";
/// Extension of weight snapshots.
pub const WEIGHT_EXTENSION: &str = "json";

const WEIGHT_PREFIX: &str = "model_weights_";

/// File name of the checkpoint for `epoch`, zero-padded so names sort in epoch order.
#[must_use]
pub fn checkpoint_file_name(epoch: usize) -> String {
    format!("{WEIGHT_PREFIX}epoch_{epoch:03}.{WEIGHT_EXTENSION}")
}

/// A persisted checkpoint on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRef {
    /// Weight file.
    pub path: PathBuf,
    /// Epoch the weights were saved after.
    pub epoch: usize,
}

impl CheckpointRef {
    /// Parses a checkpoint path; `None` for files that are not checkpoints.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.extension()? != WEIGHT_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let digits = stem.strip_prefix(WEIGHT_PREFIX)?.strip_prefix("epoch_")?;
        let epoch = digits.parse().ok()?;
        Some(Self {
            path: path.to_path_buf(),
            epoch,
        })
    }

    /// Tag such as `epoch_020`, used to name artifacts derived from this checkpoint.
    #[must_use]
    pub fn epoch_label(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.find("epoch_").map(|i| s[i..].to_owned()))
            .unwrap_or_else(|| format!("epoch_{:03}", self.epoch))
    }
}

/// Checkpoints in `weight_dir`, sorted by file name.
pub fn list_checkpoints(weight_dir: &Path) -> Result<Vec<CheckpointRef>> {
    if !weight_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(weight_dir)? {
        let path = entry?.path();
        if let Some(ckpt) = CheckpointRef::from_path(&path) {
            found.push(ckpt);
        }
    }
    found.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(found)
}

/// Last checkpoint by file name, or `CheckpointNotFound`.
pub fn latest_checkpoint(weight_dir: &Path) -> Result<CheckpointRef> {
    list_checkpoints(weight_dir)?
        .pop()
        .ok_or_else(|| ForecastError::CheckpointNotFound {
            dir: weight_dir.to_path_buf(),
        })
}

/// Where the manager is in the epoch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    /// No epoch running.
    Idle,
    /// Collecting batch losses for an epoch.
    EpochInProgress {
        /// 1-based epoch index.
        epoch: usize,
    },
    /// Statistics computed, persistence pending or failed.
    EpochComplete {
        /// 1-based epoch index.
        epoch: usize,
    },
    /// Weights written for this epoch.
    CheckpointSaved {
        /// 1-based epoch index.
        epoch: usize,
    },
    /// Epoch not on the save interval.
    CheckpointSkipped {
        /// 1-based epoch index.
        epoch: usize,
    },
}

/// Drives persistence during [`SequenceModel::fit`]: one loss row per epoch,
/// one weight file every `save_every` epochs.
#[derive(Debug)]
pub struct CheckpointManager {
    weight_dir: PathBuf,
    save_every: usize,
    epoch_offset: usize,
    phase: CheckpointPhase,
    loss_log: LossLog,
    saved: Vec<CheckpointRef>,
    telemetry: RunTelemetry,
}

impl CheckpointManager {
    /// Starts a fresh run: creates the directories and an empty loss log.
    /// Weight files left by an earlier run are removed so the latest
    /// checkpoint always belongs to this run.
    pub fn create(save_dir: impl AsRef<Path>, save_every: usize) -> Result<Self> {
        let (weight_dir, log_path) = prepare_dirs(save_dir.as_ref(), save_every)?;
        for stale in list_checkpoints(&weight_dir)? {
            fs::remove_file(&stale.path).map_err(|err| ForecastError::persistence(&stale.path, err))?;
        }
        Ok(Self::with_log(
            weight_dir,
            save_every,
            0,
            LossLog::create(log_path)?,
        ))
    }

    /// Continues after the checkpoint of `last_epoch`: epochs are numbered from
    /// `last_epoch + 1` and loss rows past `last_epoch` are discarded.
    pub fn resume(save_dir: impl AsRef<Path>, save_every: usize, last_epoch: usize) -> Result<Self> {
        let (weight_dir, log_path) = prepare_dirs(save_dir.as_ref(), save_every)?;
        Ok(Self::with_log(
            weight_dir,
            save_every,
            last_epoch,
            LossLog::reopen(log_path, last_epoch)?,
        ))
    }

    fn with_log(weight_dir: PathBuf, save_every: usize, epoch_offset: usize, loss_log: LossLog) -> Self {
        Self {
            weight_dir,
            save_every,
            epoch_offset,
            phase: CheckpointPhase::Idle,
            loss_log,
            saved: Vec::new(),
            telemetry: RunTelemetry::disabled(),
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: RunTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    /// Checkpoints written by this manager, in epoch order.
    #[must_use]
    pub fn saved(&self) -> &[CheckpointRef] {
        &self.saved
    }

    /// Loss rows so far (including rows kept from a resumed run).
    #[must_use]
    pub fn loss_rows(&self) -> &[LossRow] {
        self.loss_log.rows()
    }

    /// Directory holding weight files.
    #[must_use]
    pub fn weight_dir(&self) -> &Path {
        &self.weight_dir
    }

    /// Returns to `Idle` once training is over.
    pub fn finish(&mut self) -> Result<()> {
        match self.phase {
            CheckpointPhase::EpochInProgress { epoch } | CheckpointPhase::EpochComplete { epoch } => {
                Err(ForecastError::Phase(format!(
                    "epoch {epoch} did not complete; run is not finished"
                )))
            }
            _ => {
                self.phase = CheckpointPhase::Idle;
                Ok(())
            }
        }
    }

    const fn global_epoch(&self, local: usize) -> usize {
        self.epoch_offset + local + 1
    }

    fn save_checkpoint(&mut self, epoch: usize, model: &dyn SequenceModel) -> Result<()> {
        let path = self.weight_dir.join(checkpoint_file_name(epoch));
        persist::write_with(&path, |staged| model.save(staged))?;
        self.telemetry.info(
            "checkpoint_saved",
            json!({ "epoch": epoch, "path": path.display().to_string() }),
        );
        self.saved.push(CheckpointRef { path, epoch });
        Ok(())
    }

    /// Withdraws the checkpoint of an epoch whose loss row could not be written.
    fn discard_checkpoint(&mut self, epoch: usize) {
        let Some(pos) = self.saved.iter().rposition(|c| c.epoch == epoch) else {
            return;
        };
        let ckpt = self.saved.remove(pos);
        if let Err(err) = fs::remove_file(&ckpt.path) {
            self.telemetry.warn(
                "checkpoint_discard_failed",
                json!({
                    "epoch": epoch,
                    "path": ckpt.path.display().to_string(),
                    "error": err.to_string(),
                }),
            );
            return;
        }
        self.telemetry
            .warn("checkpoint_discarded", json!({ "epoch": epoch }));
    }
}

impl EpochHook for CheckpointManager {
    fn begin_epoch(&mut self, epoch: usize) -> Result<EpochLosses> {
        match self.phase {
            CheckpointPhase::Idle
            | CheckpointPhase::CheckpointSaved { .. }
            | CheckpointPhase::CheckpointSkipped { .. } => {
                self.phase = CheckpointPhase::EpochInProgress {
                    epoch: self.global_epoch(epoch),
                };
                Ok(EpochLosses::new(epoch))
            }
            other => Err(ForecastError::Phase(format!(
                "cannot start epoch {} while {other:?}",
                self.global_epoch(epoch)
            ))),
        }
    }

    fn end_batch(&mut self, batch: usize, loss: f64, losses: &mut EpochLosses) -> Result<()> {
        if !matches!(self.phase, CheckpointPhase::EpochInProgress { .. }) {
            return Err(ForecastError::Phase(format!(
                "batch {batch} finished outside an epoch ({:?})",
                self.phase
            )));
        }
        losses.record(loss);
        Ok(())
    }

    fn end_epoch(
        &mut self,
        epoch: usize,
        losses: EpochLosses,
        model: &dyn SequenceModel,
    ) -> Result<()> {
        let index = self.global_epoch(epoch);
        if self.phase != (CheckpointPhase::EpochInProgress { epoch: index }) || losses.epoch() != epoch
        {
            return Err(ForecastError::Phase(format!(
                "epoch {index} ended while {:?}",
                self.phase
            )));
        }
        let summary = losses.summary().ok_or_else(|| {
            ForecastError::Phase(format!("epoch {index} ended without any batch loss"))
        })?;
        self.phase = CheckpointPhase::EpochComplete { epoch: index };
        self.telemetry.info(
            "epoch_complete",
            json!({
                "epoch": index,
                "mean_loss": summary.mean,
                "std_loss": summary.std,
                "batches": summary.batches,
            }),
        );

        let saving = index % self.save_every == 0;
        if saving {
            self.save_checkpoint(index, model)?;
        }
        let appended = self.loss_log.append(LossRow {
            epoch: index,
            mean_loss: summary.mean,
            std_loss: summary.std,
        });
        if let Err(err) = appended {
            if saving {
                self.discard_checkpoint(index);
            }
            return Err(err);
        }
        self.phase = if saving {
            CheckpointPhase::CheckpointSaved { epoch: index }
        } else {
            self.telemetry
                .log(LogLevel::Debug, "checkpoint_skipped", json!({ "epoch": index }));
            CheckpointPhase::CheckpointSkipped { epoch: index }
        };
        Ok(())
    }
}

fn prepare_dirs(save_dir: &Path, save_every: usize) -> Result<(PathBuf, PathBuf)> {
    if save_every == 0 {
        return Err(ForecastError::InvalidConfig(
            "checkpoint interval must be at least 1".into(),
        ));
    }
    let weight_dir = save_dir.join(WEIGHT_DIR);
    fs::create_dir_all(&weight_dir).map_err(|err| ForecastError::persistence(&weight_dir, err))?;
    Ok((weight_dir, save_dir.join(LOSS_LOG_FILE)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FitOptions, ModelShape};
    use crate::window::WindowDataset;
    use ndarray::{Array2, ArrayView2};
    use tempfile::tempdir;

    /// Model that only knows how to save a marker.
    struct Marker;

    impl SequenceModel for Marker {
        fn build(&mut self, _: ModelShape) -> Result<()> {
            Ok(())
        }

        fn shape(&self) -> Result<ModelShape> {
            Ok(ModelShape {
                sample_size: 1,
                output_size: 1,
                features: 1,
            })
        }

        fn fit(&mut self, _: &WindowDataset, _: FitOptions, _: &mut dyn EpochHook) -> Result<()> {
            Ok(())
        }

        fn infer(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
            Ok(input.to_owned())
        }

        fn save(&self, path: &Path) -> Result<()> {
            fs::write(path, "marker").map_err(|err| ForecastError::persistence(path, err))
        }

        fn load(&mut self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Model whose weights can never be written.
    struct Unwritable;

    impl SequenceModel for Unwritable {
        fn build(&mut self, _: ModelShape) -> Result<()> {
            Ok(())
        }

        fn shape(&self) -> Result<ModelShape> {
            Marker.shape()
        }

        fn fit(&mut self, _: &WindowDataset, _: FitOptions, _: &mut dyn EpochHook) -> Result<()> {
            Ok(())
        }

        fn infer(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
            Ok(input.to_owned())
        }

        fn save(&self, path: &Path) -> Result<()> {
            Err(ForecastError::persistence(
                path,
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            ))
        }

        fn load(&mut self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn run_epoch(manager: &mut CheckpointManager, epoch: usize, losses: &[f64]) -> Result<()> {
        run_epoch_with(manager, epoch, losses, &Marker)
    }

    fn run_epoch_with(
        manager: &mut CheckpointManager,
        epoch: usize,
        losses: &[f64],
        model: &dyn SequenceModel,
    ) -> Result<()> {
        let mut acc = manager.begin_epoch(epoch)?;
        for (batch, loss) in losses.iter().enumerate() {
            manager.end_batch(batch, *loss, &mut acc)?;
        }
        manager.end_epoch(epoch, acc, model)
    }

    #[test]
    fn saves_on_interval_and_logs_every_epoch() {
        let dir = tempdir().unwrap();
        let mut manager = CheckpointManager::create(dir.path(), 5).unwrap();
        for epoch in 0..12 {
            run_epoch(&mut manager, epoch, &[0.5, 0.3]).unwrap();
        }
        manager.finish().unwrap();

        let epochs: Vec<usize> = manager.saved().iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![5, 10]);
        assert_eq!(manager.loss_rows().len(), 12);
        let on_disk = list_checkpoints(manager.weight_dir()).unwrap();
        assert_eq!(on_disk.len(), 2);
        assert!(on_disk[1]
            .path
            .ends_with("weight/model_weights_epoch_010.json"));
        let rows = LossLog::read(dir.path().join(LOSS_LOG_FILE)).unwrap();
        assert_eq!(rows.len(), 12);
        assert!((rows[0].mean_loss - 0.4).abs() < 1e-9);
        assert!((rows[0].std_loss - 0.1).abs() < 1e-9);
    }

    #[test]
    fn out_of_order_calls_are_phase_errors() {
        let dir = tempdir().unwrap();
        let mut manager = CheckpointManager::create(dir.path(), 1).unwrap();
        let mut stray = EpochLosses::new(0);
        assert!(matches!(
            manager.end_batch(0, 1.0, &mut stray),
            Err(ForecastError::Phase(_))
        ));
        let acc = manager.begin_epoch(0).unwrap();
        assert!(manager.begin_epoch(1).is_err());
        assert!(manager.finish().is_err());
        // No batches recorded.
        assert!(matches!(
            manager.end_epoch(0, acc, &Marker),
            Err(ForecastError::Phase(_))
        ));
        assert!(list_checkpoints(manager.weight_dir()).unwrap().is_empty());
    }

    #[test]
    fn resume_continues_numbering() {
        let dir = tempdir().unwrap();
        let mut manager = CheckpointManager::create(dir.path(), 2).unwrap();
        for epoch in 0..5 {
            run_epoch(&mut manager, epoch, &[1.0]).unwrap();
        }
        let last = latest_checkpoint(manager.weight_dir()).unwrap();
        assert_eq!(last.epoch, 4);

        let mut resumed = CheckpointManager::resume(dir.path(), 2, last.epoch).unwrap();
        assert_eq!(resumed.loss_rows().len(), 4);
        for epoch in 0..2 {
            run_epoch(&mut resumed, epoch, &[0.5]).unwrap();
        }
        let epochs: Vec<usize> = list_checkpoints(resumed.weight_dir())
            .unwrap()
            .iter()
            .map(|c| c.epoch)
            .collect();
        assert_eq!(epochs, vec![2, 4, 6]);
        assert_eq!(resumed.loss_rows().last().unwrap().epoch, 6);
    }

    #[test]
    fn latest_checkpoint_requires_one() {
        let dir = tempdir().unwrap();
        let weight_dir = dir.path().join(WEIGHT_DIR);
        fs::create_dir_all(&weight_dir).unwrap();
        fs::write(weight_dir.join("notes.txt"), "x").unwrap();
        assert!(matches!(
            latest_checkpoint(&weight_dir),
            Err(ForecastError::CheckpointNotFound { .. })
        ));
    }

    #[test]
    fn checkpoint_names_parse_back() {
        assert_eq!(checkpoint_file_name(20), "model_weights_epoch_020.json");
        let ckpt = CheckpointRef::from_path(Path::new("w/model_weights_epoch_020.json")).unwrap();
        assert_eq!(ckpt.epoch, 20);
        assert_eq!(ckpt.epoch_label(), "epoch_020");
        assert!(CheckpointRef::from_path(Path::new("w/.staging-abc")).is_none());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(CheckpointManager::create(dir.path(), 0).is_err());
    }

    #[test]
    fn fresh_run_replaces_earlier_checkpoints() {
        let dir = tempdir().unwrap();
        let mut first = CheckpointManager::create(dir.path(), 5).unwrap();
        for epoch in 0..20 {
            run_epoch(&mut first, epoch, &[0.2]).unwrap();
        }
        first.finish().unwrap();
        assert_eq!(list_checkpoints(first.weight_dir()).unwrap().len(), 4);

        let mut second = CheckpointManager::create(dir.path(), 5).unwrap();
        for epoch in 0..10 {
            run_epoch(&mut second, epoch, &[0.1]).unwrap();
        }
        second.finish().unwrap();

        let on_disk = list_checkpoints(second.weight_dir()).unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(latest_checkpoint(second.weight_dir()).unwrap().epoch, 10);
        assert_eq!(LossLog::read(dir.path().join(LOSS_LOG_FILE)).unwrap().len(), 10);
    }

    #[test]
    fn failed_save_leaves_no_loss_row() {
        let dir = tempdir().unwrap();
        let mut manager = CheckpointManager::create(dir.path(), 1).unwrap();
        let err = run_epoch_with(&mut manager, 0, &[0.4], &Unwritable).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Persistence);
        assert!(manager.saved().is_empty());
        assert!(manager.loss_rows().is_empty());
        assert!(list_checkpoints(manager.weight_dir()).unwrap().is_empty());
        assert!(LossLog::read(dir.path().join(LOSS_LOG_FILE)).unwrap().is_empty());
        assert!(manager.finish().is_err());
    }

    #[test]
    fn failed_loss_row_withdraws_the_checkpoint() {
        let dir = tempdir().unwrap();
        let mut manager = CheckpointManager::create(dir.path(), 1).unwrap();
        let log_path = dir.path().join(LOSS_LOG_FILE);
        fs::remove_file(&log_path).unwrap();
        fs::create_dir(&log_path).unwrap();

        let err = run_epoch(&mut manager, 0, &[0.4]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Persistence);
        assert!(manager.saved().is_empty());
        assert!(manager.loss_rows().is_empty());
        assert!(matches!(
            latest_checkpoint(manager.weight_dir()),
            Err(ForecastError::CheckpointNotFound { .. })
        ));
    }
}
