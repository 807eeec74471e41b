use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Datelike, Local};
use clap::{Parser, Subcommand, ValueEnum};
use seqcast_forecasting::{
    checkpoint::{list_checkpoints, LossLog, DEFAULT_SAVE_DIR, LOSS_LOG_FILE, WEIGHT_DIR},
    ContinuityCorrection, ForecastPipeline, LinearSequenceModel, RunConfig, RunMode, RunReport,
    RunTelemetry, TimeSeries,
};
use serde_json::json;
use shared_logging::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "fcst", version, about = "Windowed sequence-model training and rolling forecasts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Trains, forecasts, or both.
    Run(RunArgs),
    /// Prints the per-epoch loss log.
    Losses {
        #[arg(long, default_value = DEFAULT_SAVE_DIR)]
        save_dir: PathBuf,
    },
    /// Lists saved checkpoints, oldest first.
    Checkpoints {
        #[arg(long, default_value = DEFAULT_SAVE_DIR)]
        save_dir: PathBuf,
    },
}

#[derive(Parser, Debug, Default)]
struct RunArgs {
    /// Training table (CSV: timestamp column, then features).
    #[arg(long)]
    train: PathBuf,
    /// Verification table; its length sets the forecast horizon.
    #[arg(long)]
    ground_truth: Option<PathBuf>,
    /// JSON run configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Input window length.
    #[arg(long)]
    sample_size: Option<usize>,
    /// Output window length (defaults to the sample size).
    #[arg(long)]
    output_size: Option<usize>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Save weights every N epochs.
    #[arg(long)]
    save_interval: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    shuffle: bool,
    /// Forecast steps when no ground truth is given.
    #[arg(long)]
    horizon: Option<usize>,
    #[arg(long)]
    save_dir: Option<PathBuf>,
    /// Feature index used for correction and evaluation.
    #[arg(long)]
    target_feature: Option<usize>,
    #[arg(long, value_enum)]
    correction: Option<CorrectionArg>,
    /// Continue from the latest checkpoint.
    #[arg(long)]
    resume: bool,
    /// JSON-lines run log (defaults to <save_dir>/logs/YYYY/MM/DD/).
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Suppress console echo of log records.
    #[arg(long)]
    quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Train,
    Predict,
    All,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Train => Self::Train,
            ModeArg::Predict => Self::Predict,
            ModeArg::All => Self::All,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CorrectionArg {
    /// No shift.
    None,
    /// Shift the target feature only.
    Feature,
    /// Shift every feature.
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => handle_run(&args),
        Commands::Losses { save_dir } => {
            let path = save_dir.join(LOSS_LOG_FILE);
            let rows = LossLog::read(&path).with_context(|| format!("reading {path:?}"))?;
            println!("epoch,mean_loss,std_loss");
            for row in rows {
                println!("{},{:.4},{:.4}", row.epoch, row.mean_loss, row.std_loss);
            }
            Ok(())
        }
        Commands::Checkpoints { save_dir } => {
            let checkpoints = list_checkpoints(&save_dir.join(WEIGHT_DIR))?;
            if checkpoints.is_empty() {
                println!("no checkpoints in {:?}", save_dir.join(WEIGHT_DIR));
            }
            for ckpt in checkpoints {
                println!("{:>5} | {}", ckpt.epoch, ckpt.path.display());
            }
            Ok(())
        }
    }
}

fn handle_run(args: &RunArgs) -> Result<()> {
    let config = resolve_config(args)?;
    let log_path = match &args.log_file {
        Some(path) => path.clone(),
        None => compute_log_path(&config.save_dir.join("logs"))?,
    };
    let telemetry = RunTelemetry::builder("fcst")
        .log_path(&log_path)
        .echo(!args.quiet)
        .build()?;

    let training = TimeSeries::from_csv_path(&args.train)
        .with_context(|| format!("loading training table {:?}", args.train))?;
    let ground_truth = args
        .ground_truth
        .as_ref()
        .map(|path| {
            TimeSeries::from_csv_path(path)
                .with_context(|| format!("loading ground truth table {path:?}"))
        })
        .transpose()?;

    telemetry.info(
        "run_start",
        json!({
            "mode": config.mode,
            "train": args.train,
            "rows": training.len(),
            "features": training.columns(),
            "log_path": log_path,
        }),
    );
    let mut model = LinearSequenceModel::new(config.model_config());
    let pipeline = ForecastPipeline::new(config)?.with_telemetry(telemetry.clone());
    let report = pipeline
        .run(&mut model, &training, ground_truth.as_ref())
        .context("forecast run failed")?;

    let summary = summarize(&report);
    telemetry.log(LogLevel::Info, "run_complete", summary.clone());
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn resolve_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_json_file(path)
            .with_context(|| format!("reading config {path:?}"))?,
        None => RunConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    override_with(&mut config.sample_size, args.sample_size);
    if args.output_size.is_some() {
        config.output_size = args.output_size;
    }
    override_with(&mut config.epochs, args.epochs);
    override_with(&mut config.batch_size, args.batch_size);
    override_with(&mut config.save_every, args.save_interval);
    override_with(&mut config.learning_rate, args.learning_rate);
    override_with(&mut config.seed, args.seed);
    override_with(&mut config.save_dir, args.save_dir.clone());
    override_with(&mut config.target_feature, args.target_feature);
    if args.horizon.is_some() {
        config.horizon = args.horizon;
    }
    if let Some(correction) = args.correction {
        config.correction = Some(match correction {
            CorrectionArg::None => ContinuityCorrection::None,
            CorrectionArg::Feature => ContinuityCorrection::Feature(config.target_feature),
            CorrectionArg::All => ContinuityCorrection::AllFeatures,
        });
    }
    config.shuffle |= args.shuffle;
    config.resume |= args.resume;
    config.validate()?;
    Ok(config)
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn compute_log_path(base: &Path) -> Result<PathBuf> {
    let now = Local::now();
    let dir = base
        .join(format!("{:04}", now.year()))
        .join(format!("{:02}", now.month()))
        .join(format!("{:02}", now.day()));
    fs::create_dir_all(&dir)?;
    Ok(dir.join(format!("run-{}.log.jsonl", now.format("%Y%m%d-%H%M%S"))))
}

fn summarize(report: &RunReport) -> serde_json::Value {
    let training = report.training.as_ref().map(|t| {
        json!({
            "windows": t.windows,
            "resumed_from": t.resumed_from.as_ref().map(|c| c.epoch),
            "checkpoints": t.checkpoints.iter().map(|c| c.path.display().to_string()).collect::<Vec<_>>(),
            "final_loss": t.loss_rows.last().map(|r| r.mean_loss),
        })
    });
    let prediction = report.prediction.as_ref().map(|p| {
        json!({
            "checkpoint": p.checkpoint.path.display().to_string(),
            "steps": p.forecast.len(),
            "output": p.output_path.display().to_string(),
            "evaluation": p.evaluation,
        })
    });
    json!({ "training": training, "prediction": prediction })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn flags_override_json_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("run.json");
        fs::write(&config_path, r#"{ "sample_size": 10, "epochs": 3, "target_feature": 1 }"#)
            .unwrap();
        let args = RunArgs {
            config: Some(config_path),
            epochs: Some(7),
            mode: Some(ModeArg::Train),
            correction: Some(CorrectionArg::Feature),
            ..RunArgs::default()
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.sample_size, 10);
        assert_eq!(config.epochs, 7);
        assert_eq!(config.mode, RunMode::Train);
        assert_eq!(config.correction(), ContinuityCorrection::Feature(1));
    }

    #[test]
    fn missing_sample_size_is_rejected() {
        assert!(resolve_config(&RunArgs::default()).is_err());
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "fcst",
            "run",
            "--train",
            "prices.csv",
            "--sample-size",
            "20",
            "--mode",
            "predict",
            "--correction",
            "all",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.sample_size, Some(20));
        assert!(matches!(args.mode, Some(ModeArg::Predict)));
    }
}
