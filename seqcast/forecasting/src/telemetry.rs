use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::{json, Value};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use uuid::Uuid;

/// Builder configuring telemetry for a training/forecast run.
pub struct RunTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    echo: bool,
    min_level: LogLevel,
}

impl RunTelemetryBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            echo: false,
            min_level: LogLevel::Info,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Mirrors records to stderr.
    #[must_use]
    pub const fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Drops records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<RunTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::new(path)?),
            None => None,
        };
        Ok(RunTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                run_id: Uuid::new_v4(),
                logger,
                echo: self.echo,
                min_level: self.min_level,
            }),
        })
    }
}

/// Cloneable telemetry handle. Logging is best-effort: failures are
/// reported on stderr and never abort a run.
#[derive(Clone)]
pub struct RunTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for RunTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunTelemetry")
            .field("module", &self.inner.module)
            .field("run_id", &self.inner.run_id)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    run_id: Uuid,
    logger: Option<JsonLogger>,
    echo: bool,
    min_level: LogLevel,
}

impl RunTelemetry {
    /// Returns a builder for this telemetry helper.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> RunTelemetryBuilder {
        RunTelemetryBuilder::new(module)
    }

    /// Telemetry that drops everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: String::new(),
                run_id: Uuid::nil(),
                logger: None,
                echo: false,
                min_level: LogLevel::Error,
            }),
        }
    }

    /// Identifier stamped on every record of this run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if level < self.inner.min_level {
            return;
        }
        let record = LogRecord::new(&self.inner.module, level, message)
            .with_metadata(json!({ "run_id": self.inner.run_id }))
            .with_metadata(metadata);
        if self.inner.echo {
            eprintln!("{}", record.render());
        }
        if let Some(logger) = &self.inner.logger {
            if let Err(err) = logger.log(&record) {
                eprintln!("telemetry log write failed: {err:?}");
            }
        }
    }

    /// Info-level shorthand.
    pub fn info(&self, message: &str, metadata: Value) {
        self.log(LogLevel::Info, message, metadata);
    }

    /// Warn-level shorthand.
    pub fn warn(&self, message: &str, metadata: Value) {
        self.log(LogLevel::Warn, message, metadata);
    }
}

impl Default for RunTelemetry {
    fn default() -> Self {
        Self::disabled()
    }
}
