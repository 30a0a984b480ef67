use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

const DEFAULT_FILTER: &str = "info,millguard=debug,mill_core=debug,mill_io=debug";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("cannot open log directory: {0}")]
    Appender(#[from] InitError),
    #[error("tracing subscriber already installed: {0}")]
    Init(#[from] TryInitError),
}

/// Initialize the tracing subscriber with optional JSON output and an
/// optional daily-rolling JSON log file. The returned guard flushes the file
/// writer on drop.
pub fn init_tracing(
    json_output: bool,
    log_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if json_output {
        layers.push(fmt::layer().json().boxed());
    } else {
        layers.push(fmt::layer().pretty().boxed());
    }

    let guard = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("millguard")
                .filename_suffix("log")
                .build(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;
    Ok(guard)
}
