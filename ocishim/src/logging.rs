//! Tracing subscriber setup for binaries embedding the driver.

use std::io;

use ocishim_shared::errors::{ShimError, ShimResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::runtime::options::LoggingOptions;

const LOG_FILE_PREFIX: &str = "ocishim.log";

/// Guard that must be held to keep the async file writer running.
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Logs go to stderr and, with a
/// log directory configured, to a daily-rolling file as well. Calling it when
/// a subscriber is already installed leaves that subscriber in place.
pub fn init_logging(options: &LoggingOptions) -> ShimResult<LogGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&options.level));

    let stderr_layer = fmt::layer().with_writer(io::stderr).with_target(true);

    let (result, guard) = match &options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                ShimError::Config(format!(
                    "failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);

            let result = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            (result, Some(guard))
        }
        None => {
            let result = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init();
            (result, None)
        }
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Global subscriber already installed");
    }

    Ok(LogGuard { _guard: guard })
}
