//! Logging for the `eddy` binary.
//!
//! The console shows the level chosen on the command line. When a logs
//! directory is given, the whole run is also traced to a file there so a
//! failed pipeline can be examined afterwards.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the trace file inside the logs directory.
pub const LOG_FILE_NAME: &str = "eddy.log";

/// Installs the global subscriber. `RUST_LOG` overrides `console` for the
/// console output. Returns the trace file path when one was opened.
///
/// # Errors
///
/// - `std::io::Error` - The logs directory or trace file cannot be created
pub fn init_tracing(
    console: CliLogLevel,
    logs_dir: Option<&Path>,
) -> std::io::Result<Option<PathBuf>> {
    let console_layer = fmt::layer().with_target(false).with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from(console).into())
            .from_env_lossy(),
    );

    let (file_layer, log_file) = match logs_dir {
        Some(dir) => {
            let path = log_file_path(dir)?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_writer(File::create(&path)?)
                .with_filter(LevelFilter::TRACE);
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = &log_file {
        tracing::debug!(file = %path.display(), "Tracing run to file");
    }
    Ok(log_file)
}

fn log_file_path(dir: &Path) -> std::io::Result<PathBuf> {
    create_dir_all(dir)?;
    Ok(dir.join(LOG_FILE_NAME))
}

/// Console verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    /// Includes subprocess progress lines
    Trace,
}

impl From<CliLogLevel> for LevelFilter {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => LevelFilter::ERROR,
            CliLogLevel::Warn => LevelFilter::WARN,
            CliLogLevel::Info => LevelFilter::INFO,
            CliLogLevel::Debug => LevelFilter::DEBUG,
            CliLogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&LevelFilter::from(*self), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_level_mapping() {
        assert_eq!(LevelFilter::from(CliLogLevel::Error), LevelFilter::ERROR);
        assert_eq!(LevelFilter::from(CliLogLevel::Trace), LevelFilter::TRACE);
        assert_eq!(CliLogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_log_file_path_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("nested/logs");
        let path = log_file_path(&logs).unwrap();
        assert!(logs.is_dir());
        assert_eq!(path, logs.join(LOG_FILE_NAME));
    }
}
