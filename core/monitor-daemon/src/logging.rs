//! Tracing setup for the monitor binary.
//!
//! Stderr always; a daily-rotated file as well when `[logging] directory` is
//! configured. `SESSION_MONITOR_DEBUG_LOG=1` forces debug level, otherwise
//! `RUST_LOG` applies, otherwise `info`.

use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV: &str = "SESSION_MONITOR_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "session-monitor";

/// Installs the global subscriber. Keep the returned guard alive for the life
/// of the process or buffered file output is lost.
pub fn init(directory: Option<&Path>) -> Option<WorkerGuard> {
    let filter = if debug_enabled(env::var(DEBUG_ENV).ok().as_deref()) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let mut file_error = None;
    let (file_layer, guard) = match directory.map(file_appender) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err(err)) => {
            file_error = Some(err);
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let (Some(err), Some(directory)) = (file_error, directory) {
        tracing::warn!(
            error = %err,
            path = %directory.display(),
            "Failed to open log directory; logging to stderr only"
        );
    }
    guard
}

fn file_appender(directory: &Path) -> Result<RollingFileAppender, String> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(directory)
        .map_err(|err| err.to_string())
}

fn debug_enabled(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_accepts_common_truthy_values() {
        assert!(debug_enabled(Some("1")));
        assert!(debug_enabled(Some("yes")));
        assert!(!debug_enabled(Some("0")));
        assert!(!debug_enabled(None));
    }

    #[test]
    fn file_appender_creates_log_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = dir.path().join("logs");
        file_appender(&logs).expect("appender");
        assert!(logs.is_dir());
    }
}
