//! Logging initialisation via tracing-subscriber.
//!
//! Call [`init`] once at startup, after the file config is resolved.

use std::path::Path;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::error::AppError;

/// Initialise the global tracing subscriber.
///
/// `level` accepts standard level strings (`"error"` … `"trace"`) or a full
/// `EnvFilter` directive such as `"command_host=debug,info"`.
///
/// If `prefer_level` is `true`, `level` wins and `RUST_LOG` is only consulted
/// when `level` does not parse. Otherwise `RUST_LOG` wins and `level` is the
/// fallback. Output goes to stderr unless `log_file` is given, so the console
/// channel keeps stdout for command replies.
pub fn init(level: &str, prefer_level: bool, log_file: Option<&Path>) -> Result<(), AppError> {
    let filter = if prefer_level {
        match EnvFilter::try_new(level) {
            Ok(filter) => filter,
            Err(level_err) => EnvFilter::try_from_default_env().map_err(|env_err| {
                AppError::Logger(format!(
                    "invalid log level '{level}': {level_err}; RUST_LOG parse failed: {env_err}"
                ))
            })?,
        }
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| AppError::Logger(format!("invalid log level '{level}': {e}")))?
    };

    let writer = if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                AppError::Logger(format!("failed to open log file '{}': {e}", path.display()))
            })?;
        BoxMakeWriter::new(file)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_info_succeeds_or_already_init() {
        // Another test in this process may have installed a subscriber first.
        match init("info", false, None) {
            Ok(()) => {}
            Err(AppError::Logger(msg)) if msg.contains("set subscriber") => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn unopenable_log_file_errors() {
        let err = init("info", true, Some(Path::new("/nonexistent/dir/host.log"))).unwrap_err();
        assert!(err.to_string().contains("failed to open log file"));
    }
}
