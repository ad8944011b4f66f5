//! # Logging Initialization
//!
//! One entry point, [`init_logging`], installs the global `tracing` subscriber.
//! It runs at most once per process, guarded by a `std::sync::Once`.
//!
//! ## Configuration
//!
//! 1.  **Filter**: `RUST_LOG` wins when set. Otherwise the filter is
//!     `<level>,burrow=debug`.
//!
//! 2.  **File (default)**: a daily rolling `burrow.log` in the per-user cache
//!     directory from `directories`, written through a non-blocking
//!     `tracing_appender` writer, no ANSI colors.
//!
//! 3.  **Stderr**: with `log_to_file = false`, or when the cache directory is
//!     missing or not writable, logs go to stderr with colors.
//!
//! ## Usage
//!
//! `init_logging("info", true)` for normal runs, `init_logging("debug", false)`
//! while debugging in a terminal.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

pub const LOG_FILE_NAME: &str = "burrow.log";

/// `trace`-level stderr logging for tests.
pub fn init_test_logging() {
    let _ = init_logging("trace", false);
}

/// Directory the rolling log file lives in, if the platform has one.
pub fn log_directory() -> Option<std::path::PathBuf> {
    ProjectDirs::from("com", "Burrow", "burrow").map(|dirs| dirs.cache_dir().to_path_buf())
}

/// Install the global subscriber. Later calls are no-ops.
///
/// # Errors
///
/// Currently always succeeds; file logging problems fall back to stderr.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},burrow=debug")));

        if log_to_file && let Some(log_dir) = log_directory() {
            // tracing_appender::rolling::daily panics on permission errors
            let file_appender_result = if can_write_to(&log_dir) {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME)
                }))
            } else {
                Err(Box::new("Cannot write to log directory") as Box<dyn std::any::Any + Send>)
            };

            if let Ok(file_appender) = file_appender_result {
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .init();
                // Leaked so buffered lines are flushed at exit
                Box::leak(Box::new(guard));
                return;
            }
        }

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .init();
    });

    Ok(())
}

/// Create `dir` if needed and check a file can be written in it.
fn can_write_to(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".burrow_log_test");
    match std::fs::write(&probe, "test") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
