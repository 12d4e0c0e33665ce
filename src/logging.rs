//! Logging setup.
//!
//! Every handler thread logs through the global `tracing` subscriber. The
//! fmt layer serializes writes to its sink (stderr, or a file behind a
//! `Mutex`), so concurrent handlers never interleave partial lines.

use crate::config::Config;
use std::fs::{self, File, OpenOptions};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Parse a configured log level.
///
/// Accepts the `tracing` names plus `warning` and `fatal` from older
/// config files.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" | "fatal" => Some(Level::ERROR),
        _ => None,
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: &Config) {
    let level = parse_level(&config.log_level).unwrap_or(Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true);

    match open_log_file(config) {
        Some(file) => builder.with_writer(Mutex::new(file)).with_ansi(false).init(),
        None => builder.with_writer(std::io::stderr).init(),
    }
}

/// Open the configured log file for appending, if file output is enabled.
///
/// Runs before the subscriber exists, so failures go straight to stderr.
fn open_log_file(config: &Config) -> Option<File> {
    if config.log_to_stderr {
        return None;
    }
    let path = config.log_file.as_ref()?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!(
                "[!] Failed to create log directory '{}': {e}. Using stderr.",
                parent.display()
            );
            return None;
        }
    }

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!(
                "[!] Failed to open log file '{}': {e}. Using stderr.",
                path.display()
            );
            None
        }
    }
}
