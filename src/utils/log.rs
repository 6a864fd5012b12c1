//! File logging under the per-user cache directory. One log file per
//! process, written through a non-blocking appender.

use chrono::Local;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_DIR: OnceLock<PathBuf> = OnceLock::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static LOGGER_INIT: OnceLock<()> = OnceLock::new();

fn build_log_filename() -> String {
    let ts = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let pid = std::process::id();
    format!("diskprobe_{}_pid{}.log", ts, pid)
}

pub fn ensure_logs_dir() -> io::Result<PathBuf> {
    if let Some(existing) = LOG_DIR.get() {
        return Ok(existing.clone());
    }

    let logs_dir = crate::utils::cache_dir().join("logs");
    fs::create_dir_all(&logs_dir)?;

    let _ = LOG_DIR.set(logs_dir.clone());
    Ok(logs_dir)
}

pub fn get_logs_dir() -> Option<PathBuf> {
    LOG_DIR.get().cloned()
}

/// Initialise tracing with a file appender. Level defaults to `info`,
/// overridable through `DISKPROBE_LOG` (EnvFilter syntax).
pub fn init_logger() -> io::Result<PathBuf> {
    let logs_dir = ensure_logs_dir()?;
    if LOGGER_INIT.get().is_some() {
        return Ok(logs_dir);
    }

    let file_name = build_log_filename();
    let appender = tracing_appender::rolling::never(&logs_dir, &file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_env("DISKPROBE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer),
        )
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("logger init failed: {e}")))?;

    let _ = LOG_GUARD.set(guard);
    let _ = LOGGER_INIT.set(());
    info!("logger initialized");
    info!("log file: {}", logs_dir.join(file_name).display());
    Ok(logs_dir)
}
