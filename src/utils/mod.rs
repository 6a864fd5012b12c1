pub mod log;
pub mod progress;
pub mod task_manager;

use std::path::PathBuf;

/// Per-user cache directory for logs and evidence exports.
pub fn cache_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".cache").join("diskprobe")
}

/// Whether the process runs with elevated access. The engine only queries;
/// it never elevates.
#[cfg(unix)]
pub fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn is_elevated() -> bool {
    false
}

/// Human-readable duration, e.g. "45s", "2m05s", "1h04m".
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    if total < 60 {
        format!("{}s", total)
    } else if total < 3600 {
        format!("{}m{:02}s", total / 60, total % 60)
    } else {
        format!("{}h{:02}m", total / 3600, (total % 3600) / 60)
    }
}

/// Human-readable byte count, e.g. "7.50 GB".
pub fn human_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.2} PB", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formats() {
        assert_eq!(format_duration(4.2), "4s");
        assert_eq!(format_duration(125.0), "2m05s");
        assert_eq!(format_duration(3840.0), "1h04m");
    }

    #[test]
    fn byte_formats() {
        assert_eq!(human_bytes(512), "512.00 B");
        assert_eq!(human_bytes(8 * 1024 * 1024 * 1024), "8.00 GB");
    }
}
