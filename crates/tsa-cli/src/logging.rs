use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// `app.log` is rotated once it grows past this size.
pub const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

fn backup_path(log_file: &Path, index: u32) -> PathBuf {
    let mut name = log_file.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Size-based rotation: `app.log` -> `app.log.1` -> ... -> `app.log.{keep}`.
/// The oldest backup falls off; `keep == 0` just truncates. Returns whether
/// a rotation happened.
pub fn rotate_if_needed(log_file: &Path, keep: u32, max_bytes: u64) -> Result<bool> {
    let size = match std::fs::metadata(log_file) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err).with_context(|| format!("reading {}", log_file.display())),
    };
    if size <= max_bytes {
        return Ok(false);
    }

    if keep == 0 {
        File::create(log_file).with_context(|| format!("truncating {}", log_file.display()))?;
        return Ok(true);
    }

    let oldest = backup_path(log_file, keep);
    if oldest.exists() {
        std::fs::remove_file(&oldest).with_context(|| format!("removing {}", oldest.display()))?;
    }
    for index in (1..keep).rev() {
        let from = backup_path(log_file, index);
        if from.exists() {
            let to = backup_path(log_file, index + 1);
            std::fs::rename(&from, &to)
                .with_context(|| format!("rotating {} -> {}", from.display(), to.display()))?;
        }
    }
    let first = backup_path(log_file, 1);
    std::fs::rename(log_file, &first)
        .with_context(|| format!("rotating {} -> {}", log_file.display(), first.display()))?;
    Ok(true)
}

/// File layer filtered by `RUST_LOG` or `default_directive`; warnings and
/// errors are mirrored to stderr.
pub fn init(log_file: &Path, default_directive: &str) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening {}", log_file.display()))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .with_filter(file_filter);
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("installing tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn small_logs_are_left_alone() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "short").unwrap();
        assert!(!rotate_if_needed(&log, 5, 1024).unwrap());
        assert!(!backup_path(&log, 1).exists());
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = tempdir().unwrap();
        assert!(!rotate_if_needed(&dir.path().join("app.log"), 5, 10).unwrap());
    }

    #[test]
    fn rotation_shifts_backups_and_drops_the_oldest() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "current-log-contents").unwrap();
        std::fs::write(backup_path(&log, 1), "one").unwrap();
        std::fs::write(backup_path(&log, 2), "two").unwrap();

        assert!(rotate_if_needed(&log, 2, 4).unwrap());

        assert!(!log.exists());
        assert_eq!(
            std::fs::read_to_string(backup_path(&log, 1)).unwrap(),
            "current-log-contents"
        );
        assert_eq!(std::fs::read_to_string(backup_path(&log, 2)).unwrap(), "one");
        assert!(!backup_path(&log, 3).exists());
    }

    #[test]
    fn zero_backups_truncates_in_place() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "0123456789").unwrap();
        assert!(rotate_if_needed(&log, 0, 4).unwrap());
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "");
    }
}
