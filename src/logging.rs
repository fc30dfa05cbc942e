use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};

/// Rotate the log file once it grows past this size.
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
/// Number of rotated log files kept around.
const MAX_LOG_BACKUPS: u32 = 3;
/// Rotated logs older than this are pruned.
const MAX_LOG_AGE: Duration = Duration::from_secs(28 * 24 * 60 * 60);

/// Install the log sinks: the log file always, the terminal too when `tee`
/// is set. Rotation happens here, before the file is reopened for append.
pub fn init(path: &Path, tee: bool) -> Result<()> {
    rotate_if_needed(path, MAX_LOG_SIZE);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;

    let config = ConfigBuilder::new().set_time_format_rfc3339().build();

    let mut sinks: Vec<Box<dyn SharedLogger>> =
        vec![WriteLogger::new(LevelFilter::Info, config.clone(), file)];
    if tee {
        sinks.push(TermLogger::new(
            LevelFilter::Info,
            config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }

    CombinedLogger::init(sinks).context("installing logger")
}

fn rotated_name(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

fn rotate_if_needed(path: &Path, max_size: u64) {
    prune_old_backups(path);

    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    if meta.len() < max_size {
        return;
    }

    // shift path.2 -> path.3, path.1 -> path.2, path -> path.1
    let _ = fs::remove_file(rotated_name(path, MAX_LOG_BACKUPS));
    for n in (1..MAX_LOG_BACKUPS).rev() {
        let _ = fs::rename(rotated_name(path, n), rotated_name(path, n + 1));
    }
    if let Err(err) = fs::rename(path, rotated_name(path, 1)) {
        eprintln!("failed to rotate log {}: {}", path.display(), err);
    }
}

fn prune_old_backups(path: &Path) {
    for n in 1..=MAX_LOG_BACKUPS {
        let rotated = rotated_name(path, n);
        let Ok(meta) = fs::metadata(&rotated) else {
            continue;
        };
        let expired = meta
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age > MAX_LOG_AGE)
            .unwrap_or(false);
        if expired {
            let _ = fs::remove_file(&rotated);
        }
    }
}
