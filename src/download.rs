use std::io;

use anyhow::{Context, Result};
use log::{info, warn};
use tempfile::{NamedTempFile, TempPath};

/// Attempts made before a download is abandoned.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Download `url` into a temporary file. The returned path deletes the file
/// when dropped, so the staged archive never outlives the run.
pub fn download_package(url: &str, retries: u32) -> Result<TempPath> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match download_once(url) {
            Ok(path) => return Ok(path),
            Err(err) if attempt < retries => {
                warn!(
                    "Download failed (attempt {}/{}): {:#}. Retrying...",
                    attempt, retries, err
                );
            }
            Err(err) => return Err(err),
        }
    }
}

fn download_once(url: &str) -> Result<TempPath> {
    info!("Downloading {}", url);

    let mut response = reqwest::blocking::get(url)
        .with_context(|| format!("requesting {}", url))?
        .error_for_status()
        .with_context(|| format!("requesting {}", url))?;

    let mut staged = NamedTempFile::new().context("creating download staging file")?;
    let bytes = io::copy(&mut response, staged.as_file_mut()).context("writing download")?;
    info!("Downloaded {} bytes", bytes);

    Ok(staged.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_host_errors_after_retries() {
        // port 1 is never bound; connection is refused immediately
        let result = download_package("http://127.0.0.1:1/pkg.zip", 2);
        assert!(result.is_err());
    }
}
