use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

/// CLI definition for treeswap
#[derive(Parser, Debug)]
#[command(
    name = "treeswap",
    version = env!("CARGO_PKG_VERSION"),
    about = "Transactional in-place updater for portable application folders"
)]
pub struct Cli {
    /// Path to the existing installation
    #[arg(long = "install-path")]
    pub install_path: PathBuf,

    /// Path to the ZIP archive with the new version
    #[arg(long = "package-path")]
    pub package_path: Option<PathBuf>,

    /// Download the package archive from this URL instead
    #[arg(long)]
    pub url: Option<String>,

    /// Expected SHA-1 of the downloaded archive
    #[arg(long)]
    pub hash: Option<String>,

    /// Overwrite files even when their content is unchanged
    #[arg(long = "force-update")]
    pub force_update: bool,

    /// Keep files not found in the update package
    #[arg(long = "keep-missing")]
    pub keep_missing: bool,

    /// Regex patterns for paths that must never be removed
    /// (can be given multiple times or comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Fail after the install phase to exercise rollback
    #[arg(long)]
    pub fail: bool,

    /// Relative path to an executable to launch after a successful install
    #[arg(long = "launch-exe")]
    pub launch_exe: Option<String>,

    /// Arguments for --launch-exe
    #[arg(long = "launch-args")]
    pub launch_args: Option<String>,

    /// Show a progress bar instead of logging percentages
    #[arg(long)]
    pub gui: bool,

    /// Log file path (defaults to treeswap.log)
    #[arg(short = 'l', long = "log")]
    pub log_path: Option<PathBuf>,

    /// Tee log output to the terminal as well
    #[arg(long)]
    pub stdout: bool,

    /// Print the computed plan as JSON and exit without installing
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Number of worker threads to use
    #[arg(long)]
    pub threads: Option<usize>,
}

impl Cli {
    /// Check the path arguments before any work starts.
    pub fn validate(&self) -> Result<()> {
        let install_meta = fs::metadata(&self.install_path)
            .with_context(|| format!("install-path {}", self.install_path.display()))?;
        if !install_meta.is_dir() {
            bail!("install-path does not point to a directory");
        }

        if self.url.is_none() {
            let package = self
                .package_path
                .as_ref()
                .context("either --package-path or --url is required")?;
            let package_meta = fs::metadata(package)
                .with_context(|| format!("package-path {}", package.display()))?;
            if package_meta.is_dir() {
                bail!("package-path should point to a file");
            }
        }

        Ok(())
    }
}
