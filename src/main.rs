use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use regex::Regex;

use treeswap::cli::Cli;
use treeswap::config;
use treeswap::diff::{self, DiffOptions};
use treeswap::download;
use treeswap::fsutil;
use treeswap::hasher;
use treeswap::installer::{self, PackageInstaller};
use treeswap::logging;
use treeswap::package;
use treeswap::progress::{
    BarProgressHandler, LogProgressHandler, ProgressHandler, ProgressReporter,
};

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        error!("{:#}", err);
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(mut cli: Cli) -> Result<()> {
    config::apply(&mut cli, config::from_env());

    let log_path = cli
        .log_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_LOG_FILE));
    logging::init(&log_path, cli.stdout).context("setting up logging")?;
    info!("------------------------------");
    info!("treeswap log started");

    cli.validate()?;

    let threads = cli.threads.unwrap_or_else(default_threads);

    // Resolve the archive: a local file, or a downloaded copy staged in a
    // temp path that is deleted when this function returns.
    let mut downloaded = None;
    let archive_path = match &cli.url {
        Some(url) => {
            let staged = download::download_package(url, download::DEFAULT_RETRY_COUNT)?;
            if let Some(expected) = &cli.hash {
                let actual = hasher::hash_file(&staged)?;
                if !actual.eq_ignore_ascii_case(expected) {
                    bail!(
                        "package hash mismatch: {} expected but {} found",
                        expected,
                        actual
                    );
                }
                info!("Download verified");
            }
            let path = staged.to_path_buf();
            downloaded = Some(staged);
            path
        }
        None => cli
            .package_path
            .clone()
            .context("either --package-path or --url is required")?,
    };

    let extract_dir = tempfile::Builder::new()
        .prefix("treeswap")
        .tempdir()
        .context("creating extraction dir")?;
    package::extract_archive(&archive_path, extract_dir.path())?;
    drop(downloaded);

    let package_root = package::find_package_root(extract_dir.path());
    info!("Using {} for package path", package_root.display());

    let install_dir = cli
        .install_path
        .canonicalize()
        .with_context(|| format!("resolving install path {}", cli.install_path.display()))?;
    info!("Using {} for install path", install_dir.display());

    let options = DiffOptions {
        keep_missing: cli.keep_missing,
        force_update: cli.force_update,
        exclude: compile_excludes(&cli.exclude)?,
    };
    let plan = diff::compute_plan(&install_dir, &package_root, &options, threads)?;

    if cli.dry_run {
        let rendered = serde_json::to_string_pretty(&plan).context("serializing plan")?;
        println!("{}", rendered);
        return Ok(());
    }

    let handler: Box<dyn ProgressHandler> = if cli.gui {
        Box::new(BarProgressHandler::new())
    } else {
        Box::new(LogProgressHandler)
    };
    let reporter = ProgressReporter::new(handler);

    let mut installer = PackageInstaller::new(
        install_dir.clone(),
        package_root,
        reporter.sender(),
        threads,
    )
    .fail_in_the_end(cli.fail);

    let result = installer.install(&plan);
    let deferred = installer.deferred_self_backup().map(Path::to_path_buf);
    drop(installer);
    reporter.finish();

    if let Some(backup) = &deferred {
        installer::spawn_backup_cleanup(backup);
    }

    match result {
        Ok(()) => {
            info!("Install succeeded");
            if let Some(exe) = &cli.launch_exe {
                launch_post_install(&install_dir, exe, cli.launch_args.as_deref());
            }
            Ok(())
        }
        Err(err) => Err(err).context("install failed"),
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

fn compile_excludes(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).with_context(|| format!("invalid exclude pattern: {}", pattern))
        })
        .collect()
}

/// Start the configured program detached; a launch failure never fails the
/// install that already landed.
fn launch_post_install(install_dir: &Path, exe: &str, args: Option<&str>) {
    let fullpath = fsutil::join_slash_path(install_dir, exe);
    info!("Trying to launch {}", fullpath.display());

    let mut cmd = Command::new(&fullpath);
    if let Some(args) = args {
        if !args.is_empty() {
            cmd.args(args.split_whitespace());
        }
    }

    if let Err(err) = cmd.spawn() {
        warn!("Failed to launch {}: {}", fullpath.display(), err);
    }
}
