use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use log::{error, info, warn};
use rayon::prelude::*;
use thiserror::Error;

use crate::diff::{FileEntry, UpdatePlan};
use crate::fsutil;
use crate::progress::{
    ProgressSender, ADD_FACTOR, BACKUP_REMOVE_COST, REMOVE_FACTOR, UPDATE_FACTOR,
};

/// A fatal error observed while mutating the install tree. Any of these
/// triggers a full rollback.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to back up {path}: {source}")]
    Backup {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to replace {path}: {source}")]
    Replace {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to add {path}: {source}")]
    Add {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("install failed on request (--fail)")]
    ForcedFailure,
}

/// A displaced original awaiting restore or removal.
#[derive(Debug)]
struct BackupRecord {
    rel_path: String,
    backup_path: PathBuf,
}

#[derive(Clone, Copy)]
enum Operation {
    Remove,
    Update,
    Add,
}

/// Applies an [`UpdatePlan`] to a live installation.
///
/// Originals are displaced to sibling `.bak` files inside the install tree
/// itself, which keeps the restore rename on the same filesystem and
/// therefore atomic. On the first error the whole run is rolled back: newly
/// added files are purged and every backup is renamed into place again.
pub struct PackageInstaller {
    install_dir: PathBuf,
    package_dir: PathBuf,
    current_exe: Option<PathBuf>,
    fail_in_the_end: bool,
    threads: usize,
    progress: ProgressSender,
    backups: HashMap<String, PathBuf>,
    deferred_self_backup: Option<PathBuf>,
}

impl PackageInstaller {
    pub fn new(
        install_dir: PathBuf,
        package_dir: PathBuf,
        progress: ProgressSender,
        threads: usize,
    ) -> Self {
        Self {
            install_dir,
            package_dir,
            current_exe: std::env::current_exe()
                .ok()
                .and_then(|p| p.canonicalize().ok()),
            fail_in_the_end: false,
            threads: threads.max(1),
            progress,
            backups: HashMap::new(),
            deferred_self_backup: None,
        }
    }

    /// Force the rollback path after a clean run-through (debug aid).
    pub fn fail_in_the_end(mut self, fail: bool) -> Self {
        self.fail_in_the_end = fail;
        self
    }

    /// Override the path treated as the running executable.
    pub fn with_current_exe(mut self, path: Option<PathBuf>) -> Self {
        self.current_exe = path;
        self
    }

    /// Backup of the running executable left behind for deferred cleanup,
    /// populated when the plan replaced or removed the installer itself.
    pub fn deferred_self_backup(&self) -> Option<&Path> {
        self.deferred_self_backup.as_deref()
    }

    /// Apply `plan` to the install tree. Either every operation lands, or
    /// the tree is restored to its initial state and the first observed
    /// error is returned.
    pub fn install(&mut self, plan: &UpdatePlan) -> Result<(), InstallError> {
        self.before_install();
        self.progress.set_total(grand_total(plan));

        let (backup_tx, backup_rx) = unbounded::<BackupRecord>();
        let accountant = thread::spawn(move || {
            let mut backups = HashMap::new();
            for record in backup_rx.iter() {
                backups.insert(record.rel_path, record.backup_path);
            }
            info!(
                "Backups accounting finished. {} backups available",
                backups.len()
            );
            backups
        });

        let mut result = self.install_package(plan, &backup_tx);
        drop(backup_tx);
        self.backups = accountant.join().expect("backup accounting thread panicked");

        if result.is_ok() && self.fail_in_the_end {
            result = Err(InstallError::ForcedFailure);
        }

        match &result {
            Ok(()) => self.after_success(),
            Err(err) => {
                error!("Install failed, rolling back: {}", err);
                self.after_failure(plan);
            }
        }

        result
    }

    fn install_package(
        &self,
        plan: &UpdatePlan,
        backup_tx: &Sender<BackupRecord>,
    ) -> Result<(), InstallError> {
        info!("Installing package...");

        self.progress.message("Removing components");
        self.run_phase(&plan.removes, Operation::Remove, backup_tx)?;

        self.progress.message("Updating components");
        self.run_phase(&plan.updates, Operation::Update, backup_tx)?;

        self.progress.message("Adding components");
        self.run_phase(&plan.adds, Operation::Add, backup_tx)?;

        Ok(())
    }

    /// Run one phase over a worker pool. The first error flips the shared
    /// cancellation flag; siblings notice it between files and return early,
    /// while an operation already past its rename completes its step.
    fn run_phase(
        &self,
        entries: &[FileEntry],
        op: Operation,
        backup_tx: &Sender<BackupRecord>,
    ) -> Result<(), InstallError> {
        if entries.is_empty() {
            return Ok(());
        }

        let cancel = AtomicBool::new(false);
        let first_error: Mutex<Option<InstallError>> = Mutex::new(None);
        let (work_tx, work_rx) = unbounded::<&FileEntry>();
        let workers = self.threads.min(entries.len());

        thread::scope(|s| {
            for _ in 0..workers {
                let rx = work_rx.clone();
                let cancel = &cancel;
                let first_error = &first_error;
                s.spawn(move || {
                    for entry in rx.iter() {
                        if cancel.load(Ordering::SeqCst) {
                            return;
                        }
                        if let Err(err) = self.apply_entry(op, entry, backup_tx) {
                            cancel.store(true, Ordering::SeqCst);
                            first_error
                                .lock()
                                .expect("error slot poisoned")
                                .get_or_insert(err);
                            return;
                        }
                    }
                });
            }
            drop(work_rx);

            for entry in entries {
                if work_tx.send(entry).is_err() {
                    break;
                }
            }
            drop(work_tx);
        });

        match first_error.into_inner().expect("error slot poisoned") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn apply_entry(
        &self,
        op: Operation,
        entry: &FileEntry,
        backup_tx: &Sender<BackupRecord>,
    ) -> Result<(), InstallError> {
        match op {
            Operation::Remove => {
                info!("Removing file {}", entry.path);
                match self.backup_file(&entry.path, backup_tx) {
                    Ok(()) => {}
                    // already gone, e.g. a stale backup cleared during pre-install
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        warn!("File scheduled for removal is already gone: {}", entry.path);
                    }
                    Err(source) => {
                        return Err(InstallError::Backup {
                            path: entry.path.clone(),
                            source,
                        });
                    }
                }
                self.progress.tick_remove(entry.size);
            }
            Operation::Update => {
                info!("Updating file {}", entry.path);
                self.backup_file(&entry.path, backup_tx)
                    .map_err(|source| InstallError::Backup {
                        path: entry.path.clone(),
                        source,
                    })?;
                let target = fsutil::join_slash_path(&self.install_dir, &entry.path);
                let incoming = fsutil::join_slash_path(&self.package_dir, &entry.path);
                fs::rename(&incoming, &target).map_err(|source| InstallError::Replace {
                    path: entry.path.clone(),
                    source,
                })?;
                self.progress.tick_update(entry.size);
            }
            Operation::Add => {
                info!("Adding file {}", entry.path);
                let target = fsutil::join_slash_path(&self.install_dir, &entry.path);
                fsutil::ensure_parent_dir(&target).map_err(|source| InstallError::Add {
                    path: entry.path.clone(),
                    source,
                })?;
                let incoming = fsutil::join_slash_path(&self.package_dir, &entry.path);
                fs::rename(&incoming, &target).map_err(|source| InstallError::Add {
                    path: entry.path.clone(),
                    source,
                })?;
                self.progress.tick_add(entry.size);
            }
        }
        Ok(())
    }

    /// Displace the installed file to its sibling `.bak` and record it.
    fn backup_file(&self, rel: &str, backup_tx: &Sender<BackupRecord>) -> io::Result<()> {
        let original = fsutil::join_slash_path(&self.install_dir, rel);
        let backup = fsutil::backup_path(&original);

        // remove a stale backup if any; rename refuses to overwrite on Windows
        match fs::remove_file(&backup) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        fs::rename(&original, &backup)?;
        let _ = backup_tx.send(BackupRecord {
            rel_path: rel.to_string(),
            backup_path: backup,
        });
        Ok(())
    }

    /// Clear a stale backup of the running executable left by a prior run.
    fn before_install(&self) {
        let Some(exe) = &self.current_exe else {
            return;
        };
        let stale = fsutil::backup_path(exe);
        match fs::remove_file(&stale) {
            Ok(()) => info!("Old installer backup removed: {}", stale.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "Error while removing old backup {}: {}",
                stale.display(),
                err
            ),
        }
    }

    fn after_success(&mut self) {
        info!("After success");
        self.progress.message("Finishing the installation");
        self.set_aside_self_backup();
        self.reap_backups();
        fsutil::remove_empty_dirs(&self.install_dir);
    }

    fn after_failure(&mut self, plan: &UpdatePlan) {
        info!("After failure");
        self.progress.message("Cleaning up");
        self.purge_added(&plan.adds);
        self.restore_backups();
        self.set_aside_self_backup();
        self.reap_backups();
        fsutil::remove_empty_dirs(&self.install_dir);
    }

    fn current_exe_rel(&self) -> Option<String> {
        let exe = self.current_exe.as_deref()?;
        fsutil::relative_slash_path(&self.install_dir, exe)
    }

    /// Move the running executable's backup out of the reap set. Deleting it
    /// in-process would fail on platforms that lock executing binaries, so a
    /// detached command takes care of it after exit.
    fn set_aside_self_backup(&mut self) {
        let Some(rel) = self.current_exe_rel() else {
            return;
        };
        let Some(backup) = self.backups.get(&rel) else {
            return;
        };
        if !backup.exists() {
            return;
        }
        info!("Deferring removal of installer backup {}", backup.display());
        self.deferred_self_backup = self.backups.remove(&rel);
    }

    fn reap_backups(&mut self) {
        info!("Removing {} backups", self.backups.len());
        let backups = std::mem::take(&mut self.backups);
        let progress = &self.progress;

        backups.into_par_iter().for_each(|(_, backup)| {
            match fs::remove_file(&backup) {
                Ok(()) => {}
                // restores already consumed their backup files
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("Error while removing {}: {}", backup.display(), err),
            }
            progress.tick_backup_remove();
        });
    }

    fn restore_backups(&self) {
        info!("Restoring {} backups", self.backups.len());

        self.backups.par_iter().for_each(|(rel, backup)| {
            let original = fsutil::join_slash_path(&self.install_dir, rel);
            info!("Restoring {} to {}", backup.display(), original.display());

            if fs::rename(backup, &original).is_err() {
                // the replacement may still occupy the original path
                let _ = fs::remove_file(&original);
                if let Err(err) = fs::rename(backup, &original) {
                    warn!("Error while restoring {}: {}", backup.display(), err);
                }
            }
        });
    }

    fn purge_added(&self, adds: &[FileEntry]) {
        info!("Purging {} files", adds.len());

        adds.par_iter().for_each(|entry| {
            let path = fsutil::join_slash_path(&self.install_dir, &entry.path);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("Error while purging {}: {}", path.display(), err),
            }
        });
    }
}

/// Weighted cost of the whole plan, published to the reporter before any
/// tick so percentages have a fixed denominator.
fn grand_total(plan: &UpdatePlan) -> u64 {
    let mut sum = 0u64;
    for entry in &plan.removes {
        sum += entry.size * REMOVE_FACTOR / 100 + BACKUP_REMOVE_COST;
    }
    for entry in &plan.updates {
        sum += entry.size * UPDATE_FACTOR / 100 + BACKUP_REMOVE_COST;
    }
    for entry in &plan.adds {
        sum += entry.size * ADD_FACTOR / 100;
    }
    sum
}

/// Spawn a detached command that waits a moment, then deletes the deferred
/// backup of the running executable once the OS no longer holds it open.
pub fn spawn_backup_cleanup(backup: &Path) {
    info!("Scheduling removal of installer backup {}", backup.display());
    if let Err(err) = cleanup_command(backup).spawn() {
        warn!("Failed to schedule backup cleanup: {}", err);
    }
}

#[cfg(unix)]
fn cleanup_command(backup: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(format!("sleep 2; rm -f '{}'", backup.display()));
    cmd
}

#[cfg(windows)]
fn cleanup_command(backup: &Path) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(format!(
        "ping localhost -n 2 -w 5000 > nul & del \"{}\"",
        backup.display()
    ));
    cmd
}
