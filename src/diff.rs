use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Sender};
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::fsutil;
use crate::hasher;

/// One planned file mutation. `digest` carries the install-side content hash
/// for removes and updates and the package-side hash for adds; `size` is the
/// byte count used for progress weighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(rename = "sha1")]
    pub digest: String,
    pub size: u64,
}

/// The mutations needed to bring an installation in line with a package.
/// The three sets are disjoint by construction and sorted by path.
#[derive(Debug, Default, Serialize)]
pub struct UpdatePlan {
    pub adds: Vec<FileEntry>,
    pub removes: Vec<FileEntry>,
    pub updates: Vec<FileEntry>,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty() && self.updates.is_empty()
    }
}

/// Policy knobs for plan generation.
#[derive(Debug, Default)]
pub struct DiffOptions {
    /// Keep files that exist in the installation but not in the package.
    pub keep_missing: bool,
    /// Schedule updates even when digests match.
    pub force_update: bool,
    /// Paths matching any of these are never scheduled for removal.
    /// Exclusion does not apply to additions or updates, otherwise a new
    /// version of an excluded file could never arrive.
    pub exclude: Vec<Regex>,
}

impl DiffOptions {
    fn excludes(&self, rel: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(rel))
    }
}

/// Compare `install_dir` against `package_dir` and produce the update plan.
///
/// Both trees are digest-walked in parallel first; the removal/update pass
/// and the addition pass then run concurrently, funneling entries through
/// channels into per-set accumulators. Walk failures abort the whole
/// computation: an error never comes with a partial plan.
pub fn compute_plan(
    install_dir: &Path,
    package_dir: &Path,
    options: &DiffOptions,
    threads: usize,
) -> Result<UpdatePlan> {
    info!(
        "Looking for changes. install_dir={} package_dir={}",
        install_dir.display(),
        package_dir.display()
    );

    let (install_hashes, package_hashes) = thread::scope(|s| {
        let install = s.spawn(|| hasher::hash_tree(install_dir, threads));
        let package = hasher::hash_tree(package_dir, threads);
        (
            install.join().expect("install hash thread panicked"),
            package,
        )
    });
    let install_hashes = install_hashes.context("hashing install dir")?;
    let package_hashes = package_hashes.context("hashing package dir")?;
    info!(
        "Hashes calculated. install_files={} package_files={}",
        install_hashes.len(),
        package_hashes.len()
    );

    let (add_tx, add_rx) = unbounded();
    let (remove_tx, remove_rx) = unbounded();
    let (update_tx, update_rx) = unbounded();

    let install_hashes = &install_hashes;
    let package_hashes = &package_hashes;

    let (removal_result, addition_result, adds, removes, updates) = thread::scope(|s| {
        let removal = s.spawn(move || {
            scan_install_tree(
                install_dir,
                package_dir,
                options,
                install_hashes,
                package_hashes,
                remove_tx,
                update_tx,
            )
        });
        let addition =
            s.spawn(move || scan_package_tree(install_dir, package_dir, package_hashes, add_tx));

        let adds_acc = s.spawn(move || add_rx.iter().collect::<Vec<FileEntry>>());
        let removes_acc = s.spawn(move || remove_rx.iter().collect::<Vec<FileEntry>>());
        let updates_acc = s.spawn(move || update_rx.iter().collect::<Vec<FileEntry>>());

        (
            removal.join().expect("removal pass panicked"),
            addition.join().expect("addition pass panicked"),
            adds_acc.join().expect("adds accumulator panicked"),
            removes_acc.join().expect("removes accumulator panicked"),
            updates_acc.join().expect("updates accumulator panicked"),
        )
    });

    removal_result?;
    addition_result?;

    let mut plan = UpdatePlan {
        adds,
        removes,
        updates,
    };
    plan.adds.sort_by(|a, b| a.path.cmp(&b.path));
    plan.removes.sort_by(|a, b| a.path.cmp(&b.path));
    plan.updates.sort_by(|a, b| a.path.cmp(&b.path));

    info!(
        "Differences generated. adds={} removes={} updates={}",
        plan.adds.len(),
        plan.removes.len(),
        plan.updates.len()
    );

    Ok(plan)
}

/// Walk the installation and decide removal or update for every file in it.
fn scan_install_tree(
    install_dir: &Path,
    package_dir: &Path,
    options: &DiffOptions,
    install_hashes: &HashMap<String, String>,
    package_hashes: &HashMap<String, String>,
    remove_tx: Sender<FileEntry>,
    update_tx: Sender<FileEntry>,
) -> Result<()> {
    for entry in WalkDir::new(install_dir) {
        let entry = entry.with_context(|| format!("walking {}", install_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = fsutil::relative_slash_path(install_dir, entry.path()) else {
            continue;
        };

        let install_digest = install_hashes.get(&rel).map(String::as_str).unwrap_or("");
        let package_path = fsutil::join_slash_path(package_dir, &rel);

        match fs::metadata(&package_path) {
            Ok(meta) => {
                let package_digest = package_hashes.get(&rel).map(String::as_str).unwrap_or("");
                if package_digest != install_digest || options.force_update {
                    let _ = update_tx.send(FileEntry {
                        path: rel,
                        digest: install_digest.to_string(),
                        size: meta.len(),
                    });
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if options.excludes(&rel) {
                    info!("Excluded by filters. path={}", rel);
                    continue;
                }
                if options.keep_missing {
                    info!("Keeping missing file. path={}", rel);
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or_default();
                let _ = remove_tx.send(FileEntry {
                    path: rel,
                    digest: install_digest.to_string(),
                    size,
                });
            }
            Err(err) => warn!("Skipping {}: {}", package_path.display(), err),
        }
    }

    Ok(())
}

/// Walk the package and schedule an addition for every file the
/// installation does not have yet.
fn scan_package_tree(
    install_dir: &Path,
    package_dir: &Path,
    package_hashes: &HashMap<String, String>,
    add_tx: Sender<FileEntry>,
) -> Result<()> {
    for entry in WalkDir::new(package_dir) {
        let entry = entry.with_context(|| format!("walking {}", package_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = fsutil::relative_slash_path(package_dir, entry.path()) else {
            continue;
        };

        let install_path = fsutil::join_slash_path(install_dir, &rel);
        match fs::metadata(&install_path) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let digest = package_hashes.get(&rel).cloned().unwrap_or_default();
                let size = entry.metadata().map(|m| m.len()).unwrap_or_default();
                let _ = add_tx.send(FileEntry {
                    path: rel,
                    digest,
                    size,
                });
            }
            Err(err) => warn!("Skipping {}: {}", install_path.display(), err),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs::{create_dir_all, write};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn setup_trees() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempdir().unwrap();
        let install = dir.path().join("install");
        let package = dir.path().join("package");
        create_dir_all(&install).unwrap();
        create_dir_all(&package).unwrap();
        (dir, install, package)
    }

    #[test]
    fn identical_trees_produce_empty_plan() {
        let (_guard, install, package) = setup_trees();
        write(install.join("same.txt"), b"content").unwrap();
        write(package.join("same.txt"), b"content").unwrap();

        let plan = compute_plan(&install, &package, &DiffOptions::default(), 2).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn changed_content_is_an_update_with_package_size() {
        let (_guard, install, package) = setup_trees();
        write(install.join("app.bin"), b"v1").unwrap();
        write(package.join("app.bin"), b"version2").unwrap();

        let plan = compute_plan(&install, &package, &DiffOptions::default(), 2).unwrap();
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].path, "app.bin");
        assert_eq!(plan.updates[0].size, 8);
        assert!(plan.adds.is_empty());
        assert!(plan.removes.is_empty());
    }

    #[test]
    fn install_only_file_is_a_remove() {
        let (_guard, install, package) = setup_trees();
        write(install.join("old.dll"), b"obsolete").unwrap();

        let plan = compute_plan(&install, &package, &DiffOptions::default(), 2).unwrap();
        assert_eq!(plan.removes.len(), 1);
        assert_eq!(plan.removes[0].path, "old.dll");
        assert_eq!(plan.removes[0].size, 8);
    }

    #[test]
    fn package_only_file_is_an_add_with_digest() {
        let (_guard, install, package) = setup_trees();
        create_dir_all(package.join("a")).unwrap();
        write(package.join("a").join("b.txt"), b"hello").unwrap();

        let plan = compute_plan(&install, &package, &DiffOptions::default(), 2).unwrap();
        assert_eq!(plan.adds.len(), 1);
        assert_eq!(plan.adds[0].path, "a/b.txt");
        assert_eq!(plan.adds[0].size, 5);
        assert_eq!(
            plan.adds[0].digest,
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }

    #[test]
    fn exclude_applies_only_to_removal() {
        let (_guard, install, package) = setup_trees();
        write(install.join("keep.cfg"), b"user settings").unwrap();
        write(install.join("old.dll"), b"obsolete").unwrap();
        write(install.join("tune.cfg"), b"v1").unwrap();
        write(package.join("tune.cfg"), b"v2").unwrap();

        let options = DiffOptions {
            exclude: vec![Regex::new(r".*\.cfg$").unwrap()],
            ..Default::default()
        };
        let plan = compute_plan(&install, &package, &options, 2).unwrap();

        let removed: Vec<_> = plan.removes.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(removed, vec!["old.dll"]);
        // an excluded path still receives updates
        let updated: Vec<_> = plan.updates.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(updated, vec!["tune.cfg"]);
    }

    #[test]
    fn keep_missing_suppresses_removal() {
        let (_guard, install, package) = setup_trees();
        write(install.join("user_data.json"), b"{}").unwrap();

        let options = DiffOptions {
            keep_missing: true,
            ..Default::default()
        };
        let plan = compute_plan(&install, &package, &options, 2).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn force_update_schedules_identical_files() {
        let (_guard, install, package) = setup_trees();
        write(install.join("data.bin"), b"same bytes").unwrap();
        write(package.join("data.bin"), b"same bytes").unwrap();

        let options = DiffOptions {
            force_update: true,
            ..Default::default()
        };
        let plan = compute_plan(&install, &package, &options, 2).unwrap();
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].path, "data.bin");
        assert!(plan.adds.is_empty());
        assert!(plan.removes.is_empty());
    }

    #[test]
    fn plan_sets_are_disjoint() {
        let (_guard, install, package) = setup_trees();
        write(install.join("stays.txt"), b"same").unwrap();
        write(package.join("stays.txt"), b"same").unwrap();
        write(install.join("changes.txt"), b"old").unwrap();
        write(package.join("changes.txt"), b"new").unwrap();
        write(install.join("goes.txt"), b"bye").unwrap();
        write(package.join("arrives.txt"), b"hi").unwrap();

        let plan = compute_plan(&install, &package, &DiffOptions::default(), 2).unwrap();

        let mut seen = HashSet::new();
        for entry in plan
            .adds
            .iter()
            .chain(plan.removes.iter())
            .chain(plan.updates.iter())
        {
            assert!(seen.insert(entry.path.clone()), "duplicate {}", entry.path);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn missing_install_dir_surfaces_error() {
        let (_guard, _install, package) = setup_trees();
        let absent = package.parent().unwrap().join("absent");
        assert!(compute_plan(&absent, &package, &DiffOptions::default(), 2).is_err());
    }

    #[test]
    fn plan_serializes_with_wire_names() {
        let entry = FileEntry {
            path: "a/b.txt".into(),
            digest: "aabb".into(),
            size: 5,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"sha1\":\"aabb\""));
        assert!(json.contains("\"path\":\"a/b.txt\""));
        assert!(json.contains("\"size\":5"));
    }
}
