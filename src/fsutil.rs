use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use walkdir::WalkDir;

/// Convert `path` into a forward-slash string relative to `root`.
/// Returns `None` for `root` itself and for paths outside of it.
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Join a slash-normalized relative path onto `root` using platform separators.
pub fn join_slash_path(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in rel.split('/') {
        out.push(part);
    }
    out
}

/// Sibling path with the `.bak` suffix appended to the file name.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bak");
    PathBuf::from(name)
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Remove empty directories under `root`, deepest paths first so nested
/// empties disappear before their parents. `root` itself is never removed.
/// Failures are logged and skipped.
pub fn remove_empty_dirs(root: &Path) {
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) if e.file_type().is_dir() => Some(e.into_path()),
            Ok(_) => None,
            Err(err) => {
                warn!("Error while scanning for empty dirs: {}", err);
                None
            }
        })
        .collect();

    dirs.sort_by(|a, b| b.as_os_str().len().cmp(&a.as_os_str().len()));

    for dir in dirs {
        let is_empty = match fs::read_dir(&dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => continue,
        };

        if is_empty {
            info!("Removing empty dir {}", dir.display());
            if let Err(err) = fs::remove_dir(&dir) {
                warn!("Error while removing dir {}: {}", dir.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, write, File};
    use tempfile::tempdir;

    #[test]
    fn relative_slash_path_uses_forward_slashes() {
        let root = Path::new("/data/install");
        let nested = root.join("a").join("b").join("c.txt");
        assert_eq!(
            relative_slash_path(root, &nested),
            Some("a/b/c.txt".to_string())
        );
        assert_eq!(relative_slash_path(root, root), None);
        assert_eq!(relative_slash_path(root, Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn join_slash_path_round_trips() {
        let root = Path::new("/data/install");
        let joined = join_slash_path(root, "a/b/c.txt");
        assert_eq!(relative_slash_path(root, &joined), Some("a/b/c.txt".into()));
    }

    #[test]
    fn backup_path_appends_suffix() {
        assert_eq!(
            backup_path(Path::new("/x/app.dll")),
            PathBuf::from("/x/app.dll.bak")
        );
    }

    #[test]
    fn ensure_parent_dir_creates_missing_chain() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("b").join("f.txt");
        ensure_parent_dir(&target).unwrap();
        assert!(target.parent().unwrap().is_dir());
        File::create(&target).unwrap();
    }

    #[test]
    fn remove_empty_dirs_clears_nested_but_keeps_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        create_dir_all(root.join("a").join("b")).unwrap();
        create_dir_all(root.join("keep")).unwrap();
        write(root.join("keep").join("f.txt"), b"data").unwrap();

        remove_empty_dirs(&root);

        assert!(!root.join("a").exists());
        assert!(root.join("keep").join("f.txt").exists());
        assert!(root.exists());
    }

    #[test]
    fn remove_empty_dirs_on_empty_root_is_noop() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("empty");
        create_dir_all(&root).unwrap();
        remove_empty_dirs(&root);
        assert!(root.exists());
    }
}
