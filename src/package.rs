use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use zip::ZipArchive;

use crate::fsutil;

/// Extract the ZIP archive at `archive` into `dest`. Entries whose names
/// escape `dest` (absolute paths, `..` traversal) are skipped with a
/// warning. Unix permission bits are restored when the archive carries them.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    info!(
        "Extracting {} into {}",
        archive.display(),
        dest.display()
    );

    let file =
        File::open(archive).with_context(|| format!("opening archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("reading archive {}", archive.display()))?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).context("reading archive entry")?;
        let Some(rel) = entry.enclosed_name() else {
            warn!("Skipping archive entry with unsafe name: {}", entry.name());
            continue;
        };
        let target = dest.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
            continue;
        }

        fsutil::ensure_parent_dir(&target)
            .with_context(|| format!("creating parent of {}", target.display()))?;
        let mut out =
            File::create(&target).with_context(|| format!("creating {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("writing {}", target.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
        }
    }

    Ok(())
}

/// Descend through single-directory roots, as produced by archives that wrap
/// their payload in a top-level folder. Returns the first directory that
/// holds more than one entry, or a file.
pub fn find_package_root(dir: &Path) -> PathBuf {
    let mut current = dir.to_path_buf();
    loop {
        let Ok(entries) = fs::read_dir(&current) else {
            return current;
        };
        let entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
        if entries.len() == 1 && entries[0].path().is_dir() {
            current = entries[0].path();
        } else {
            return current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, read_to_string, write};
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(name.to_string(), options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn extracts_nested_entries() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("pkg.zip");
        write_zip(
            &archive,
            &[("a.txt", b"alpha"), ("sub/dir/b.txt", b"beta")],
        );

        let dest = dir.path().join("out");
        create_dir_all(&dest).unwrap();
        extract_archive(&archive, &dest).unwrap();

        assert_eq!(read_to_string(dest.join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            read_to_string(dest.join("sub").join("dir").join("b.txt")).unwrap(),
            "beta"
        );
    }

    #[test]
    fn skips_entries_escaping_the_destination() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../evil.txt", b"nope"), ("ok.txt", b"fine")]);

        let dest = dir.path().join("out");
        create_dir_all(&dest).unwrap();
        extract_archive(&archive, &dest).unwrap();

        assert!(dest.join("ok.txt").exists());
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn missing_archive_errors() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out");
        create_dir_all(&dest).unwrap();
        assert!(extract_archive(&dir.path().join("absent.zip"), &dest).is_err());
    }

    #[test]
    fn find_package_root_descends_single_dir_chain() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("extracted");
        create_dir_all(root.join("wrapper").join("payload")).unwrap();
        write(
            root.join("wrapper").join("payload").join("app.bin"),
            b"data",
        )
        .unwrap();

        assert_eq!(
            find_package_root(&root),
            root.join("wrapper").join("payload")
        );
    }

    #[test]
    fn find_package_root_stops_at_multi_entry_dir() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("extracted");
        create_dir_all(root.join("bin")).unwrap();
        write(root.join("readme.txt"), b"hi").unwrap();

        assert_eq!(find_package_root(&root), root);
    }
}
