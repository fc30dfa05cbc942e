use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use log::warn;
use sha1::{Digest, Sha1};
use walkdir::WalkDir;

use crate::fsutil;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Compute the lowercase SHA-1 hex digest of the file at `path`, streaming
/// its contents so large files never sit in memory whole.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Walk `root` and hash every regular file on a pool of `threads` workers.
///
/// Returns a map from slash-normalized relative path to hex digest. Symlinks
/// and other non-regular entries are ignored. Files that cannot be read are
/// logged and left out of the map; a missing digest later shows up as a diff
/// discrepancy instead of aborting the whole walk.
pub fn hash_tree(root: &Path, threads: usize) -> Result<HashMap<String, String>> {
    if !root.is_dir() {
        anyhow::bail!("not a directory: {}", root.display());
    }

    let workers = threads.max(1);
    let (path_tx, path_rx) = unbounded::<(String, PathBuf)>();
    let (digest_tx, digest_rx) = unbounded::<(String, String)>();

    let map = thread::scope(|s| {
        for _ in 0..workers {
            let rx = path_rx.clone();
            let tx = digest_tx.clone();
            s.spawn(move || {
                for (rel, path) in rx.iter() {
                    match hash_file(&path) {
                        Ok(digest) => {
                            let _ = tx.send((rel, digest));
                        }
                        Err(err) => warn!("Skipping unreadable file {}: {:#}", path.display(), err),
                    }
                }
            });
        }
        // Workers hold their own clones; dropping these lets the channels
        // close once the producer below and all workers are done.
        drop(path_rx);
        drop(digest_tx);

        for entry in WalkDir::new(root) {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!("Walk error under {}: {}", root.display(), err);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = fsutil::relative_slash_path(root, entry.path()) else {
                continue;
            };
            if path_tx.send((rel, entry.into_path())).is_err() {
                break;
            }
        }
        drop(path_tx);

        let mut map = HashMap::new();
        for (rel, digest) in digest_rx.iter() {
            map.insert(rel, digest);
        }
        map
    });

    Ok(map)
}
