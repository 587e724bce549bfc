//! Content fingerprints for files and directory trees.
//!
//! Digests are BLAKE3 hashes rendered as lowercase hex. A tree digest is the hash of
//! the per-file hex digests fed in sorted relative-path order, so the result does not
//! depend on directory listing order or on which worker finished first.
//!
//! Paths are ordered the way [`Path`] compares them, one component at a time, not as
//! plain strings: `a/b` sorts before `a.txt` because the component `a` is a prefix of
//! `a.txt`. Changing this order would change every tree digest already recorded.

use crate::backup::cancel::CancelToken;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::scan::scan_files;
use derive_more::{Display, From};
use globset::GlobSet;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Default read size used while streaming a file through the hasher.
pub static DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(
    Clone, Debug, Display, From, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash.to_hex().to_string())
    }
}

impl From<&str> for Digest {
    fn from(hex: &str) -> Self {
        Self(hex.to_ascii_lowercase())
    }
}

pub fn fingerprint_file<P: AsRef<Path>>(path: P, chunk_size: usize) -> Result<Digest> {
    fingerprint_file_cancellable(path, chunk_size, &CancelToken::default())
}

/// Streams `path` through the hasher `chunk_size` bytes at a time.
///
/// I/O errors surface as [`Error::HashFailure`] naming the file.
pub fn fingerprint_file_cancellable<P: AsRef<Path>>(
    path: P,
    chunk_size: usize,
    cancel: &CancelToken,
) -> Result<Digest> {
    let path = path.as_ref();
    let hash_failure = |source| Error::HashFailure {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(hash_failure)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        cancel.check()?;
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(hash_failure(e)),
        };
        hasher.update(&buf[..n]);
    }

    let digest = Digest::from(hasher.finalize());
    tracing::trace!("Fingerprint {:?} = {}", path, digest);
    Ok(digest)
}

/// Folds per-file digests, already in sorted path order, into one digest.
pub fn fold_digests<'a, I: IntoIterator<Item = &'a Digest>>(digests: I) -> Digest {
    let mut hasher = blake3::Hasher::new();
    for digest in digests {
        hasher.update(digest.as_str().as_bytes());
    }
    hasher.finalize().into()
}

/// Re-sorts `(relative path, digest)` pairs coming back from workers and folds them.
pub fn fold_sorted(mut digests: Vec<(PathBuf, Digest)>) -> Option<Digest> {
    if digests.is_empty() {
        return None;
    }
    digests.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    Some(fold_digests(digests.iter().map(|(_, d)| d)))
}

/// Combined digest of every file under `root`.
///
/// Returns `Ok(None)` when the tree holds no files; callers treat that as nothing to
/// back up.
pub fn fingerprint_tree<P: AsRef<Path>>(
    root: P,
    chunk_size: usize,
    pool: &ThreadPool,
) -> Result<Option<Digest>> {
    let root = root.as_ref();
    let files = scan_files(root, "", &GlobSet::empty())?.collect::<Result<Vec<_>>>()?;

    let digests = pool.install(|| {
        files
            .par_iter()
            .map(|f| {
                fingerprint_file(f.path(), chunk_size).map(|d| (f.relative().to_path_buf(), d))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    Ok(fold_sorted(digests))
}
