//! Units of change detection: single files and top-level directories.

use crate::backup::cancel::CancelToken;
use crate::backup::fingerprint::{fingerprint_file_cancellable, fold_sorted, Digest};
use crate::backup::result_error::result::Result;
use crate::backup::scan::scan_sorted;
use derive_more::Display;
use getset::Getters;
use globset::GlobSet;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// A single file on disk. Its digest is computed at most once per run.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct FileUnit {
    path: PathBuf,
    /// Path below the backup root; also the archive entry name.
    relative: PathBuf,
    size: u64,
    #[getset(skip)]
    digest: OnceLock<Digest>,
}

impl FileUnit {
    pub fn new<P1: Into<PathBuf>, P2: Into<PathBuf>>(path: P1, relative: P2, size: u64) -> Self {
        Self {
            path: path.into(),
            relative: relative.into(),
            size,
            digest: OnceLock::new(),
        }
    }

    /// Archive entry name, always `/` separated.
    pub fn entry_name(&self) -> String {
        self.relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn cached_digest(&self) -> Option<&Digest> {
        self.digest.get()
    }

    pub fn digest(&self, chunk_size: usize, cancel: &CancelToken) -> Result<&Digest> {
        if let Some(digest) = self.digest.get() {
            return Ok(digest);
        }
        let digest = fingerprint_file_cancellable(&self.path, chunk_size, cancel)?;
        Ok(self.digest.get_or_init(|| digest))
    }
}

/// A directory directly under the backup root, holding its files in sorted order.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct DirectoryUnit {
    name: String,
    root: PathBuf,
    files: Vec<FileUnit>,
}

impl DirectoryUnit {
    pub fn scan<P: AsRef<Path>>(root: P, exclude: &GlobSet) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let name = unit_name(&root);
        let files = scan_sorted(&root, &name, exclude)?;
        Ok(Self { name, root, files })
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Hashes every file on `pool`, then folds the digests in path order.
    pub fn digest(
        &self,
        chunk_size: usize,
        pool: &ThreadPool,
        cancel: &CancelToken,
    ) -> Result<Option<Digest>> {
        let digests = pool.install(|| {
            self.files
                .par_iter()
                .map(|f| {
                    f.digest(chunk_size, cancel)
                        .map(|d| (f.relative.clone(), d.clone()))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(fold_sorted(digests))
    }
}

#[derive(Debug)]
pub enum BackupUnit {
    File(FileUnit),
    Directory(DirectoryUnit),
}

impl BackupUnit {
    /// Builds the unit for a path directly under the backup root.
    pub fn from_path<P: AsRef<Path>>(path: P, exclude: &GlobSet) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Ok(Self::Directory(DirectoryUnit::scan(path, exclude)?));
        }
        let name = unit_name(path);
        let size = std::fs::metadata(path)?.len();
        Ok(Self::File(FileUnit::new(path, name, size)))
    }

    /// Key used in the metadata record.
    pub fn name(&self) -> String {
        match self {
            BackupUnit::File(f) => f.entry_name(),
            BackupUnit::Directory(d) => d.name.clone(),
        }
    }

    pub fn files(&self) -> &[FileUnit] {
        match self {
            BackupUnit::File(f) => std::slice::from_ref(f),
            BackupUnit::Directory(d) => &d.files,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }

    pub fn digest(
        &self,
        chunk_size: usize,
        pool: &ThreadPool,
        cancel: &CancelToken,
    ) -> Result<Option<Digest>> {
        match self {
            BackupUnit::File(f) => f.digest(chunk_size, cancel).map(|d| Some(d.clone())),
            BackupUnit::Directory(d) => d.digest(chunk_size, pool, cancel),
        }
    }
}

fn unit_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Lifecycle of one unit within a run.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Fingerprinted,
    #[display("up to date")]
    UpToDate,
    #[display("skipped (empty)")]
    SkippedEmpty,
    Classified,
    Compressed,
    #[display("metadata updated")]
    MetadataUpdated,
    Failed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::UpToDate
                | UnitState::SkippedEmpty
                | UnitState::MetadataUpdated
                | UnitState::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::ThreadPoolBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_file_unit_digest_is_cached() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "first").unwrap();

        let unit = FileUnit::new(&path, "a.txt", 5);
        assert!(unit.cached_digest().is_none());
        let first = unit.digest(1024, &CancelToken::default()).unwrap().clone();

        std::fs::write(&path, "second").unwrap();
        let second = unit.digest(1024, &CancelToken::default()).unwrap();
        assert_eq!(&first, second);
        assert_eq!(unit.cached_digest(), Some(&first));
    }

    #[test]
    fn test_entry_name_uses_forward_slashes() {
        let unit = FileUnit::new("/x/y", Path::new("game").join("data").join("x.pak"), 0);
        assert_eq!(unit.entry_name(), "game/data/x.pak");
    }

    #[test]
    fn test_directory_unit_scan_and_digest() {
        let dir = TempDir::new().unwrap();
        let game = dir.path().join("game");
        std::fs::create_dir_all(game.join("bin")).unwrap();
        std::fs::write(game.join("bin/run.exe"), "exe").unwrap();
        std::fs::write(game.join("readme.txt"), "hello").unwrap();

        let unit = DirectoryUnit::scan(&game, &GlobSet::empty()).unwrap();
        assert_eq!(unit.name(), "game");
        assert_eq!(unit.total_size(), 8);
        let names: Vec<_> = unit.files().iter().map(FileUnit::entry_name).collect();
        assert_eq!(names, vec!["game/bin/run.exe", "game/readme.txt"]);

        let pool = ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let digest = unit.digest(1024, &pool, &CancelToken::default()).unwrap();
        let tree = crate::backup::fingerprint::fingerprint_tree(&game, 1024, &pool).unwrap();
        assert_eq!(digest, tree);
    }

    #[test]
    fn test_backup_unit_from_path() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("loose.bin"), "1234").unwrap();

        let empty = BackupUnit::from_path(dir.path().join("empty"), &GlobSet::empty()).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.name(), "empty");

        let loose = BackupUnit::from_path(dir.path().join("loose.bin"), &GlobSet::empty()).unwrap();
        assert!(!loose.is_empty());
        assert_eq!(loose.name(), "loose.bin");
        assert_eq!(*loose.files()[0].size(), 4);
    }

    #[test]
    fn test_terminal_states() {
        assert!(UnitState::UpToDate.is_terminal());
        assert!(UnitState::Failed.is_terminal());
        assert!(!UnitState::Classified.is_terminal());
        assert_eq!(UnitState::UpToDate.to_string(), "up to date");
    }
}
