//! Backup orchestration.
//!
//! The pipeline owns the metadata record and is the only place that updates it.
//! Workers on the rayon pool fingerprint and archive units and report back; a unit is
//! recorded (and the record persisted) as soon as its containers are durable, so an
//! interrupted run resumes where it stopped.

pub mod single;
pub mod split_merge;
pub mod summary;

use crate::backup::archive::{Archiver, INCOMPLETE_PREFIX};
use crate::backup::backup_config::{BackupConfig, Strategy, VerbatimPlacement};
use crate::backup::cancel::CancelToken;
use crate::backup::classify::ClassifiedEntry;
use crate::backup::fingerprint::Digest;
use crate::backup::metadata::MetadataStore;
use crate::backup::observer::ProgressObserver;
use crate::backup::pipeline::summary::BackupSummary;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::scan::top_level_entries;
use crate::backup::tar::TarArchiver;
use crate::backup::unit::{BackupUnit, UnitState};
use chrono::Utc;
use globset::GlobSet;
use rayon::ThreadPool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Prefix of the scratch directory a merge unpacks into.
pub(crate) static MERGE_SCRATCH_PREFIX: &str = ".merge-";

/// Stem suffix of the store-only side container.
pub static STORE_SUFFIX: &str = ".store";

/// A top-level entry of the source, or the error hit while scanning it.
pub(crate) type ScannedUnit = (String, Result<BackupUnit>);

pub struct BackupPipeline<A: Archiver = TarArchiver> {
    config: BackupConfig,
    compressing: A,
    storing: A,
    pool: Arc<ThreadPool>,
    observer: Arc<dyn ProgressObserver>,
    cancel: CancelToken,
    exclude: GlobSet,
}

impl BackupPipeline<TarArchiver> {
    /// Builds a pipeline whose compressing archiver follows `config.archiver`.
    ///
    /// With [`VerbatimPlacement::SameContainer`] the codec is applied per entry, so
    /// verbatim files can share the container without being compressed.
    pub fn new(
        config: BackupConfig,
        observer: Arc<dyn ProgressObserver>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let compressing = match config.verbatim_placement() {
            VerbatimPlacement::SideContainer => TarArchiver::new(config.archiver().clone()),
            VerbatimPlacement::SameContainer => TarArchiver::per_entry(config.archiver().clone()),
        };
        Self::with_archivers(config, compressing, TarArchiver::store(), observer, cancel)
    }
}

impl<A: Archiver> BackupPipeline<A> {
    pub fn with_archivers(
        config: BackupConfig,
        compressing: A,
        storing: A,
        observer: Arc<dyn ProgressObserver>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let pool = Arc::new(config.build_thread_pool()?);
        let exclude = config.exclude_set()?;
        Ok(Self {
            config,
            compressing,
            storing,
            pool,
            observer,
            cancel,
            exclude,
        })
    }

    /// Shares an existing worker pool instead of the one built from the config.
    pub fn with_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn run(&self) -> Result<BackupSummary> {
        let source = self.config.source();
        if !source.exists() {
            tracing::error!("Source {:?} does not exist", source);
            return Err(Error::NotFound(source.clone()));
        }

        let started = Instant::now();
        let mut summary = BackupSummary::new(Utc::now());
        let backup_dir = self.config.backup_dir();
        std::fs::create_dir_all(&backup_dir)?;
        sweep_incomplete(&backup_dir);

        let mut metadata = MetadataStore::load(self.config.metadata_path());
        tracing::info!(
            "Backing up {:?} into {:?} ({} known units)",
            source,
            backup_dir,
            metadata.len()
        );

        let source = self.config.effective_source();
        if &source != self.config.source() {
            tracing::info!("Steam library detected, backing up games from {:?}", source);
        }

        if source.is_file() {
            if *self.config.strategy() == Strategy::SplitMerge {
                tracing::debug!("Source is a single file, using the single-archive strategy");
            }
            let name = self.config.source_name();
            let unit = BackupUnit::from_path(&source, &GlobSet::empty());
            self.run_single(
                vec![(name, unit)],
                self.config.file_store_limit(),
                &backup_dir,
                &mut metadata,
                &mut summary,
            )?;
        } else {
            let units = self.scan_units(&source, &backup_dir)?;
            let units = self.reject_container_collisions(units);
            match self.config.strategy() {
                Strategy::Single => {
                    self.run_single(units, None, &backup_dir, &mut metadata, &mut summary)?
                }
                Strategy::SplitMerge => {
                    self.run_split_merge(units, &backup_dir, &mut metadata, &mut summary)?
                }
            }
        }

        summary.finish(started.elapsed());
        tracing::info!("{summary}");
        Ok(summary)
    }

    fn scan_units(&self, source: &Path, backup_dir: &Path) -> Result<Vec<ScannedUnit>> {
        let units = top_level_entries(source)?
            .into_iter()
            .filter(|path| {
                if backup_dir.starts_with(path) {
                    tracing::warn!("Skipping {:?}: it holds the backup destination", path);
                    return false;
                }
                true
            })
            .filter_map(|path| {
                let name = path.file_name()?.to_string_lossy().to_string();
                if self.exclude.is_match(&name) {
                    tracing::debug!("Excluding unit {name}");
                    return None;
                }
                let unit = BackupUnit::from_path(&path, &self.exclude);
                Some((name, unit))
            })
            .collect();
        Ok(units)
    }

    /// Main and side container paths of `unit` under `dir`.
    fn unit_containers(&self, dir: &Path, unit: &str) -> [PathBuf; 2] {
        [
            self.compressing.container_path(dir, unit),
            self.storing
                .container_path(dir, &format!("{unit}{STORE_SUFFIX}")),
        ]
    }

    /// Fails every unit whose containers would overwrite those of an earlier unit.
    ///
    /// Container stems are unique per name, but a unit named `x.store` still meets the
    /// side container of `x` when both archivers share an extension.
    fn reject_container_collisions(&self, units: Vec<ScannedUnit>) -> Vec<ScannedUnit> {
        let mut owners: HashMap<PathBuf, String> = HashMap::new();
        units
            .into_iter()
            .map(|(name, unit)| {
                let containers = self.unit_containers(Path::new(""), &name);
                if let Some((container, owner)) = containers
                    .iter()
                    .find_map(|c| owners.get(c).map(|owner| (c, owner)))
                {
                    let error = Error::ContainerCollision {
                        unit: name.clone(),
                        owner: owner.clone(),
                        container: container.to_string_lossy().to_string(),
                    };
                    return (name, Err(error));
                }
                for container in containers {
                    owners.insert(container, name.clone());
                }
                (name, unit)
            })
            .collect()
    }

    fn fingerprint(&self, unit: &BackupUnit) -> Result<Option<Digest>> {
        unit.digest(*self.config.chunk_size(), &self.pool, &self.cancel)
    }

    /// Streams `compress` through the codec and `stored` as is into a new container at
    /// `target`.
    ///
    /// The container only appears under `target` once every entry was written;
    /// on error or cancellation the partial file is discarded.
    fn write_container(
        &self,
        archiver: &A,
        target: &Path,
        unit: &str,
        compress: &[ClassifiedEntry],
        stored: &[ClassifiedEntry],
    ) -> Result<PathBuf> {
        let mut handle = archiver.open(target)?;
        for entry in compress {
            self.cancel.check()?;
            archiver.write_entry(&mut handle, entry.source(), entry.name())?;
            self.observer.on_file_processed(unit, entry.name());
        }
        for entry in stored {
            self.cancel.check()?;
            archiver.write_stored_entry(&mut handle, entry.source(), entry.name())?;
            self.observer.on_file_processed(unit, entry.name());
        }
        archiver.close(handle)
    }

    fn complete(&self, summary: &mut BackupSummary, unit: &str, state: UnitState) {
        match state {
            UnitState::UpToDate => summary.record_up_to_date(unit),
            _ => summary.record_backed_up(unit),
        }
        self.observer.on_unit_completed(unit, state);
    }

    fn fail(&self, summary: &mut BackupSummary, unit: &str, error: Error) {
        tracing::warn!("Unit {unit} failed, it will be retried next run: {error}");
        self.observer.on_unit_failed(unit, &error);
        summary.record_failed(unit, &error);
    }

    fn skip_empty(&self, summary: &mut BackupSummary, unit: &str) {
        tracing::info!("{unit} is empty, nothing to back up");
        summary.record_skipped_empty(unit);
        self.observer.on_unit_skipped(unit);
    }
}

/// Removes containers and scratch directories left behind by a killed run.
fn sweep_incomplete(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|r| r.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        let res = if name.starts_with(INCOMPLETE_PREFIX) {
            std::fs::remove_file(&path)
        } else if name.starts_with(MERGE_SCRATCH_PREFIX) {
            std::fs::remove_dir_all(&path)
        } else {
            continue;
        };
        match res {
            Ok(_) => tracing::info!("Removed leftover {:?}", path),
            Err(e) => tracing::warn!("Cannot remove leftover {:?}: {}", path, e),
        }
    }
}

/// Removes a file or directory tree; a missing path is not an error.
fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::backup::archive::Archiver;
    use crate::backup::compress::xz::XzConfig;
    use crate::backup::compress::CompressorConfig;
    use crate::backup::result_error::error::Error;
    use crate::backup::result_error::result::Result;
    use crate::backup::tar::{TarArchiver, TarHandle};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub fn write_file(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn fast_xz() -> CompressorConfig {
        CompressorConfig::Xz(XzConfig::new(Some(0), Some(1)))
    }

    /// Tar archiver that fails on entries below `fail_prefix` and counts writes.
    pub struct FlakyArchiver {
        inner: TarArchiver,
        fail_prefix: Option<String>,
        pub writes: Arc<AtomicUsize>,
    }

    impl FlakyArchiver {
        pub fn new(inner: TarArchiver, fail_prefix: Option<&str>) -> Self {
            Self {
                inner,
                fail_prefix: fail_prefix.map(Into::into),
                writes: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn check(&self, archive_name: &str) -> Result<()> {
            if let Some(prefix) = &self.fail_prefix {
                if archive_name.starts_with(prefix.as_str()) {
                    return Err(Error::from(std::io::Error::other("injected write failure")));
                }
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Archiver for FlakyArchiver {
        type Handle = TarHandle;

        fn open(&self, container_path: &Path) -> Result<TarHandle> {
            self.inner.open(container_path)
        }

        fn write_entry(
            &self,
            handle: &mut TarHandle,
            source_path: &Path,
            archive_name: &str,
        ) -> Result<()> {
            self.check(archive_name)?;
            self.inner.write_entry(handle, source_path, archive_name)
        }

        fn write_stored_entry(
            &self,
            handle: &mut TarHandle,
            source_path: &Path,
            archive_name: &str,
        ) -> Result<()> {
            self.check(archive_name)?;
            self.inner.write_stored_entry(handle, source_path, archive_name)
        }

        fn close(&self, handle: TarHandle) -> Result<PathBuf> {
            self.inner.close(handle)
        }

        fn extract(&self, container_path: &Path, destination: &Path) -> Result<()> {
            self.inner.extract(container_path, destination)
        }

        fn container_ext(&self) -> Arc<str> {
            self.inner.container_ext()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::backup::compress::CompressorConfig;
    use crate::backup::observer::NoopObserver;
    use crate::backup::tar::list_entries;
    use tempfile::TempDir;

    #[test]
    fn test_missing_source_is_not_found() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig::builder()
            .source(dir.path().join("missing"))
            .destination(dir.path().join("out"))
            .build();
        let pipeline =
            BackupPipeline::new(config, Arc::new(NoopObserver), CancelToken::new()).unwrap();
        assert!(matches!(pipeline.run(), Err(Error::NotFound(_))));
        assert!(!dir.path().join("out").exists());
    }

    fn pipeline(config: &BackupConfig) -> BackupPipeline {
        BackupPipeline::new(config.clone(), Arc::new(NoopObserver), CancelToken::new()).unwrap()
    }

    fn single_file_config(root: &Path, file_store_below: u64) -> BackupConfig {
        BackupConfig::builder()
            .source(root.join("src/save.dat"))
            .destination(root.join("out"))
            .archiver(fast_xz())
            .workers(2)
            .file_store_below(file_store_below)
            .build()
    }

    #[test]
    fn test_single_file_source() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "src/save.dat", b"save game");
        let config = single_file_config(dir.path(), 0);
        let pipeline = pipeline(&config);

        let summary = pipeline.run().unwrap();
        assert_eq!(summary.backed_up(), &vec!["save.dat".to_string()]);
        assert!(config.backup_dir().join("save.dat.tar.xz").is_file());
        let metadata = MetadataStore::load(config.metadata_path());
        assert!(metadata.get("save.dat").is_some());

        let summary = pipeline.run().unwrap();
        assert_eq!(summary.up_to_date(), &vec!["save.dat".to_string()]);
    }

    #[test]
    fn test_small_single_file_is_stored() {
        let dir = TempDir::new().unwrap();
        let content = b"small save game ".repeat(64);
        write_file(dir.path(), "src/save.dat", &content);
        let config = single_file_config(dir.path(), 4096);

        pipeline(&config).run().unwrap();
        let stored = config.backup_dir().join("save.dat.store.tar");
        let raw = std::fs::read(&stored).unwrap();
        assert!(raw.windows(content.len()).any(|w| w == content.as_slice()));
        assert!(!config.backup_dir().join("save.dat.tar.xz").exists());

        // Grown past the limit, the file goes through the codec and the stored copy goes.
        write_file(dir.path(), "src/save.dat", &b"large save game ".repeat(512));
        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.backed_up(), &vec!["save.dat".to_string()]);
        assert!(config.backup_dir().join("save.dat.tar.xz").is_file());
        assert!(!stored.exists());
    }

    #[test]
    fn test_steam_library_units_come_from_games_folder() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "SteamLibrary/steamapps/common/Portal/portal.exe", b"exe");
        write_file(dir.path(), "SteamLibrary/steamapps/common/Celeste/celeste.dat", b"dat");
        write_file(dir.path(), "SteamLibrary/steamapps/appmanifest_400.acf", b"manifest");
        let config = BackupConfig::builder()
            .source(dir.path().join("SteamLibrary"))
            .destination(dir.path().join("out"))
            .archiver(fast_xz())
            .workers(2)
            .build();

        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.backed_up(), &vec!["Celeste", "Portal"]);
        let backup_dir = dir.path().join("out/SteamLibrary_backup");
        assert!(backup_dir.join("Portal.tar.xz").is_file());
        assert!(!backup_dir.join("steamapps.tar.xz").exists());
        let metadata = MetadataStore::load(backup_dir.join("SteamLibrary_meta.json"));
        assert_eq!(metadata.len(), 2);
    }

    #[test]
    fn test_sanitized_names_get_their_own_containers() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "library/a:b/one.txt", b"colon");
        write_file(dir.path(), "library/ab/two.txt", b"plain");
        let config = BackupConfig::builder()
            .source(dir.path().join("library"))
            .destination(dir.path().join("out"))
            .archiver(CompressorConfig::None)
            .build();

        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.backed_up(), &vec!["a:b", "ab"]);
        let colon = TarArchiver::store().container_path(&config.backup_dir(), "a:b");
        let plain = config.backup_dir().join("ab.tar");
        assert_ne!(colon, plain);
        assert_eq!(list_entries(&colon, &CompressorConfig::None).unwrap(), vec!["a:b/one.txt"]);
        assert_eq!(list_entries(&plain, &CompressorConfig::None).unwrap(), vec!["ab/two.txt"]);
    }

    #[test]
    fn test_colliding_container_fails_later_unit() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "library/clip/a.mp4", b"video");
        write_file(dir.path(), "library/clip.store/b.txt", b"text");
        // Without a codec both archivers write `.tar`, so `clip.store.tar` is claimed twice.
        let config = BackupConfig::builder()
            .source(dir.path().join("library"))
            .destination(dir.path().join("out"))
            .archiver(CompressorConfig::None)
            .build();

        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.backed_up(), &vec!["clip"]);
        assert!(summary.is_failed("clip.store"));
        assert!(summary.failed()[0].message().contains("belongs to unit \"clip\""));
        assert_eq!(
            list_entries(config.backup_dir().join("clip.store.tar"), &CompressorConfig::None)
                .unwrap(),
            vec!["clip/a.mp4"]
        );
        let metadata = MetadataStore::load(config.metadata_path());
        assert!(metadata.get("clip.store").is_none());
    }

    #[test]
    fn test_sweep_incomplete() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), ".incomplete-abc.tmp", b"partial");
        write_file(dir.path(), ".merge-xyz/tree/a", b"scratch");
        write_file(dir.path(), "game.tar.xz", b"keep");

        sweep_incomplete(dir.path());
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["game.tar.xz"]);
    }

    #[test]
    fn test_remove_path() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "d/x", b"1");
        write_file(dir.path(), "f", b"1");
        remove_path(&dir.path().join("d")).unwrap();
        remove_path(&dir.path().join("f")).unwrap();
        remove_path(&dir.path().join("missing")).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
