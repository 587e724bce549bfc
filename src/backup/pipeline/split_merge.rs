//! Split-merge: every changed unit is archived on its own worker into staging
//! containers, then all staged containers are merged into the containers of the whole
//! source.
//!
//! Staged containers outlive a failed merge. Their units are already recorded as
//! backed up, so the next run finds them unchanged and only retries the merge.
//!
//! The merged containers mirror the source: units that disappeared or became empty
//! are dropped from them, and from the record, by the next merge.

use crate::backup::archive::{Archiver, INCOMPLETE_PREFIX};
use crate::backup::change::{detect, ChangeDecision};
use crate::backup::classify::classify;
use crate::backup::fingerprint::Digest;
use crate::backup::metadata::MetadataStore;
use crate::backup::pipeline::summary::BackupSummary;
use crate::backup::pipeline::{remove_path, BackupPipeline, ScannedUnit, MERGE_SCRATCH_PREFIX};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::scan::{scan_sorted, top_level_entries};
use crate::backup::unit::{BackupUnit, UnitState};
use globset::GlobSet;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;

pub static STAGING_DIR: &str = ".staging";

enum StageOutcome {
    Empty,
    UpToDate,
    Staged {
        digest: Digest,
        containers: Vec<PathBuf>,
    },
}

struct StageReport {
    unit: String,
    outcome: Result<StageOutcome>,
}

impl<A: Archiver> BackupPipeline<A> {
    pub(super) fn run_split_merge(
        &self,
        units: Vec<ScannedUnit>,
        backup_dir: &Path,
        metadata: &mut MetadataStore,
        summary: &mut BackupSummary,
    ) -> Result<()> {
        let staging = backup_dir.join(STAGING_DIR);
        std::fs::create_dir_all(&staging)?;
        super::sweep_incomplete(&staging);

        // Units whose subtree belongs in the merged containers.
        let mut live: BTreeSet<String> = units.iter().map(|(name, _)| name.clone()).collect();
        let mut pending = Vec::with_capacity(units.len());
        for (name, unit) in units {
            match unit {
                Ok(unit) if unit.is_empty() => {
                    live.remove(&name);
                    self.skip_empty(summary, &name)
                }
                Ok(unit) => pending.push((name, unit)),
                Err(e) => self.fail(summary, &name, e),
            }
        }

        let mut cancelled = false;
        let (tx, rx) = channel::<StageReport>();
        self.pool.in_place_scope(|scope| -> Result<()> {
            for (name, unit) in &pending {
                let tx = tx.clone();
                let previous = metadata.get(name).cloned();
                let staging = staging.as_path();
                scope.spawn(move |_| {
                    let outcome = self.stage_unit(name, unit, previous.as_ref(), staging);
                    let _ = tx.send(StageReport {
                        unit: name.clone(),
                        outcome,
                    });
                });
            }
            drop(tx);

            // Only this thread touches the record, one finished unit at a time.
            for report in rx {
                let StageReport { unit, outcome } = report;
                match outcome {
                    Ok(StageOutcome::Empty) => {
                        live.remove(&unit);
                        self.skip_empty(summary, &unit)
                    }
                    Ok(StageOutcome::UpToDate) => {
                        self.complete(summary, &unit, UnitState::UpToDate)
                    }
                    Ok(StageOutcome::Staged { digest, containers }) => {
                        tracing::debug!("Staged {unit} in {:?}", containers);
                        metadata.record(unit.as_str(), digest);
                        metadata
                            .save()
                            .add_msg(format!("Recording backup of {unit} failed"))?;
                        self.complete(summary, &unit, UnitState::MetadataUpdated);
                    }
                    Err(e) if e.is_cancelled() => cancelled = true,
                    Err(e) => self.fail(summary, &unit, e),
                }
            }
            Ok(())
        })?;

        if cancelled {
            return Err(Error::Cancelled);
        }

        let gone: Vec<String> = metadata
            .iter()
            .map(|(name, _)| name)
            .filter(|name| !live.contains(name.as_str()))
            .cloned()
            .collect();
        match self.merge(&staging, backup_dir, &live, !gone.is_empty()) {
            Ok(Some(merged)) => {
                merged.into_iter().for_each(|path| summary.record_archive(path));
                if !gone.is_empty() {
                    tracing::info!("Dropped {:?} from the backup", gone);
                    gone.iter().for_each(|name| {
                        metadata.remove(name);
                    });
                    metadata
                        .save()
                        .add_msg("Recording removed units failed")?;
                }
            }
            Ok(None) => tracing::info!("No staged units, merged archive left as is"),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::error!("Merge failed, staged containers kept for the next run");
                return Err(Error::MergeFailure(Box::new(e)));
            }
        }
        Ok(())
    }

    /// Runs on a pool worker. Fingerprints the unit and archives it into the staging
    /// directory when it differs from `previous`.
    fn stage_unit(
        &self,
        name: &str,
        unit: &BackupUnit,
        previous: Option<&Digest>,
        staging: &Path,
    ) -> Result<StageOutcome> {
        self.cancel.check()?;
        self.observer.on_unit_started(name, unit.files().len());
        let Some(digest) = self.fingerprint(unit)? else {
            return Ok(StageOutcome::Empty);
        };
        let decision = detect(previous, &digest);
        tracing::debug!("{name} fingerprint {digest}: {decision}");
        if decision == ChangeDecision::Unchanged {
            return Ok(StageOutcome::UpToDate);
        }

        let classification = classify(unit.files(), self.config.skip_extensions());
        match self.write_unit(name, classification, staging) {
            Ok(containers) => Ok(StageOutcome::Staged { digest, containers }),
            Err(e) => {
                // Half a unit must not reach the merge.
                for path in self.unit_containers(staging, name) {
                    if let Err(remove) = remove_path(&path) {
                        tracing::warn!("Cannot remove staged {:?}: {}", path, remove);
                    }
                }
                Err(Error::compression_failure(name, e))
            }
        }
    }

    /// Folds every staged container into the containers of `<source name>` under
    /// `backup_dir`.
    ///
    /// The previous merged containers are unpacked first so units that were not staged
    /// this time are carried forward. A staged unit replaces its whole subtree, and
    /// subtrees of units missing from `live` are dropped. The merged containers are only
    /// replaced once the new ones are complete. Nothing happens when no unit was staged
    /// and nothing needs dropping.
    fn merge(
        &self,
        staging: &Path,
        backup_dir: &Path,
        live: &BTreeSet<String>,
        drop_gone: bool,
    ) -> Result<Option<Vec<PathBuf>>> {
        let staged: Vec<PathBuf> = top_level_entries(staging)?
            .into_iter()
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .map(|n| n.to_string_lossy())
                        .is_some_and(|n| !n.starts_with(INCOMPLETE_PREFIX))
            })
            .collect();
        if staged.is_empty() && !drop_gone {
            return Ok(None);
        }

        let source_name = self.config.source_name();
        let [main, side] = self.unit_containers(backup_dir, &source_name);
        let scratch = tempfile::Builder::new()
            .prefix(MERGE_SCRATCH_PREFIX)
            .tempdir_in(backup_dir)?;
        let tree = scratch.path().join("tree");
        std::fs::create_dir_all(&tree)?;

        for (archiver, previous) in [(&self.compressing, &main), (&self.storing, &side)] {
            if previous.exists() {
                tracing::info!("Carrying forward {:?}", previous);
                archiver
                    .extract(previous, &tree)
                    .add_msg(format!("Unpacking previous archive {:?} failed", previous))?;
            }
        }

        let unpacked = scratch.path().join("staged");
        let compressed_suffix = format!(".{}", self.compressing.container_ext());
        for container in &staged {
            self.cancel.check()?;
            let archiver = if container.to_string_lossy().ends_with(&compressed_suffix) {
                &self.compressing
            } else {
                &self.storing
            };
            archiver
                .extract(container, &unpacked)
                .add_msg(format!("Unpacking staged container {:?} failed", container))?;
        }
        if unpacked.exists() {
            for top in top_level_entries(&unpacked)? {
                let Some(file_name) = top.file_name() else {
                    continue;
                };
                let dst = tree.join(file_name);
                remove_path(&dst)?;
                std::fs::rename(&top, &dst)?;
            }
        }

        for top in top_level_entries(&tree)? {
            let name = top
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !live.contains(&name) {
                tracing::info!("Dropping {name}, it is no longer in the source");
                remove_path(&top)?;
            }
        }

        let files = scan_sorted(&tree, "", &GlobSet::empty())?;
        tracing::info!(
            "Merging {} staged containers into {:?} ({} entries)",
            staged.len(),
            main,
            files.len()
        );
        let classification = classify(&files, self.config.skip_extensions());
        let merged = self.write_unit(&source_name, classification, backup_dir)?;

        for container in &staged {
            std::fs::remove_file(container)?;
        }
        Ok(Some(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::backup_config::{BackupConfig, Strategy, VerbatimPlacement};
    use crate::backup::cancel::CancelToken;
    use crate::backup::compress::CompressorConfig;
    use crate::backup::observer::NoopObserver;
    use crate::backup::pipeline::test_support::*;
    use crate::backup::tar::{list_entries, TarArchiver};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config(root: &Path) -> BackupConfig {
        BackupConfig::builder()
            .source(root.join("library"))
            .destination(root.join("out"))
            .strategy(Strategy::SplitMerge)
            .archiver(fast_xz())
            .workers(3)
            .build()
    }

    fn pipeline(config: &BackupConfig) -> BackupPipeline {
        BackupPipeline::new(config.clone(), Arc::new(NoopObserver), CancelToken::new()).unwrap()
    }

    fn merged_entries(config: &BackupConfig) -> Vec<String> {
        list_entries(
            config.backup_dir().join("library.tar.xz"),
            &fast_xz(),
        )
        .unwrap()
    }

    fn staged(config: &BackupConfig) -> Vec<String> {
        std::fs::read_dir(config.backup_dir().join(STAGING_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_merge_and_carry_forward() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "library/game/a.txt", b"alpha");
        write_file(dir.path(), "library/game/old.txt", b"old");
        write_file(dir.path(), "library/saves/s1", b"save");
        write_file(dir.path(), "library/readme.md", b"readme");
        let config = config(dir.path());

        let summary = pipeline(&config).run().unwrap();
        let mut backed_up = summary.backed_up().clone();
        backed_up.sort();
        assert_eq!(backed_up, vec!["game", "readme.md", "saves"]);
        assert_eq!(
            merged_entries(&config),
            vec!["game/a.txt", "game/old.txt", "readme.md", "saves/s1"]
        );
        assert!(staged(&config).is_empty());
        assert_eq!(MetadataStore::load(config.metadata_path()).len(), 3);

        // Only "game" changes; "saves" must be carried forward from the merged archive.
        std::fs::remove_file(dir.path().join("library/game/old.txt")).unwrap();
        write_file(dir.path(), "library/game/b.txt", b"beta");
        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.backed_up(), &vec!["game"]);
        assert_eq!(
            merged_entries(&config),
            vec!["game/a.txt", "game/b.txt", "readme.md", "saves/s1"]
        );

        let restored = dir.path().join("restored");
        TarArchiver::new(fast_xz())
            .extract(&config.backup_dir().join("library.tar.xz"), &restored)
            .unwrap();
        assert_eq!(std::fs::read(restored.join("saves/s1")).unwrap(), b"save");
        assert_eq!(std::fs::read(restored.join("game/b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn test_unchanged_run_keeps_merged_archive() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "library/game/a.txt", b"alpha");
        let config = config(dir.path());
        pipeline(&config).run().unwrap();
        let merged = config.backup_dir().join("library.tar.xz");
        let modified = std::fs::metadata(&merged).unwrap().modified().unwrap();

        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.up_to_date(), &vec!["game"]);
        assert!(summary.archives().is_empty());
        assert_eq!(std::fs::metadata(&merged).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn test_failed_unit_left_out_of_merge() {
        let dir = TempDir::new().unwrap();
        for unit in ["alpha", "bad", "gamma"] {
            write_file(dir.path(), &format!("library/{unit}/data.bin"), unit.as_bytes());
        }
        let config = config(dir.path());
        let flaky_pipeline = BackupPipeline::with_archivers(
            config.clone(),
            FlakyArchiver::new(TarArchiver::new(fast_xz()), Some("bad/")),
            FlakyArchiver::new(TarArchiver::store(), None),
            Arc::new(NoopObserver),
            CancelToken::new(),
        )
        .unwrap();

        let summary = flaky_pipeline.run().unwrap();
        assert!(summary.is_failed("bad"));
        assert_eq!(summary.failed().len(), 1);
        assert_eq!(
            merged_entries(&config),
            vec!["alpha/data.bin", "gamma/data.bin"]
        );
        assert!(MetadataStore::load(config.metadata_path())
            .get("bad")
            .is_none());

        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.backed_up(), &vec!["bad"]);
        assert_eq!(
            merged_entries(&config),
            vec!["alpha/data.bin", "bad/data.bin", "gamma/data.bin"]
        );
    }

    #[test]
    fn test_merge_failure_keeps_previous_archive_and_staging() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "library/game/a.txt", b"alpha");
        write_file(dir.path(), "library/saves/s1", b"save");
        let config = config(dir.path());
        pipeline(&config).run().unwrap();
        let merged = config.backup_dir().join("library.tar.xz");
        let before = std::fs::read(&merged).unwrap();

        // The merge repacks under the source name, which this archiver refuses.
        write_file(dir.path(), "library/saves/s2", b"second save");
        let flaky_pipeline = BackupPipeline::with_archivers(
            config.clone(),
            FlakyArchiver::new(TarArchiver::new(fast_xz()), Some("game/")),
            FlakyArchiver::new(TarArchiver::store(), None),
            Arc::new(NoopObserver),
            CancelToken::new(),
        )
        .unwrap();
        let err = flaky_pipeline.run().unwrap_err();
        assert!(matches!(err, Error::MergeFailure(_)));
        assert_eq!(std::fs::read(&merged).unwrap(), before);
        assert_eq!(staged(&config), vec!["saves.tar.xz"]);

        // Next run has nothing new to stage but completes the pending merge.
        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.up_to_date().len(), 2);
        assert_eq!(summary.archives(), &vec![merged.clone()]);
        assert_eq!(
            merged_entries(&config),
            vec!["game/a.txt", "saves/s1", "saves/s2"]
        );
        assert!(staged(&config).is_empty());
    }

    #[test]
    fn test_empty_units_skipped() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "library/game/a.txt", b"alpha");
        std::fs::create_dir_all(dir.path().join("library/empty")).unwrap();
        let config = config(dir.path());

        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.skipped_empty(), &vec!["empty"]);
        assert_eq!(merged_entries(&config), vec!["game/a.txt"]);
    }

    #[test]
    fn test_hidden_unit_is_merged() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "library/game/a.txt", b"alpha");
        write_file(dir.path(), "library/.config/settings.ini", b"volume=3");
        let config = config(dir.path());

        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.backed_up().len(), 2);
        assert_eq!(
            merged_entries(&config),
            vec![".config/settings.ini", "game/a.txt"]
        );
        assert!(staged(&config).is_empty());

        // The hidden unit alone changes and still reaches the merged archive.
        write_file(dir.path(), "library/.config/settings.ini", b"volume=7");
        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.backed_up(), &vec![".config"]);
        assert!(staged(&config).is_empty());
        let restored = dir.path().join("restored");
        TarArchiver::new(fast_xz())
            .extract(&config.backup_dir().join("library.tar.xz"), &restored)
            .unwrap();
        assert_eq!(
            std::fs::read(restored.join(".config/settings.ini")).unwrap(),
            b"volume=7"
        );
    }

    #[test]
    fn test_verbatim_files_merged_uncompressed() {
        let dir = TempDir::new().unwrap();
        let clip: Vec<u8> = (0..40_000u32).map(|i| (i * 17 % 251) as u8).collect();
        write_file(dir.path(), "library/media/clip.mp4", &clip);
        write_file(dir.path(), "library/media/notes.txt", b"notes");
        write_file(dir.path(), "library/game/a.txt", b"alpha");
        let config = config(dir.path());
        let store = config.backup_dir().join("library.store.tar");

        pipeline(&config).run().unwrap();
        assert_eq!(merged_entries(&config), vec!["game/a.txt", "media/notes.txt"]);
        assert_eq!(
            list_entries(&store, &CompressorConfig::None).unwrap(),
            vec!["media/clip.mp4"]
        );
        let raw = std::fs::read(&store).unwrap();
        assert!(raw.windows(clip.len()).any(|w| w == clip.as_slice()));

        // Carried forward untouched when another unit changes.
        write_file(dir.path(), "library/game/b.txt", b"beta");
        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.backed_up(), &vec!["game"]);
        let raw = std::fs::read(&store).unwrap();
        assert!(raw.windows(clip.len()).any(|w| w == clip.as_slice()));
        assert_eq!(
            merged_entries(&config),
            vec!["game/a.txt", "game/b.txt", "media/notes.txt"]
        );
    }

    #[test]
    fn test_same_container_merge_stores_verbatim() {
        let dir = TempDir::new().unwrap();
        let clip: Vec<u8> = (0..40_000u32).map(|i| (i * 19 % 251) as u8).collect();
        write_file(dir.path(), "library/media/clip.mp4", &clip);
        write_file(dir.path(), "library/game/a.txt", b"alpha");
        let config = BackupConfig::builder()
            .source(dir.path().join("library"))
            .destination(dir.path().join("out"))
            .strategy(Strategy::SplitMerge)
            .archiver(fast_xz())
            .verbatim_placement(VerbatimPlacement::SameContainer)
            .build();

        pipeline(&config).run().unwrap();
        let merged = config.backup_dir().join("library.tar");
        assert_eq!(
            list_entries(&merged, &CompressorConfig::None).unwrap(),
            vec!["game/a.txt", "media/clip.mp4"]
        );
        let raw = std::fs::read(&merged).unwrap();
        assert!(raw.windows(clip.len()).any(|w| w == clip.as_slice()));

        let restored = dir.path().join("restored");
        crate::backup::restore::restore(&merged, &restored).unwrap();
        assert_eq!(std::fs::read(restored.join("game/a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(restored.join("media/clip.mp4")).unwrap(), clip);
    }

    #[test]
    fn test_unreadable_file_fails_only_its_unit() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "library/game/a.txt", b"alpha");
        write_file(dir.path(), "library/saves/s1", b"save one");
        write_file(dir.path(), "library/saves/s2", b"save two");
        write_file(dir.path(), "library/readme.md", b"readme");
        let config = config(dir.path());
        let pipeline = pipeline(&config);
        let backup_dir = config.backup_dir();
        std::fs::create_dir_all(&backup_dir).unwrap();

        let units = pipeline.scan_units(config.source(), &backup_dir).unwrap();
        // Gone between the scan and the fingerprint.
        std::fs::remove_file(dir.path().join("library/saves/s2")).unwrap();
        let mut metadata = MetadataStore::load(config.metadata_path());
        let mut summary = BackupSummary::new(chrono::Utc::now());
        pipeline
            .run_split_merge(units, &backup_dir, &mut metadata, &mut summary)
            .unwrap();

        let mut backed_up = summary.backed_up().clone();
        backed_up.sort();
        assert_eq!(backed_up, vec!["game", "readme.md"]);
        assert!(summary.is_failed("saves"));
        assert!(summary.failed()[0].message().contains("Hashing"));
        assert_eq!(merged_entries(&config), vec!["game/a.txt", "readme.md"]);
        assert!(staged(&config).is_empty());
        let metadata = MetadataStore::load(config.metadata_path());
        assert!(metadata.get("saves").is_none());
        assert_eq!(metadata.len(), 2);
    }

    #[test]
    fn test_removed_and_emptied_units_are_dropped() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "library/game/a.txt", b"alpha");
        write_file(dir.path(), "library/old/x.txt", b"old");
        write_file(dir.path(), "library/saves/s1", b"save");
        let config = config(dir.path());
        pipeline(&config).run().unwrap();
        assert_eq!(
            merged_entries(&config),
            vec!["game/a.txt", "old/x.txt", "saves/s1"]
        );

        // Nothing changed in the units that are left, the merge still runs.
        std::fs::remove_dir_all(dir.path().join("library/old")).unwrap();
        std::fs::remove_file(dir.path().join("library/saves/s1")).unwrap();
        let summary = pipeline(&config).run().unwrap();
        assert_eq!(summary.up_to_date(), &vec!["game"]);
        assert_eq!(summary.skipped_empty(), &vec!["saves"]);
        assert_eq!(merged_entries(&config), vec!["game/a.txt"]);
        let metadata = MetadataStore::load(config.metadata_path());
        assert_eq!(metadata.len(), 1);
        assert!(metadata.get("game").is_some());

        // Once in sync, an unchanged run leaves the merged archive alone.
        let summary = pipeline(&config).run().unwrap();
        assert!(summary.archives().is_empty());
    }

    #[test]
    fn test_cancelled_before_merge() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "library/game/a.txt", b"alpha");
        let config = config(dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();
        let pipeline =
            BackupPipeline::new(config.clone(), Arc::new(NoopObserver), cancel).unwrap();

        assert!(matches!(pipeline.run(), Err(Error::Cancelled)));
        assert!(!config.backup_dir().join("library.tar.xz").exists());
        assert!(staged(&config).is_empty());
        assert!(MetadataStore::load(config.metadata_path()).is_empty());
    }
}
