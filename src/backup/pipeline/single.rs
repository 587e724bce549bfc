use crate::backup::archive::Archiver;
use crate::backup::backup_config::VerbatimPlacement;
use crate::backup::change::needs_backup;
use crate::backup::classify::{classify, store_all, Classification, ClassifiedEntry};
use crate::backup::metadata::MetadataStore;
use crate::backup::pipeline::summary::BackupSummary;
use crate::backup::pipeline::{remove_path, BackupPipeline, ScannedUnit};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{join_results, Result};
use crate::backup::result_error::AddMsg;
use crate::backup::unit::{BackupUnit, UnitState};
use std::path::{Path, PathBuf};

impl<A: Archiver> BackupPipeline<A> {
    /// Units are handled one after another; hashing and the two container writes of a
    /// unit run on the pool.
    ///
    /// A single file smaller than `store_below` bytes is stored whatever its extension.
    pub(super) fn run_single(
        &self,
        units: Vec<ScannedUnit>,
        store_below: Option<u64>,
        backup_dir: &Path,
        metadata: &mut MetadataStore,
        summary: &mut BackupSummary,
    ) -> Result<()> {
        for (name, unit) in units {
            self.cancel.check()?;
            let unit = match unit {
                Ok(unit) => unit,
                Err(e) => {
                    self.fail(summary, &name, e);
                    continue;
                }
            };
            self.observer.on_unit_started(&name, unit.files().len());
            if unit.is_empty() {
                self.skip_empty(summary, &name);
                continue;
            }

            let digest = match self.fingerprint(&unit) {
                Ok(Some(digest)) => digest,
                Ok(None) => {
                    self.skip_empty(summary, &name);
                    continue;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    self.fail(summary, &name, e);
                    continue;
                }
            };
            tracing::debug!("{name} fingerprint {digest}");

            if !needs_backup(&name, &digest, metadata) {
                self.complete(summary, &name, UnitState::UpToDate);
                continue;
            }

            let classification = match (&unit, store_below) {
                (BackupUnit::File(file), Some(limit)) if *file.size() < limit => {
                    tracing::debug!("{name} is below {limit} bytes, storing it as is");
                    store_all(unit.files())
                }
                _ => classify(unit.files(), self.config.skip_extensions()),
            };
            tracing::debug!(
                "{name}: {} files to compress, {} to store",
                classification.compress().len(),
                classification.verbatim().len()
            );
            match self.write_unit(&name, classification, backup_dir) {
                Ok(archives) => {
                    archives
                        .into_iter()
                        .for_each(|path| summary.record_archive(path));
                    metadata.record(name.as_str(), digest);
                    metadata
                        .save()
                        .add_msg(format!("Recording backup of {name} failed"))?;
                    self.complete(summary, &name, UnitState::MetadataUpdated);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => self.fail(summary, &name, Error::compression_failure(&name, e)),
            }
        }
        Ok(())
    }

    /// Writes the containers of one unit under `dir` and returns their paths.
    ///
    /// The compress bucket always goes through the codec and the verbatim bucket never
    /// does: it is either stored inside the main container or put in the side one.
    /// A container with nothing left to hold is removed, but only once the other one
    /// was written successfully.
    pub(super) fn write_unit(
        &self,
        name: &str,
        classification: Classification,
        dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let [main_path, side_path] = self.unit_containers(dir, name);
        let (compress, verbatim) = classification.into_buckets();

        let (main, side) = match self.config.verbatim_placement() {
            VerbatimPlacement::SameContainer => (
                self.write_bucket(&self.compressing, &main_path, name, &compress, &verbatim)?,
                None,
            ),
            VerbatimPlacement::SideContainer => {
                let (main, side) = self.pool.join(
                    || self.write_bucket(&self.compressing, &main_path, name, &compress, &[]),
                    || self.write_bucket(&self.storing, &side_path, name, &[], &verbatim),
                );
                join_results(main, side)?
            }
        };

        for (written, path) in [(&main, &main_path), (&side, &side_path)] {
            if written.is_none() && path.exists() {
                tracing::info!("Removing stale container {:?}", path);
                remove_path(path)?;
            }
        }
        Ok(main.into_iter().chain(side).collect())
    }

    fn write_bucket(
        &self,
        archiver: &A,
        target: &Path,
        unit: &str,
        compress: &[ClassifiedEntry],
        stored: &[ClassifiedEntry],
    ) -> Result<Option<PathBuf>> {
        if compress.is_empty() && stored.is_empty() {
            return Ok(None);
        }
        self.write_container(archiver, target, unit, compress, stored)
            .map(Some)
    }
}
