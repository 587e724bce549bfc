//! Persistent `{unit name: digest}` record for one backup root.

use crate::backup::fingerprint::Digest;
use crate::backup::function_path;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use function_name::named;
use getset::Getters;
use std::collections::BTreeMap;
use std::io::{BufWriter, ErrorKind, IntoInnerError, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Default, PartialEq, Eq, Getters)]
pub struct MetadataStore {
    #[getset(get = "pub")]
    path: PathBuf,
    records: BTreeMap<String, Digest>,
}

impl MetadataStore {
    /// Loads the record at `path`.
    ///
    /// Never fails: a missing file yields an empty record, and so does a file that
    /// cannot be parsed, in which case every unit is backed up again.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let records = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, Digest>>(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(
                        "Metadata file {:?} is corrupt, running a full backup: {}",
                        path,
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!("Metadata file {:?} not found, starting fresh", path);
                BTreeMap::new()
            }
            Err(e) => {
                tracing::warn!(
                    "Metadata file {:?} unreadable, running a full backup: {}",
                    path,
                    e
                );
                BTreeMap::new()
            }
        };
        Self { path, records }
    }

    /// Writes the record next to its target and renames it into place, so a
    /// failed write leaves the previous file intact.
    #[named]
    pub fn save(&self) -> Result<()> {
        self.write_atomically()
            .add_msg(format!("Saving metadata {:?} failed", self.path))
            .add_fn_name(function_path!())
    }

    fn write_atomically(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let tmp = NamedTempFile::new_in(&dir)?;
        let mut writer = BufWriter::new(tmp);
        serde_json::to_writer_pretty(&mut writer, &self.records)?;
        writer.write_all(b"\n")?;
        let tmp = writer.into_inner().map_err(IntoInnerError::into_error)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        tracing::debug!("Saved {} metadata records to {:?}", self.records.len(), self.path);
        Ok(())
    }

    pub fn get(&self, unit: &str) -> Option<&Digest> {
        self.records.get(unit)
    }

    pub fn record<S: Into<String>>(&mut self, unit: S, digest: Digest) -> Option<Digest> {
        self.records.insert(unit.into(), digest)
    }

    pub fn remove(&mut self, unit: &str) -> Option<Digest> {
        self.records.remove(unit)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Digest)> {
        self.records.iter()
    }
}
