use crate::backup::classify::SkipExtensions;
use crate::backup::compress::CompressorConfig;
use crate::backup::fingerprint::DEFAULT_CHUNK_SIZE;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::scan::{build_exclude_set, CustomDeserializedGlob};
use crate::backup::validate::{validate_chunk_size, validate_writable_dir};
use bon::Builder;
use getset::Getters;
use globset::GlobSet;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use validator::Validate;

/// How changed units are turned into containers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One container (plus optional side container) per changed unit.
    #[default]
    Single,
    /// Units are archived in parallel into staging containers, then merged into one
    /// container for the whole source.
    SplitMerge,
}

/// Where files from the verbatim bucket go in the single-archive strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum VerbatimPlacement {
    /// A separate store-only container next to the compressed one.
    #[default]
    SideContainer,
    /// Stored uncompressed in the unit's main container, a plain TAR whose other
    /// entries are compressed one by one.
    SameContainer,
}

/// Folder name Steam gives a library on a secondary drive.
static STEAM_LIBRARY: &str = "SteamLibrary";

/// Files below this size are stored as is when the source is a single file.
pub static DEFAULT_FILE_STORE_BELOW: u64 = 100 * 1024 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "location", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum MetadataLocation {
    /// `<destination>/<source name>_backup/<source name>_meta.json`
    #[default]
    Destination,
    Custom { path: PathBuf },
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct BackupConfig {
    #[builder(into)]
    source: PathBuf,
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    destination: PathBuf,
    #[serde(default)]
    #[builder(default)]
    strategy: Strategy,
    #[serde(default)]
    #[validate(nested)]
    #[builder(default)]
    archiver: CompressorConfig,
    #[serde(default)]
    #[builder(default)]
    verbatim_placement: VerbatimPlacement,
    #[serde(default)]
    #[builder(default)]
    skip_extensions: SkipExtensions,
    #[serde(default)]
    #[builder(default)]
    exclude: Vec<CustomDeserializedGlob>,
    #[validate(range(min = 1))]
    workers: Option<usize>,
    #[serde(default = "default_chunk_size")]
    #[validate(range(min = 4096), custom(function = validate_chunk_size))]
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    #[serde(default)]
    #[builder(default)]
    metadata: MetadataLocation,
    /// Back up `steamapps/common` when the source is a Steam library folder.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    steam_library: bool,
    /// Single-file sources smaller than this many bytes skip the codec; 0 turns it off.
    #[serde(default = "default_file_store_below")]
    #[builder(default = DEFAULT_FILE_STORE_BELOW)]
    file_store_below: u64,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_file_store_below() -> u64 {
    DEFAULT_FILE_STORE_BELOW
}

impl BackupConfig {
    /// Reads and validates a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: BackupConfig = serde_yml::from_reader(File::open(path)?)
            .map_err(Error::from)
            .add_msg(format!("Parse YAML config failed: {:?}", path))?;
        config
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Config validation failed: {:?}", path))?;
        Ok(config)
    }

    /// Base name of the source, used for the backup directory and merged archive.
    pub fn source_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string())
    }

    /// Directory whose entries become units.
    ///
    /// A `SteamLibrary` source holding `steamapps/common` is backed up from there, where
    /// the games live. Names and the metadata location still follow `source`.
    pub fn effective_source(&self) -> PathBuf {
        if self.steam_library && self.source_name() == STEAM_LIBRARY {
            let games = self.source.join("steamapps").join("common");
            if games.is_dir() {
                return games;
            }
            tracing::debug!("{:?} has no steamapps/common, backing it up as is", self.source);
        }
        self.source.clone()
    }

    /// Size limit under which a single-file source is stored instead of compressed.
    pub fn file_store_limit(&self) -> Option<u64> {
        (self.file_store_below > 0).then_some(self.file_store_below)
    }

    /// `<destination>/<source name>_backup`
    pub fn backup_dir(&self) -> PathBuf {
        self.destination.join(format!(
            "{}_backup",
            sanitize_filename::sanitize(self.source_name())
        ))
    }

    pub fn metadata_path(&self) -> PathBuf {
        match &self.metadata {
            MetadataLocation::Destination => self.backup_dir().join(format!(
                "{}_meta.json",
                sanitize_filename::sanitize(self.source_name())
            )),
            MetadataLocation::Custom { path } => path.clone(),
        }
    }

    pub fn exclude_set(&self) -> Result<GlobSet> {
        build_exclude_set(&self.exclude)
    }

    pub fn build_thread_pool(&self) -> Result<ThreadPool> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("backup-worker-{i}"));
        if let Some(workers) = self.workers {
            builder = builder.num_threads(workers);
        }
        Ok(builder.build()?)
    }
}
