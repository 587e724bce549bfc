use crate::backup::result_error::{AddFunctionName, AddMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    StripPrefix(#[from] std::path::StripPrefixError),
    #[error(transparent)]
    Glob(#[from] globset::Error),
    #[error("Source path not found: {0:?}")]
    NotFound(PathBuf),
    #[error("Hashing {path:?} failed: {source}")]
    HashFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Archiving unit {unit:?} failed:\n{}", indent::indent_all_with("  ", .error.to_string()))]
    CompressionFailure { unit: String, error: Box<Error> },
    #[error("Unit {unit:?} would be archived as {container:?}, which belongs to unit {owner:?}")]
    ContainerCollision {
        unit: String,
        owner: String,
        container: String,
    },
    #[error("Merging archives failed:\n{}", indent::indent_all_with("  ", .0.to_string()))]
    MergeFailure(Box<Error>),
    #[error("Backup cancelled")]
    Cancelled,
    #[error("{}:\n{}", .msg, indent::indent_all_with("  ", .error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", .fn_name, indent::indent_all_with("  ", .error.to_string()))]
    WithFnName { fn_name: String, error: Box<Error> },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Self::WithFnName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Strips context wrappers and returns the error that actually happened.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. } | Error::WithFnName { error, .. } => error.root(),
            e => e,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self.root() {
            Error::Cancelled => true,
            Error::CompressionFailure { error, .. } | Error::MergeFailure(error) => {
                error.is_cancelled()
            }
            Error::LotsOfError(v) => v.iter().any(Error::is_cancelled),
            _ => false,
        }
    }

    pub fn compression_failure<S: Into<String>>(unit: S, error: Error) -> Error {
        if error.is_cancelled() {
            return error;
        }
        Error::CompressionFailure {
            unit: unit.into(),
            error: Box::new(error),
        }
    }
}
