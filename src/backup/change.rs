use crate::backup::fingerprint::Digest;
use crate::backup::metadata::MetadataStore;
use derive_more::Display;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ChangeDecision {
    #[display("new")]
    New,
    #[display("modified")]
    Modified,
    #[display("unchanged")]
    Unchanged,
}

/// Compares a freshly computed digest against the last recorded one.
pub fn detect(previous: Option<&Digest>, current: &Digest) -> ChangeDecision {
    match previous {
        None => ChangeDecision::New,
        Some(previous) if previous == current => ChangeDecision::Unchanged,
        Some(_) => ChangeDecision::Modified,
    }
}

/// True iff `unit` has no record or its recorded digest differs from `current`.
pub fn needs_backup(unit: &str, current: &Digest, metadata: &MetadataStore) -> bool {
    detect(metadata.get(unit), current) != ChangeDecision::Unchanged
}
