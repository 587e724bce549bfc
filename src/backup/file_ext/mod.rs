use std::sync::Arc;

/// Suffix (without the leading dot) that a writer layer adds to file names.
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}
