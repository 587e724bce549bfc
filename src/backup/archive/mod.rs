use crate::backup::result_error::result::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name prefix of containers that are still being written.
pub static INCOMPLETE_PREFIX: &str = ".incomplete-";

/// Hex digits of the raw-name digest appended to a rewritten stem.
const STEM_DIGEST_LEN: usize = 8;

/// Container writer the pipeline hands its buckets to.
///
/// A handle writes to a temporary file beside the target; only
/// [`close`](Archiver::close) makes the container visible under its final name.
/// Dropping a handle without closing it discards the partial container.
pub trait Archiver: Send + Sync {
    type Handle: Send;

    fn open(&self, container_path: &Path) -> Result<Self::Handle>;

    /// Writes an entry through the archiver's codec.
    fn write_entry(
        &self,
        handle: &mut Self::Handle,
        source_path: &Path,
        archive_name: &str,
    ) -> Result<()>;

    /// Writes an entry whose bytes must land in the container unchanged.
    ///
    /// Archivers that cannot keep a single entry out of their codec return an error.
    fn write_stored_entry(
        &self,
        handle: &mut Self::Handle,
        source_path: &Path,
        archive_name: &str,
    ) -> Result<()>;

    /// Finishes the container and renames it to its final path, which is returned.
    fn close(&self, handle: Self::Handle) -> Result<PathBuf>;

    /// Unpacks a container produced by this archiver into `destination`.
    fn extract(&self, container_path: &Path, destination: &Path) -> Result<()>;

    /// File name suffix of the produced containers, e.g. `tar.xz`.
    fn container_ext(&self) -> Arc<str>;

    fn container_path(&self, dir: &Path, stem: &str) -> PathBuf {
        dir.join(format!("{}.{}", container_stem(stem), self.container_ext()))
    }
}

/// File name stem used for the container of `name`.
///
/// Names that are safe file names are used as is. Anything the sanitizer would
/// change, and names starting with a dot, get the sanitized name followed by `~` and
/// a short digest of the raw name. Distinct names therefore never share a stem, and a
/// stem never looks like a hidden temp file of the pipeline.
pub fn container_stem(name: &str) -> String {
    let sanitized = sanitize_filename::sanitize(name);
    if sanitized == name && !name.starts_with('.') {
        return sanitized;
    }
    let digest = blake3::hash(name.as_bytes()).to_hex();
    format!(
        "{}~{}",
        sanitized.trim_start_matches('.'),
        &digest.as_str()[..STEM_DIGEST_LEN]
    )
}
