//! Splits files into a compress bucket and a verbatim bucket by extension.

use crate::backup::unit::FileUnit;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Already-compressed formats: recompressing them costs CPU and saves nothing.
static DEFAULT_SKIP_EXTENSIONS: &[&str] = &[
    // video
    "mp4", "mkv", "avi", "mov", "webm", "wmv", "flv", "m4v", "bik", "bk2", "usm",
    // audio
    "mp3", "aac", "ogg", "opus", "flac", "m4a", "wma",
    // images
    "jpg", "jpeg", "png", "gif", "webp", "heic", "avif",
    // archives
    "zip", "7z", "rar", "gz", "tgz", "bz2", "xz", "zst", "lz4", "cab", "jar", "apk",
    // documents
    "pdf", "docx", "xlsx", "pptx", "epub",
];

/// Set of lower-case extensions routed to the verbatim bucket.
///
/// Entries may be written with or without the leading dot and in any case.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SkipExtensions {
    extensions: BTreeSet<String>,
}

impl Default for SkipExtensions {
    fn default() -> Self {
        DEFAULT_SKIP_EXTENSIONS.iter().copied().collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for SkipExtensions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            extensions: iter
                .into_iter()
                .map(|e| normalize(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }
}

impl From<Vec<String>> for SkipExtensions {
    fn from(value: Vec<String>) -> Self {
        value.into_iter().collect()
    }
}

impl From<SkipExtensions> for Vec<String> {
    fn from(value: SkipExtensions) -> Self {
        value.extensions.into_iter().collect()
    }
}

fn normalize(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

impl SkipExtensions {
    pub fn contains(&self, ext: &str) -> bool {
        self.extensions.contains(&normalize(ext))
    }

    /// True when `path` has an extension in the set. Files without one are compressible.
    pub fn is_verbatim<P: AsRef<Path>>(&self, path: P) -> bool {
        path.as_ref()
            .extension()
            .map(|e| self.contains(&e.to_string_lossy()))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

/// Pairing of archive entry name and the file it comes from.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct ClassifiedEntry {
    name: String,
    source: PathBuf,
}

impl ClassifiedEntry {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(name: S, source: P) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

impl From<&FileUnit> for ClassifiedEntry {
    fn from(file: &FileUnit) -> Self {
        Self::new(file.entry_name(), file.path())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Classification {
    compress: Vec<ClassifiedEntry>,
    verbatim: Vec<ClassifiedEntry>,
}

impl Classification {
    pub fn len(&self) -> usize {
        self.compress.len() + self.verbatim.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(compress, verbatim)`
    pub fn into_buckets(self) -> (Vec<ClassifiedEntry>, Vec<ClassifiedEntry>) {
        (self.compress, self.verbatim)
    }
}

/// Routes each file to the verbatim bucket when its extension is in `policy`,
/// to the compress bucket otherwise. Input order is kept within each bucket.
pub fn classify<'a, I: IntoIterator<Item = &'a FileUnit>>(
    files: I,
    policy: &SkipExtensions,
) -> Classification {
    let (verbatim, compress): (Vec<_>, Vec<_>) = files
        .into_iter()
        .map(|f| (policy.is_verbatim(f.relative()), ClassifiedEntry::from(f)))
        .partition(|(verbatim, _)| *verbatim);

    Classification {
        compress: compress.into_iter().map(|(_, e)| e).collect(),
        verbatim: verbatim.into_iter().map(|(_, e)| e).collect(),
    }
}

/// Routes every file to the verbatim bucket, whatever its extension.
pub fn store_all<'a, I: IntoIterator<Item = &'a FileUnit>>(files: I) -> Classification {
    Classification {
        compress: Vec::new(),
        verbatim: files.into_iter().map(ClassifiedEntry::from).collect(),
    }
}
