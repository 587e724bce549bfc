use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::unit::FileUnit;

use derive_more::{Display, From};
use dyn_iter::{DynIter, IntoDynIterator};
use function_name::named;
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use walkdir::{DirEntry, WalkDir};

use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::result;

/// A glob pattern wrapper that handles custom deserialization
///
/// Wraps `globset::Glob` so exclude patterns can be written as plain strings in the
/// config file. Literal separator mode is always on, so `*` never crosses a `/`.
#[derive(Clone, Debug, From, Display, Serialize, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct CustomDeserializedGlob {
    glob: Glob,
}

impl CustomDeserializedGlob {
    pub fn parse<S: AsRef<str>>(pattern: S) -> Result<Self> {
        Ok(GlobBuilder::new(pattern.as_ref())
            .literal_separator(true)
            .build()?
            .into())
    }
}

struct CustomGlobVisitor;

impl Visitor<'_> for CustomGlobVisitor {
    type Value = CustomDeserializedGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        CustomDeserializedGlob::parse(v).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for CustomDeserializedGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(CustomGlobVisitor)
    }
}

pub fn build_exclude_set(globs: &[CustomDeserializedGlob]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    globs.iter().for_each(|g| {
        builder.add(g.glob.clone());
    });
    Ok(builder.build()?)
}

/// Walks `root` and yields every regular file as a [`FileUnit`].
///
/// The unit's relative path is `base` joined with the path below `root`; exclude
/// patterns are matched against that relative path. Ordering is whatever the
/// filesystem returns, callers sort.
#[named]
pub fn scan_files<'a, P1: AsRef<Path>, P2: AsRef<Path>>(
    root: P1,
    base: P2,
    exclude: &GlobSet,
) -> Result<DynIter<'a, Result<FileUnit>>> {
    let root = root.as_ref().to_path_buf();
    if !root.is_dir() {
        tracing::error!("Scan root does not exist or is not a directory: {:?}", root);
        return Err(Error::NotFound(root));
    }

    tracing::debug!("Scanning directory {:?}", root);
    let base = base.as_ref().to_path_buf();
    let exclude = exclude.clone();
    let entries = WalkDir::new(&root)
        .follow_links(true)
        .into_iter()
        .filter_map(move |res| match res {
            Ok(de) => process_dir_entry(de, &root, &base, &exclude),
            Err(e) => Some(Err(e.into())),
        })
        .map(move |res| res.add_fn_name(function_path!()));

    Ok(entries.into_dyn_iter())
}

fn process_dir_entry(
    de: DirEntry,
    root: &Path,
    base: &Path,
    exclude: &GlobSet,
) -> Option<Result<FileUnit>> {
    if !de.file_type().is_file() {
        tracing::trace!("Skipping {:?} not a file", de.path());
        return None;
    }

    let relative = match de.path().strip_prefix(root) {
        Ok(stripped) => base.join(stripped),
        Err(e) => {
            return Some(Err(Error::from(e).add_msg(format!(
                "Stripping {:?} from {:?} failed",
                root,
                de.path()
            ))))
        }
    };

    if exclude.is_match(&relative) {
        tracing::debug!("Excluding {:?}", relative);
        return None;
    }

    let size = match de.metadata() {
        Ok(md) => md.len(),
        Err(e) => return Some(Err(e.into())),
    };

    let unit = FileUnit::new(de.into_path(), relative, size);
    tracing::trace!("Including file: {:?} -> {:?}", unit.path(), unit.relative());
    Some(Ok(unit))
}

/// Scans `root` and returns its files sorted by relative path.
///
/// The order is [`Path`] order, compared component by component, so `a/b` comes
/// before `a.txt`. Tree digests depend on it.
pub fn scan_sorted<P1: AsRef<Path>, P2: AsRef<Path>>(
    root: P1,
    base: P2,
    exclude: &GlobSet,
) -> Result<Vec<FileUnit>> {
    let mut files = scan_files(root, base, exclude)?.collect::<Result<Vec<_>>>()?;
    files.sort_unstable_by(|a, b| a.relative().cmp(b.relative()));
    Ok(files)
}

/// Lists the direct children of `root`, sorted by name.
pub fn top_level_entries<P: AsRef<Path>>(root: P) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(root.as_ref())?
        .map(|r| r.map(|de| de.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_unstable();
    Ok(entries)
}
