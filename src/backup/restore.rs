//! Unpacking containers written by the pipeline.

use crate::backup::archive::INCOMPLETE_PREFIX;
use crate::backup::compress::CompressorConfig;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::scan::top_level_entries;
use crate::backup::tar::{extract_container, list_entries};
use crate::backup::validate::validate_dir_exist;
use function_name::named;
use std::path::{Path, PathBuf};

fn is_container(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    path.is_file()
        && !name.starts_with(INCOMPLETE_PREFIX)
        && (name.ends_with(".tar") || name.ends_with(".tar.xz"))
}

/// Unpacks one container into `destination`; the codec is picked from the file name.
#[named]
pub fn restore<P1: AsRef<Path>, P2: AsRef<Path>>(archive: P1, destination: P2) -> Result<()> {
    let archive = archive.as_ref();
    if !archive.is_file() {
        return Err(Error::NotFound(archive.to_path_buf()));
    }
    let compressor = CompressorConfig::detect(archive);
    tracing::info!("Restoring {:?} into {:?}", archive, destination.as_ref());
    extract_container(archive, &compressor, destination).add_fn_name(function_path!())
}

/// Unpacks every container of a backup directory into `destination`, in name order.
/// Returns the containers that were restored.
pub fn restore_backup_dir<P1: AsRef<Path>, P2: AsRef<Path>>(
    backup_dir: P1,
    destination: P2,
) -> Result<Vec<PathBuf>> {
    let backup_dir = backup_dir.as_ref();
    validate_dir_exist(backup_dir).map_err(|_| Error::NotFound(backup_dir.to_path_buf()))?;
    let containers: Vec<PathBuf> = top_level_entries(backup_dir)?
        .into_iter()
        .filter(|p| is_container(p))
        .collect();
    for container in &containers {
        restore(container, destination.as_ref())
            .add_msg(format!("Restoring {:?} failed", container))?;
    }
    Ok(containers)
}

/// Entry names stored in a container.
pub fn contents<P: AsRef<Path>>(archive: P) -> Result<Vec<String>> {
    let archive = archive.as_ref();
    list_entries(archive, &CompressorConfig::detect(archive))
}
