use crate::backup::archive::{Archiver, INCOMPLETE_PREFIX};
use crate::backup::compress::{Compressor, CompressorBuilder, CompressorConfig};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use itertools::Itertools;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, IntoInnerError, Read, Seek};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, UNIX_EPOCH};
use tempfile::NamedTempFile;

static TAR_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

static NO_CODEC: CompressorConfig = CompressorConfig::None;

/// PAX record naming the codec a single entry was encoded with.
pub static ENTRY_CODEC_KEY: &str = "INCR_BACKUP.codec";

type TarWriter = tar::Builder<BufWriter<Compressor<BufWriter<NamedTempFile>>>>;

/// Where the codec is applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Packing {
    /// The codec wraps the whole TAR stream.
    #[default]
    Stream,
    /// The TAR stream stays plain. Each compressed entry is encoded on its own and
    /// tagged with [`ENTRY_CODEC_KEY`], so stored entries can sit beside it untouched.
    PerEntry,
}

/// TAR containers, optionally wrapped in a codec.
///
/// With [`CompressorConfig::None`] this is the store-only realization: entry bytes are
/// copied into the container unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TarArchiver {
    compressor: CompressorConfig,
    packing: Packing,
}

pub struct TarHandle {
    builder: TarWriter,
    target: PathBuf,
    entries: usize,
}

impl TarArchiver {
    pub fn new(compressor: CompressorConfig) -> Self {
        Self {
            compressor,
            packing: Packing::Stream,
        }
    }

    pub fn store() -> Self {
        Self::new(CompressorConfig::None)
    }

    /// Plain TAR container whose entries are compressed one by one with `compressor`.
    pub fn per_entry(compressor: CompressorConfig) -> Self {
        Self {
            compressor,
            packing: Packing::PerEntry,
        }
    }

    pub fn compressor(&self) -> &CompressorConfig {
        &self.compressor
    }

    pub fn packing(&self) -> Packing {
        self.packing
    }

    /// Codec wrapped around the whole TAR stream.
    pub fn stream_codec(&self) -> &CompressorConfig {
        match self.packing {
            Packing::Stream => &self.compressor,
            Packing::PerEntry => &NO_CODEC,
        }
    }

    fn append_raw(handle: &mut TarHandle, source_path: &Path, archive_name: &str) -> Result<()> {
        handle
            .builder
            .append_path_with_name(source_path, archive_name)
            .map_err(Error::from)
            .add_msg(format!("Adding {:?} as {:?} failed", source_path, archive_name))
    }

    /// Encodes `source_path` into a scratch file next to the container, then appends it
    /// behind a PAX record naming the codec.
    fn append_encoded(
        &self,
        handle: &mut TarHandle,
        codec_ext: &str,
        source_path: &Path,
        archive_name: &str,
    ) -> Result<()> {
        let meta = std::fs::metadata(source_path)?;
        let scratch = tempfile::tempfile_in(parent_dir(&handle.target))?;
        let mut encoder = self.compressor.build_compressor(BufWriter::new(scratch))?;
        std::io::copy(&mut File::open(source_path)?, &mut encoder)?;
        let mut encoded = encoder
            .finish()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?;
        let size = encoded.stream_position()?;
        encoded.rewind()?;

        let mut header = tar::Header::new_gnu();
        header.set_metadata(&meta);
        header.set_size(size);
        handle
            .builder
            .append_pax_extensions([(ENTRY_CODEC_KEY, codec_ext.as_bytes())])?;
        handle.builder.append_data(&mut header, archive_name, encoded)?;
        tracing::trace!(
            "Encoded {:?} from {} to {} bytes",
            archive_name,
            meta.len(),
            size
        );
        Ok(())
    }
}

impl FileExtProvider for TarArchiver {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(
            std::iter::once(TAR_FILE_EXT.get_or_init(|| "tar".into()).clone())
                .chain(self.stream_codec().file_ext())
                .join(".")
                .into(),
        )
    }
}

impl Archiver for TarArchiver {
    type Handle = TarHandle;

    fn open(&self, container_path: &Path) -> Result<TarHandle> {
        let dir = parent_dir(container_path);
        std::fs::create_dir_all(&dir)?;

        let tmp = tempfile::Builder::new()
            .prefix(INCOMPLETE_PREFIX)
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        let mut builder = self
            .stream_codec()
            .build_compressor(BufWriter::new(tmp))
            .map(BufWriter::new)
            .map(tar::Builder::new)?;
        builder.follow_symlinks(true);

        tracing::debug!("Opened container {:?}", container_path);
        Ok(TarHandle {
            builder,
            target: container_path.to_path_buf(),
            entries: 0,
        })
    }

    fn write_entry(
        &self,
        handle: &mut TarHandle,
        source_path: &Path,
        archive_name: &str,
    ) -> Result<()> {
        match (self.packing, self.compressor.file_ext()) {
            (Packing::PerEntry, Some(codec_ext)) => self
                .append_encoded(handle, &codec_ext, source_path, archive_name)
                .add_msg(format!("Encoding {:?} as {:?} failed", source_path, archive_name))?,
            _ => Self::append_raw(handle, source_path, archive_name)?,
        }
        handle.entries += 1;
        tracing::trace!("Added {:?} to {:?}", archive_name, handle.target);
        Ok(())
    }

    fn write_stored_entry(
        &self,
        handle: &mut TarHandle,
        source_path: &Path,
        archive_name: &str,
    ) -> Result<()> {
        if self.stream_codec().file_ext().is_some() {
            return Err(Error::from(std::io::Error::new(
                ErrorKind::Unsupported,
                format!(
                    "{:?} cannot be stored as is in a stream compressed container",
                    archive_name
                ),
            )));
        }
        Self::append_raw(handle, source_path, archive_name)?;
        handle.entries += 1;
        tracing::trace!("Stored {:?} in {:?}", archive_name, handle.target);
        Ok(())
    }

    fn close(&self, handle: TarHandle) -> Result<PathBuf> {
        let TarHandle {
            builder,
            target,
            entries,
        } = handle;

        let tmp = builder
            .into_inner()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .finish()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;

        tracing::info!("Wrote container {:?} with {} entries", target, entries);
        Ok(target)
    }

    fn extract(&self, container_path: &Path, destination: &Path) -> Result<()> {
        extract_container(container_path, self.stream_codec(), destination)
    }

    fn container_ext(&self) -> Arc<str> {
        self.file_ext().unwrap_or_else(|| "tar".into())
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Unpacks a container whose whole stream went through `compressor`.
///
/// Entries tagged with [`ENTRY_CODEC_KEY`] are decoded after unpacking, so containers
/// of either [`Packing`] restore to the original bytes.
pub fn extract_container<P1: AsRef<Path>, P2: AsRef<Path>>(
    container_path: P1,
    compressor: &CompressorConfig,
    destination: P2,
) -> Result<()> {
    let container_path = container_path.as_ref();
    let destination = destination.as_ref();
    std::fs::create_dir_all(destination)?;

    let reader = compressor.build_decompressor(BufReader::new(File::open(container_path)?));
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_mtime(true);
    unpack_entries(&mut archive, destination).add_msg(format!(
        "Extracting {:?} into {:?} failed",
        container_path, destination
    ))
}

fn unpack_entries<R: Read>(archive: &mut tar::Archive<R>, destination: &Path) -> Result<()> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let codec = entry_codec(&mut entry)?;
        let relative: PathBuf = entry
            .path()?
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        let mtime = entry.header().mtime()?;
        if !entry.unpack_in(destination)? {
            continue;
        }
        if let Some(codec) = codec {
            decode_in_place(&destination.join(relative), &codec, mtime)?;
        }
    }
    Ok(())
}

fn entry_codec<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Option<CompressorConfig>> {
    let Some(extensions) = entry.pax_extensions()? else {
        return Ok(None);
    };
    for extension in extensions {
        let extension = extension?;
        if extension.key() != Ok(ENTRY_CODEC_KEY) {
            continue;
        }
        let ext = extension
            .value()
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        return match CompressorConfig::from_file_ext(ext) {
            Some(codec) => Ok(Some(codec)),
            None => Err(Error::from(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("Unknown entry codec {:?}", ext),
            ))),
        };
    }
    Ok(None)
}

/// Replaces an unpacked encoded entry with its decoded bytes.
fn decode_in_place(path: &Path, codec: &CompressorConfig, mtime: u64) -> Result<()> {
    let mut decoded = tempfile::Builder::new()
        .prefix(INCOMPLETE_PREFIX)
        .tempfile_in(parent_dir(path))?;
    {
        let mut reader = codec.build_decompressor(BufReader::new(File::open(path)?));
        std::io::copy(&mut reader, &mut decoded)?;
    }

    let permissions = std::fs::metadata(path)?.permissions();
    decoded.as_file().set_permissions(permissions)?;
    decoded
        .as_file()
        .set_modified(UNIX_EPOCH + Duration::from_secs(mtime))?;
    decoded.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Entry names of every regular file in a container, in stored order.
pub fn list_entries<P: AsRef<Path>>(
    container_path: P,
    compressor: &CompressorConfig,
) -> Result<Vec<String>> {
    let reader = compressor.build_decompressor(BufReader::new(File::open(container_path)?));
    let mut archive = tar::Archive::new(reader);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_file() {
            names.push(entry.path()?.to_string_lossy().to_string());
        }
    }
    Ok(names)
}
