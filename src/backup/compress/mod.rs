pub mod xz;

use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use derive_more::From;
use io_enum::{Read, Write};
use liblzma::read::XzDecoder;
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use std::io;
use std::result;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

#[derive(Write, From)]
pub enum Compressor<W: io::Write> {
    None(W),
    XzEncoder(XzEncoder<W>),
}

#[derive(Read, From)]
pub enum Decompressor<R: io::Read> {
    None(R),
    XzDecoder(XzDecoder<R>),
}

/// Codec applied on top of the TAR stream.
///
/// `None` is the store-only realization used for the verbatim bucket.
#[derive(Clone, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    None,
    Xz(xz::XzConfig),
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig::Xz(xz::XzConfig::default())
    }
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Xz(xz) => xz.validate(),
        }
    }
}

pub trait CompressorBuilder<W: io::Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: io::Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::XzEncoder(w) => w.finish(),
        }
    }
}

impl<W: io::Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Xz(xz) => xz.build_compressor(writer),
        }
        .add_msg(format!("Building compressor {:?} failed", self))
    }
}

impl CompressorConfig {
    pub fn build_decompressor<R: io::Read>(&self, reader: R) -> Decompressor<R> {
        match self {
            CompressorConfig::None => Decompressor::None(reader),
            CompressorConfig::Xz(_) => Decompressor::XzDecoder(XzDecoder::new_multi_decoder(reader)),
        }
    }

    /// Codec whose file extension is `ext`, e.g. `xz`.
    pub fn from_file_ext(ext: &str) -> Option<Self> {
        if ext.eq_ignore_ascii_case(&xz_file_ext()) {
            Some(CompressorConfig::Xz(xz::XzConfig::default()))
        } else {
            None
        }
    }

    /// Picks the codec a container was written with from its file name.
    pub fn detect<P: AsRef<std::path::Path>>(path: P) -> Self {
        let xz_ext = format!(".{}", xz_file_ext());
        let is_xz = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase().ends_with(xz_ext.as_str()))
            .unwrap_or(false);
        if is_xz {
            CompressorConfig::Xz(xz::XzConfig::default())
        } else {
            CompressorConfig::None
        }
    }
}

static XZ_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

fn xz_file_ext() -> Arc<str> {
    XZ_FILE_EXT.get_or_init(|| "xz".into()).clone()
}

impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Xz(_) => Some(xz_file_ext()),
        }
    }
}
