//! Compression of exported images.
//!
//! Exported images are compressed in independent blocks so consumers can
//! decompress them in parallel and seek to a block boundary. `xz` is driven
//! as an external tool (see [`crate::tools::SystemTools`]); gzip output is
//! produced in-process here.

use crate::error::{Error, Result};
use crate::image::ImageReader;
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Block size used when compressing exported images (16 MiB).
pub const COMPRESSION_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Output format of the compression step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionFormat {
    /// xz with fixed block size, via the `xz` binary.
    #[default]
    Xz,
    /// Multi-member gzip, one member per block, compressed in-process.
    Gzip,
}

impl CompressionFormat {
    /// File extension appended to the compressed image.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionFormat::Xz => "xz",
            CompressionFormat::Gzip => "gz",
        }
    }

    /// Path of the compressed form of `path`.
    pub fn compressed_path(&self, path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(self.extension());
        PathBuf::from(name)
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionFormat::Xz => write!(f, "xz"),
            CompressionFormat::Gzip => write!(f, "gzip"),
        }
    }
}

/// Compress one block into a complete gzip member.
pub fn compress_block(data: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), level);
    encoder
        .write_all(data)
        .map_err(|e| Error::tool("gzip", format!("failed to compress block: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::tool("gzip", format!("failed to finish block: {e}")))
}

/// Compress `path` into `<path>.gz`, leaving the input in place.
///
/// Blocks of `block_size` bytes are compressed in parallel and written in
/// order. Concatenated gzip members decode as a single stream, so the output
/// is readable by any gzip implementation. A partially written output is
/// removed before the error is returned.
pub fn gzip_file(path: &Path, block_size: usize) -> Result<PathBuf> {
    if block_size == 0 {
        return Err(Error::tool("gzip", "block size must be non-zero"));
    }

    let output = CompressionFormat::Gzip.compressed_path(path);
    let reader = ImageReader::open(path)?;

    let mut members: Vec<Vec<u8>> = reader
        .data()
        .par_chunks(block_size)
        .map(|block| compress_block(block, Compression::best()))
        .collect::<Result<Vec<_>>>()?;

    // An empty input still needs one member to be a valid gzip file.
    if members.is_empty() {
        members.push(compress_block(&[], Compression::best())?);
    }

    tracing::debug!(
        input = %path.display(),
        blocks = members.len(),
        "writing gzip members"
    );

    if let Err(e) = write_members(&output, &members) {
        let _ = fs::remove_file(&output);
        return Err(e);
    }

    Ok(output)
}

fn write_members(output: &Path, members: &[Vec<u8>]) -> Result<()> {
    let file = File::create(output).map_err(|e| Error::io(e, output))?;
    let mut writer = BufWriter::new(file);
    for member in members {
        writer.write_all(member).map_err(|e| Error::io(e, output))?;
    }
    writer.flush().map_err(|e| Error::io(e, output))?;
    Ok(())
}
