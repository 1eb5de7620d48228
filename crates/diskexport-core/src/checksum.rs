//! Content digests for exported images.

use crate::error::{Error, Result};
use crate::image::ImageReader;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Amount of data fed to the hasher per update.
const DIGEST_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Digest algorithm used for the `.hash` sidecar.
///
/// The algorithm name doubles as the metadata key the digest is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChecksumAlgorithm {
    /// SHA-1, the historical default for exported templates.
    #[default]
    Sha1,
    /// SHA-256.
    Sha256,
}

impl ChecksumAlgorithm {
    /// Every supported algorithm.
    pub const ALL: [ChecksumAlgorithm; 2] = [ChecksumAlgorithm::Sha1, ChecksumAlgorithm::Sha256];

    /// Lowercase algorithm name, as used in metadata.
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    /// Length of the hex-encoded digest.
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha1 => 40,
            ChecksumAlgorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnsupportedChecksum {
                name: s.to_string(),
            })
    }
}

/// Compute the hex digest of a file.
pub fn digest_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let reader = ImageReader::open(path)?;
    Ok(match algorithm {
        ChecksumAlgorithm::Sha1 => hash_image::<Sha1>(&reader),
        ChecksumAlgorithm::Sha256 => hash_image::<Sha256>(&reader),
    })
}

/// Compute the hex digest of an in-memory buffer.
pub fn digest_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    match algorithm {
        ChecksumAlgorithm::Sha1 => hex::encode(Sha1::digest(data)),
        ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
    }
}

fn hash_image<D: Digest>(reader: &ImageReader) -> String {
    let mut hasher = D::new();
    for chunk in reader.chunks(DIGEST_CHUNK_SIZE) {
        hasher.update(chunk);
    }
    hex::encode(hasher.finalize())
}
