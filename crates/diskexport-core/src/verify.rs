//! Verification of an exported image against its sidecars.

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};
use crate::export::{HASH_SUFFIX, METADATA_SUFFIX};
use crate::metadata::ExportMetadata;
use crate::paths::with_suffix;
use crate::tools::DiskTools;
use std::fs;
use std::path::Path;

/// Outcome of [`verify_export`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Algorithm the export was digested with.
    pub algorithm: ChecksumAlgorithm,
    /// Digest stored in the `.hash` sidecar.
    pub hash_file_digest: String,
    /// Digest stored in the `.metadata` sidecar.
    pub metadata_digest: Option<String>,
    /// Digest of the image as it is now.
    pub actual_digest: String,
    /// Size stored in the metadata.
    pub recorded_size: Option<u64>,
    /// Size of the image as it is now.
    pub actual_size: u64,
}

impl VerifyReport {
    /// True if both sidecars agree with the image.
    pub fn is_valid(&self) -> bool {
        self.hash_file_digest == self.actual_digest
            && self.metadata_digest.as_deref() == Some(self.actual_digest.as_str())
            && self.recorded_size == Some(self.actual_size)
    }
}

/// Recompute the digest of an uncompressed exported image and compare it with
/// the `.hash` and `.metadata` sidecars next to it.
///
/// The algorithm is the one recorded in the metadata; if none is recorded it
/// is inferred from the length of the `.hash` digest.
pub fn verify_export(artifact: &Path, tools: &dyn DiskTools) -> Result<VerifyReport> {
    let hash_path = with_suffix(artifact, HASH_SUFFIX);
    let metadata_path = with_suffix(artifact, METADATA_SUFFIX);

    let hash_file_digest = fs::read_to_string(&hash_path)
        .map_err(|e| Error::io(e, &hash_path))?
        .trim()
        .to_string();
    let metadata = ExportMetadata::read_from(&metadata_path)?;

    let algorithm = metadata
        .checksum_algorithm()
        .or_else(|| {
            ChecksumAlgorithm::ALL
                .into_iter()
                .find(|alg| alg.hex_len() == hash_file_digest.len())
        })
        .ok_or_else(|| {
            Error::metadata(format!(
                "can not determine checksum algorithm for '{}'",
                artifact.display()
            ))
        })?;

    let actual_digest = tools.digest(artifact, algorithm)?;
    let actual_size = fs::metadata(artifact)
        .map_err(|e| Error::io(e, artifact))?
        .len();

    let report = VerifyReport {
        algorithm,
        metadata_digest: metadata.checksum(algorithm).map(str::to_string),
        hash_file_digest,
        actual_digest,
        recorded_size: metadata.size(),
        actual_size,
    };
    tracing::debug!(valid = report.is_valid(), "verified {}", artifact.display());
    Ok(report)
}
