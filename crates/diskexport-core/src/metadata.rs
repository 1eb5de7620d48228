//! Export metadata written next to each exported image.
//!
//! The `.metadata` sidecar is a flat JSON object: the provenance copied from
//! the source disk plus the fields the export adds.
//!
//! ```json
//! {"base": "el9-base.qcow2", "distro": "el9", "name": "root.qcow2",
//!  "sha1": "2fd4e1c67a2d28fced849ee1bb76e7391b93eb12", "size": 1073741824,
//!  "version": "20240612.0"}
//! ```

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Metadata key for the image size in bytes.
pub const SIZE_KEY: &str = "size";
/// Metadata key for the image file name.
pub const NAME_KEY: &str = "name";
/// Metadata key for the export version stamp.
pub const VERSION_KEY: &str = "version";
/// Metadata key for the backing image a layered export depends on.
pub const BASE_KEY: &str = "base";
/// Value of [`BASE_KEY`] for images without a backing file dependency.
pub const NO_BASE: &str = "None";

/// Version stamp for an export made on `date`: one version per calendar day.
pub fn version_stamp(date: NaiveDate) -> String {
    date.format("%Y%m%d.0").to_string()
}

/// Version stamp for an export made today (local time).
pub fn current_version() -> String {
    version_stamp(Local::now().date_naive())
}

/// The metadata mapping accumulated during an export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportMetadata {
    fields: Map<String, Value>,
}

impl ExportMetadata {
    /// Seed from the source disk's provenance. The map is copied, so the
    /// descriptor it came from is never affected by enrichment.
    pub fn from_source(source: &Map<String, Value>) -> Self {
        Self {
            fields: source.clone(),
        }
    }

    /// Set an arbitrary field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Recorded image size.
    pub fn size(&self) -> Option<u64> {
        self.fields.get(SIZE_KEY).and_then(Value::as_u64)
    }

    /// Record the digest under the algorithm's name.
    pub fn set_checksum(&mut self, algorithm: ChecksumAlgorithm, digest: &str) {
        self.insert(algorithm.name(), digest);
    }

    /// Recorded digest for `algorithm`.
    pub fn checksum(&self, algorithm: ChecksumAlgorithm) -> Option<&str> {
        self.get_str(algorithm.name())
    }

    /// The first supported checksum algorithm with a recorded digest.
    pub fn checksum_algorithm(&self) -> Option<ChecksumAlgorithm> {
        ChecksumAlgorithm::ALL
            .into_iter()
            .find(|alg| self.fields.contains_key(alg.name()))
    }

    /// All fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Serialize to `path`, replacing any existing file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::io(e, path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.fields)
            .map_err(|e| Error::metadata(format!("failed to encode metadata: {e}")))?;
        writer.flush().map_err(|e| Error::io(e, path))?;
        Ok(())
    }

    /// Read a `.metadata` sidecar.
    pub fn read_from(path: &Path) -> Result<Self> {
        let content = fs::read(path).map_err(|e| Error::io(e, path))?;
        serde_json::from_slice(&content).map_err(|e| {
            Error::metadata(format!("invalid metadata file '{}': {e}", path.display()))
        })
    }
}
