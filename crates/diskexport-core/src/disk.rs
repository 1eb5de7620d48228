//! Disk descriptors handed to the exporter.

use crate::error::{Error, Result};
use crate::paths::expand_env;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of disk, as recorded when the disk was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskType {
    /// A plain image file.
    File,
    /// A blank disk created for the VM.
    Empty,
    /// A layer created on top of a template image.
    Template,
}

impl DiskType {
    /// Name used in disk specs.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::File => "file",
            DiskType::Empty => "empty",
            DiskType::Template => "template",
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(DiskType::File),
            "empty" => Ok(DiskType::Empty),
            "template" => Ok(DiskType::Template),
            other => Err(Error::UnsupportedDiskType {
                disk_type: other.to_string(),
            }),
        }
    }
}

/// A disk to export. Never modified by the exporter.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskDescriptor {
    /// Path of the source image, with environment references already resolved.
    pub path: PathBuf,
    /// Disk type, which selects the export variant.
    pub disk_type: DiskType,
    /// Image format, passed to the sparsify step.
    pub format: String,
    /// Provenance recorded when the disk was created.
    pub metadata: Map<String, Value>,
}

impl DiskDescriptor {
    /// Describe a disk with empty provenance metadata.
    pub fn new(path: impl Into<PathBuf>, disk_type: DiskType, format: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            disk_type,
            format: format.into(),
            metadata: Map::new(),
        }
    }

    /// Attach provenance metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Basename of the source image, which is also the exported file name.
    pub fn name(&self) -> Result<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::invalid_descriptor(format!(
                    "disk path '{}' has no file name",
                    self.path.display()
                ))
            })
    }
}

/// A disk entry as found in a VM's disk list.
///
/// ```json
/// {"path": "$WORKDIR/disks/root.qcow2", "type": "template", "format": "qcow2",
///  "metadata": {"distro": "el9"}}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DiskSpec {
    /// Image path, possibly containing `$VAR` references.
    pub path: String,
    /// Disk type name; validated when converted to a descriptor.
    #[serde(rename = "type")]
    pub disk_type: String,
    /// Image format.
    pub format: String,
    /// Provenance metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DiskSpec {
    /// Resolve environment references and the disk type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedDiskType`] for unknown disk types.
    pub fn into_descriptor(self) -> Result<DiskDescriptor> {
        let disk_type = self.disk_type.parse()?;
        Ok(DiskDescriptor {
            path: PathBuf::from(expand_env(&self.path)),
            disk_type,
            format: self.format,
            metadata: self.metadata,
        })
    }
}

/// Load a JSON array of disk specs.
pub fn load_disk_specs(path: &Path) -> Result<Vec<DiskSpec>> {
    let content = fs::read(path).map_err(|e| Error::io(e, path))?;
    serde_json::from_slice(&content).map_err(|e| {
        Error::metadata(format!("invalid disk spec file '{}': {e}", path.display()))
    })
}
