//! Export orchestrator for VM disk images.
//!
//! Exporting a disk runs a fixed sequence of steps:
//! 1. Copy the source image to the destination, keeping it sparse
//! 2. Sparsify the copy in place
//! 3. Rebase the copy onto a relative backing file, or merge its layers
//!    (template disks only)
//! 4. Write the digest to `<image>.hash`
//! 5. Add size, name, version (and base, for templates) to the metadata
//! 6. Write the metadata to `<image>.metadata`
//! 7. Compress the image, if requested
//!
//! A [`Rollback`] guard armed before step 1 removes the image and its
//! sidecars if any step fails, so a destination either holds a complete
//! export or nothing from this run.
//!
//! # Example
//!
//! ```no_run
//! use diskexport_core::disk::{DiskDescriptor, DiskType};
//! use diskexport_core::export::{DiskExporter, ExportOptions};
//! use diskexport_core::tools::SystemTools;
//! use std::path::Path;
//!
//! let disk = DiskDescriptor::new("/var/lib/vms/web/root.qcow2", DiskType::Template, "qcow2");
//! let tools = SystemTools::default();
//! let options = ExportOptions::new(true, false);
//!
//! let exporter = DiskExporter::for_disk(&disk, Path::new("/srv/templates"), &options, &tools).unwrap();
//! let exported = exporter.export().unwrap();
//! println!("{} ({})", exported.artifact.display(), exported.checksum);
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::checksum::ChecksumAlgorithm;
use crate::compress::COMPRESSION_BLOCK_SIZE;
use crate::disk::{DiskDescriptor, DiskType};
use crate::error::{Error, Result};
use crate::image::BackingChain;
use crate::metadata::{self, ExportMetadata, BASE_KEY, NAME_KEY, NO_BASE, SIZE_KEY, VERSION_KEY};
use crate::paths::with_suffix;
use crate::rollback::{remove_quietly, Rollback};
use crate::tools::DiskTools;

/// Suffix of the digest sidecar.
pub const HASH_SUFFIX: &str = ".hash";
/// Suffix of the metadata sidecar.
pub const METADATA_SUFFIX: &str = ".metadata";
/// Deepest backing chain a layered (non-standalone) export accepts.
pub const MAX_LAYERED_CHAIN_DEPTH: usize = 2;

/// Options for the export process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Compress the image after the sidecars are written.
    pub compress: bool,
    /// Merge template layers into a self-contained image.
    pub standalone: bool,
    /// Digest algorithm for the `.hash` sidecar.
    pub checksum: ChecksumAlgorithm,
}

impl ExportOptions {
    /// Create options with the default checksum algorithm.
    pub fn new(compress: bool, standalone: bool) -> Self {
        Self {
            compress,
            standalone,
            checksum: ChecksumAlgorithm::default(),
        }
    }

    /// Use a different checksum algorithm.
    pub fn with_checksum(mut self, checksum: ChecksumAlgorithm) -> Self {
        self.checksum = checksum;
        self
    }
}

/// Step of the export process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStep {
    /// Validating the export and creating the destination directory.
    Preparing,
    /// Copying the source image.
    Copying,
    /// Reclaiming unused space.
    Sparsifying,
    /// Rewriting the backing file pointer.
    Rebasing,
    /// Merging all backing layers into the image.
    Merging,
    /// Computing and writing the digest.
    Checksumming,
    /// Adding export fields to the metadata.
    UpdatingMetadata,
    /// Writing the metadata sidecar.
    WritingMetadata,
    /// Compressing the image.
    Compressing,
    /// Export complete.
    Complete,
}

impl fmt::Display for ExportStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportStep::Preparing => write!(f, "Preparing export"),
            ExportStep::Copying => write!(f, "Copying disk"),
            ExportStep::Sparsifying => write!(f, "Making disk sparse"),
            ExportStep::Rebasing => write!(f, "Rebasing"),
            ExportStep::Merging => write!(f, "Merging layered image with base"),
            ExportStep::Checksumming => write!(f, "Calculating checksum"),
            ExportStep::UpdatingMetadata => write!(f, "Updating metadata"),
            ExportStep::WritingMetadata => write!(f, "Writing metadata"),
            ExportStep::Compressing => write!(f, "Compressing disk"),
            ExportStep::Complete => write!(f, "Complete"),
        }
    }
}

/// Progress information passed to the progress callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportProgress {
    /// Step that is starting.
    pub step: ExportStep,
    /// Name of the disk being exported.
    pub disk: String,
    /// Current disk (1-indexed).
    pub current_disk: usize,
    /// Total number of disks in this run.
    pub total_disks: usize,
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Arc<dyn Fn(ExportProgress) + Send + Sync>;

/// Result of a successful export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedDisk {
    /// Path of the exported (uncompressed) image. It no longer exists when
    /// `compressed` is set.
    pub artifact: PathBuf,
    /// Path of the `.hash` sidecar.
    pub hash_file: PathBuf,
    /// Path of the `.metadata` sidecar.
    pub metadata_file: PathBuf,
    /// Path of the compressed image, if compression was requested.
    pub compressed: Option<PathBuf>,
    /// Digest algorithm used.
    pub algorithm: ChecksumAlgorithm,
    /// Digest of the uncompressed image.
    pub checksum: String,
    /// Size of the uncompressed image in bytes.
    pub size: u64,
    /// Metadata as written to the sidecar.
    pub metadata: ExportMetadata,
}

/// State of one export, created per call and discarded afterwards.
#[derive(Debug, Clone)]
pub struct ExportJob {
    source: PathBuf,
    format: String,
    name: String,
    dest_dir: PathBuf,
    dest: PathBuf,
    compress: bool,
    algorithm: ChecksumAlgorithm,
    metadata: ExportMetadata,
}

impl ExportJob {
    /// Prepare an export of `disk` into `dest_dir`.
    ///
    /// The disk's metadata is copied; enrichment only touches the copy.
    pub fn new(disk: &DiskDescriptor, dest_dir: &Path, options: &ExportOptions) -> Result<Self> {
        let name = disk.name()?;
        Ok(Self {
            source: disk.path.clone(),
            format: disk.format.clone(),
            dest: dest_dir.join(&name),
            name,
            dest_dir: dest_dir.to_path_buf(),
            compress: options.compress,
            algorithm: options.checksum,
            metadata: ExportMetadata::from_source(&disk.metadata),
        })
    }

    /// Source image path.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Basename of the exported image.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Destination directory.
    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    /// Destination image path.
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Path of the `.hash` sidecar.
    pub fn hash_path(&self) -> PathBuf {
        with_suffix(&self.dest, HASH_SUFFIX)
    }

    /// Path of the `.metadata` sidecar.
    pub fn metadata_path(&self) -> PathBuf {
        with_suffix(&self.dest, METADATA_SUFFIX)
    }

    /// Metadata accumulated so far.
    pub fn metadata(&self) -> &ExportMetadata {
        &self.metadata
    }
}

/// Disk-type specific part of the pipeline.
#[derive(Debug, Clone)]
enum Variant {
    /// `file` and `empty` disks: no backing chain.
    Plain,
    /// `template` disks: a layer over a backing chain.
    Template {
        standalone: bool,
        chain: BackingChain,
    },
}

/// Exports one disk.
///
/// Created with [`DiskExporter::for_disk`], which picks the pipeline variant
/// from the disk type, and consumed by [`DiskExporter::export`].
pub struct DiskExporter<'a> {
    job: ExportJob,
    variant: Variant,
    tools: &'a dyn DiskTools,
    progress: Option<ProgressCallback>,
    position: (usize, usize),
}

impl fmt::Debug for DiskExporter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskExporter")
            .field("job", &self.job)
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

impl<'a> DiskExporter<'a> {
    /// Resolve the pipeline variant for `disk`.
    ///
    /// `file` and `empty` disks share the plain pipeline. `template` disks
    /// get the template pipeline, which inspects the source's backing chain
    /// here; a failed inspection fails construction. Nothing is written.
    pub fn for_disk(
        disk: &DiskDescriptor,
        dest_dir: &Path,
        options: &ExportOptions,
        tools: &'a dyn DiskTools,
    ) -> Result<Self> {
        let job = ExportJob::new(disk, dest_dir, options)?;
        let variant = match disk.disk_type {
            DiskType::File | DiskType::Empty => Variant::Plain,
            DiskType::Template => Variant::Template {
                standalone: options.standalone,
                chain: tools.backing_chain(&job.source)?,
            },
        };

        Ok(Self {
            job,
            variant,
            tools,
            progress: None,
            position: (1, 1),
        })
    }

    /// Resolve the variant from a disk type name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedDiskType`] for names other than `file`,
    /// `empty` and `template`.
    pub fn for_type_name(
        disk_type: &str,
        path: impl Into<PathBuf>,
        format: impl Into<String>,
        dest_dir: &Path,
        options: &ExportOptions,
        tools: &'a dyn DiskTools,
    ) -> Result<Self> {
        let disk = DiskDescriptor::new(path, disk_type.parse()?, format);
        Self::for_disk(&disk, dest_dir, options, tools)
    }

    /// Report progress of this export through `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    fn with_position(mut self, current: usize, total: usize) -> Self {
        self.position = (current, total);
        self
    }

    /// The job being exported.
    pub fn job(&self) -> &ExportJob {
        &self.job
    }

    /// True for the template pipeline.
    pub fn is_template(&self) -> bool {
        matches!(self.variant, Variant::Template { .. })
    }

    /// Backing chain of a template disk.
    pub fn backing_chain(&self) -> Option<&BackingChain> {
        match &self.variant {
            Variant::Template { chain, .. } => Some(chain),
            Variant::Plain => None,
        }
    }

    /// Run the export.
    ///
    /// On error, the image and sidecars written by this call are removed
    /// before the error is returned.
    pub fn export(mut self) -> Result<ExportedDisk> {
        let span = tracing::info_span!(
            "export",
            disk = %self.job.name,
            dest = %self.job.dest.display()
        );
        let _enter = span.enter();

        self.begin(ExportStep::Preparing);
        self.prepare()?;

        let mut rollback = Rollback::new();
        for path in [self.job.dest.clone(), self.job.hash_path(), self.job.metadata_path()] {
            rollback.defer(move || remove_quietly(&path));
        }

        self.copy()?;
        self.sparsify()?;
        self.rebase()?;
        let checksum = self.calc_checksum()?;
        let size = self.update_metadata()?;
        self.write_metadata()?;
        let compressed = self.compress(&mut rollback)?;

        rollback.disarm();
        self.begin(ExportStep::Complete);

        Ok(ExportedDisk {
            hash_file: self.job.hash_path(),
            metadata_file: self.job.metadata_path(),
            artifact: self.job.dest,
            compressed,
            algorithm: self.job.algorithm,
            checksum,
            size,
            metadata: self.job.metadata,
        })
    }

    fn begin(&self, step: ExportStep) {
        tracing::info!("{step}");
        if let Some(callback) = &self.progress {
            callback(ExportProgress {
                step,
                disk: self.job.name.clone(),
                current_disk: self.position.0,
                total_disks: self.position.1,
            });
        }
    }

    /// Checks that must pass before anything is written.
    fn prepare(&self) -> Result<()> {
        if let Variant::Template {
            standalone: false,
            chain,
        } = &self.variant
        {
            if chain.len() > MAX_LAYERED_CHAIN_DEPTH {
                return Err(Error::UnsupportedLayerDepth { depth: chain.len() });
            }
        }

        let source = self
            .job
            .source
            .canonicalize()
            .map_err(|e| Error::io(e, &self.job.source))?;

        fs::create_dir_all(&self.job.dest_dir).map_err(|e| Error::io(e, &self.job.dest_dir))?;

        // Rolling back an export onto its own source would delete the source.
        let dest = self
            .job
            .dest_dir
            .canonicalize()
            .map_err(|e| Error::io(e, &self.job.dest_dir))?
            .join(&self.job.name);
        if source == dest {
            return Err(Error::invalid_descriptor(format!(
                "destination '{}' is the source image",
                dest.display()
            )));
        }

        Ok(())
    }

    fn copy(&self) -> Result<()> {
        self.begin(ExportStep::Copying);
        self.tools.copy_sparse(&self.job.source, &self.job.dest)
    }

    fn sparsify(&self) -> Result<()> {
        self.begin(ExportStep::Sparsifying);
        self.tools.sparsify(&self.job.dest, &self.job.format)
    }

    fn rebase(&self) -> Result<()> {
        let Variant::Template { standalone, chain } = &self.variant else {
            return Ok(());
        };

        self.begin(if *standalone {
            ExportStep::Merging
        } else {
            ExportStep::Rebasing
        });

        if chain.is_base() {
            tracing::debug!("image has no backing file, nothing to rebase");
            return Ok(());
        }

        if *standalone {
            if chain.len() > MAX_LAYERED_CHAIN_DEPTH {
                tracing::warn!(
                    depth = chain.len(),
                    "merging a backing chain deeper than layered export supports"
                );
            }
            return self.tools.rebase(&self.job.dest, "", None, true);
        }

        let backing = chain.relative_backing_reference().ok_or_else(|| {
            Error::tool(
                "qemu-img",
                format!(
                    "backing file of '{}' has no file name",
                    self.job.source.display()
                ),
            )
        })?;
        tracing::debug!(backing = %backing, "pointing layer at relative backing file");
        self.tools.rebase(
            &self.job.dest,
            &backing,
            chain.immediate_backing_format(),
            false,
        )
    }

    fn calc_checksum(&mut self) -> Result<String> {
        self.begin(ExportStep::Checksumming);
        let hash_path = self.job.hash_path();
        let digest = self.tools.digest(&self.job.dest, self.job.algorithm)?;
        fs::write(&hash_path, &digest).map_err(|e| Error::io(e, &hash_path))?;
        self.job.metadata.set_checksum(self.job.algorithm, &digest);
        Ok(digest)
    }

    fn update_metadata(&mut self) -> Result<u64> {
        self.begin(ExportStep::UpdatingMetadata);
        let size = fs::metadata(&self.job.dest)
            .map_err(|e| Error::io(e, &self.job.dest))?
            .len();

        let metadata = &mut self.job.metadata;
        metadata.insert(SIZE_KEY, size);
        metadata.insert(NAME_KEY, self.job.name.as_str());
        metadata.insert(VERSION_KEY, metadata::current_version());

        if let Variant::Template { standalone, .. } = &self.variant {
            let base = if *standalone {
                NO_BASE
            } else {
                self.job.name.as_str()
            };
            metadata.insert(BASE_KEY, base);
        }

        Ok(size)
    }

    fn write_metadata(&self) -> Result<()> {
        self.begin(ExportStep::WritingMetadata);
        self.job.metadata.write_to(&self.job.metadata_path())
    }

    fn compress(&self, rollback: &mut Rollback) -> Result<Option<PathBuf>> {
        if !self.job.compress {
            return Ok(None);
        }

        self.begin(ExportStep::Compressing);
        let target = self.tools.compressed_path(&self.job.dest);
        rollback.defer(move || remove_quietly(&target));
        let compressed = self.tools.compress(&self.job.dest, COMPRESSION_BLOCK_SIZE)?;

        fs::remove_file(&self.job.dest).map_err(|e| Error::io(e, &self.job.dest))?;
        Ok(Some(compressed))
    }
}

/// Export several disks into one directory, in order.
///
/// Stops at the first failure. Each disk has its own rollback, so disks
/// exported before the failing one are kept.
pub fn export_disks(
    disks: &[DiskDescriptor],
    dest_dir: &Path,
    options: &ExportOptions,
    tools: &dyn DiskTools,
    progress: Option<ProgressCallback>,
) -> Result<Vec<ExportedDisk>> {
    let total = disks.len();
    let mut exported = Vec::with_capacity(total);

    for (index, disk) in disks.iter().enumerate() {
        let mut exporter =
            DiskExporter::for_disk(disk, dest_dir, options, tools)?.with_position(index + 1, total);
        if let Some(callback) = &progress {
            exporter = exporter.with_progress(Arc::clone(callback));
        }
        exported.push(exporter.export()?);
    }

    Ok(exported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn test_export_options_default() {
        let options = ExportOptions::default();
        assert!(!options.compress);
        assert!(!options.standalone);
        assert_eq!(options.checksum, ChecksumAlgorithm::Sha1);
    }

    #[test]
    fn test_export_options_builders() {
        let options = ExportOptions::new(true, true).with_checksum(ChecksumAlgorithm::Sha256);
        assert!(options.compress);
        assert!(options.standalone);
        assert_eq!(options.checksum, ChecksumAlgorithm::Sha256);
    }

    #[test]
    fn test_export_step_display() {
        assert_eq!(ExportStep::Copying.to_string(), "Copying disk");
        assert_eq!(ExportStep::Sparsifying.to_string(), "Making disk sparse");
        assert_eq!(
            ExportStep::Merging.to_string(),
            "Merging layered image with base"
        );
        assert_eq!(ExportStep::Complete.to_string(), "Complete");
    }

    #[test]
    fn test_job_paths() {
        let disk = DiskDescriptor::new("/work/vm1/root.qcow2", DiskType::File, "qcow2");
        let job = ExportJob::new(&disk, Path::new("/exports"), &ExportOptions::default()).unwrap();

        assert_eq!(job.name(), "root.qcow2");
        assert_eq!(job.dest(), Path::new("/exports/root.qcow2"));
        assert_eq!(job.hash_path(), PathBuf::from("/exports/root.qcow2.hash"));
        assert_eq!(
            job.metadata_path(),
            PathBuf::from("/exports/root.qcow2.metadata")
        );
    }

    #[test]
    fn test_job_copies_source_metadata() {
        let mut source = Map::new();
        source.insert("distro".to_string(), json!("el9"));
        let disk = DiskDescriptor::new("/work/root.qcow2", DiskType::File, "qcow2")
            .with_metadata(source.clone());

        let job = ExportJob::new(&disk, Path::new("/exports"), &ExportOptions::default()).unwrap();
        assert_eq!(job.metadata().fields(), &source);
    }
}
