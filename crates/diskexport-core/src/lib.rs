//! diskexport Core Library
//!
//! This crate exports VM disk images into standalone, shareable artifacts: a
//! copied (and optionally compressed) image, a `.hash` checksum sidecar and a
//! `.metadata` JSON sidecar describing the image's provenance.
//!
//! # Overview
//!
//! The main entry point is [`DiskExporter`], which picks the export pipeline
//! for a disk's type and runs it under a rollback guard. Image manipulation is
//! delegated to a [`DiskTools`] implementation; [`SystemTools`] drives
//! `qemu-img`, `virt-sparsify`, `cp` and `xz`.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`disk`] - Disk descriptors and disk specs
//! - [`metadata`] - Export metadata and version stamps
//! - [`checksum`] - Digest algorithms
//! - [`image`] - Memory-mapped image reading and backing chains
//! - [`compress`] - Compression formats and in-process gzip
//! - [`tools`] - External tool adapter
//! - [`rollback`] - Cleanup guard for partially applied exports
//! - [`export`] - Export pipeline
//! - [`verify`] - Checking an export against its sidecars
//! - [`paths`] - Environment expansion and sidecar paths
//!
//! # Quick Start
//!
//! ```no_run
//! use diskexport_core::{DiskDescriptor, DiskExporter, DiskType, ExportOptions, SystemTools};
//! use std::path::Path;
//!
//! let disk = DiskDescriptor::new("/var/lib/vms/db/root.qcow2", DiskType::File, "qcow2");
//! let tools = SystemTools::default();
//!
//! DiskExporter::for_disk(&disk, Path::new("/srv/templates"), &ExportOptions::default(), &tools)
//!     .and_then(|exporter| exporter.export())
//!     .unwrap();
//! ```

pub mod checksum;
pub mod compress;
pub mod disk;
pub mod error;
pub mod export;
pub mod image;
pub mod metadata;
pub mod paths;
pub mod rollback;
pub mod tools;
pub mod verify;

pub use error::{Error, Result};

// Re-export main export functionality for convenience
pub use checksum::ChecksumAlgorithm;
pub use compress::{CompressionFormat, COMPRESSION_BLOCK_SIZE};
pub use disk::{DiskDescriptor, DiskSpec, DiskType};
pub use export::{
    export_disks, DiskExporter, ExportOptions, ExportProgress, ExportStep, ExportedDisk,
    ProgressCallback,
};
pub use image::{BackingChain, ImageInfo};
pub use metadata::ExportMetadata;
pub use tools::{DiskTools, SystemTools, ToolConfig};
pub use verify::{verify_export, VerifyReport};
