//! Scripted disk tooling for pipeline tests.
#![allow(dead_code)]

use diskexport_core::checksum::{self, ChecksumAlgorithm};
use diskexport_core::compress::{self, CompressionFormat};
use diskexport_core::{BackingChain, DiskTools, Error, ImageInfo, Result};
use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Bytes the fake rebase appends to its target, so tests can tell whether a
/// digest was taken before or after rebasing.
pub const REBASE_MARKER: &[u8] = b"<rebased>";

/// A tool call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Copy,
    Sparsify,
    Inspect,
    Rebase,
    Digest,
    Compress,
}

impl Call {
    pub fn tool(&self) -> &'static str {
        match self {
            Call::Copy => "fake-cp",
            Call::Sparsify => "fake-virt-sparsify",
            Call::Inspect => "fake-qemu-img-info",
            Call::Rebase => "fake-qemu-img-rebase",
            Call::Digest => "fake-digest",
            Call::Compress => "fake-compress",
        }
    }
}

/// A recorded rebase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseCall {
    pub target: PathBuf,
    pub backing_file: String,
    pub backing_format: Option<String>,
    pub safe: bool,
}

/// [`DiskTools`] that copies with `std::fs`, compresses with in-process gzip
/// and records everything else.
#[derive(Debug)]
pub struct FakeTools {
    pub chain: Vec<ImageInfo>,
    pub fail: Option<Call>,
    pub calls: RefCell<Vec<Call>>,
    pub rebases: RefCell<Vec<RebaseCall>>,
    pub sparsified: RefCell<Vec<(PathBuf, String)>>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self {
            chain: Vec::new(),
            fail: None,
            calls: RefCell::new(Vec::new()),
            rebases: RefCell::new(Vec::new()),
            sparsified: RefCell::new(Vec::new()),
        }
    }

    /// Report a chain of `depth` images for any inspected path.
    pub fn with_chain_depth(mut self, depth: usize) -> Self {
        self.chain = chain_of_depth(depth);
        self
    }

    pub fn failing_at(mut self, call: Call) -> Self {
        self.fail = Some(call);
        self
    }

    pub fn called(&self, call: Call) -> bool {
        self.calls.borrow().contains(&call)
    }

    fn enter(&self, call: Call) -> Result<()> {
        self.calls.borrow_mut().push(call);
        if self.fail == Some(call) {
            return Err(Error::tool(call.tool(), "injected failure"));
        }
        Ok(())
    }
}

/// Chain with the inspected layer first and `depth - 1` backing images below it.
pub fn chain_of_depth(depth: usize) -> Vec<ImageInfo> {
    (0..depth)
        .map(|level| {
            let name = format!("/store/level{level}.qcow2");
            if level + 1 < depth {
                ImageInfo::layer(
                    name,
                    "qcow2",
                    format!("/store/level{}.qcow2", level + 1),
                )
            } else {
                ImageInfo::base(name, "qcow2")
            }
        })
        .collect()
}

impl DiskTools for FakeTools {
    fn copy_sparse(&self, src: &Path, dst: &Path) -> Result<()> {
        self.enter(Call::Copy)?;
        fs::copy(src, dst).map_err(|e| Error::io(e, dst))?;
        Ok(())
    }

    fn sparsify(&self, path: &Path, format: &str) -> Result<()> {
        self.enter(Call::Sparsify)?;
        self.sparsified
            .borrow_mut()
            .push((path.to_path_buf(), format.to_string()));
        Ok(())
    }

    fn backing_chain(&self, _path: &Path) -> Result<BackingChain> {
        self.enter(Call::Inspect)?;
        BackingChain::new(self.chain.clone())
    }

    fn rebase(
        &self,
        target: &Path,
        backing_file: &str,
        backing_format: Option<&str>,
        safe: bool,
    ) -> Result<()> {
        self.enter(Call::Rebase)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(target)
            .map_err(|e| Error::io(e, target))?;
        file.write_all(REBASE_MARKER)
            .map_err(|e| Error::io(e, target))?;
        self.rebases.borrow_mut().push(RebaseCall {
            target: target.to_path_buf(),
            backing_file: backing_file.to_string(),
            backing_format: backing_format.map(str::to_string),
            safe,
        });
        Ok(())
    }

    fn digest(&self, path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
        self.enter(Call::Digest)?;
        checksum::digest_file(path, algorithm)
    }

    fn compressed_path(&self, path: &Path) -> PathBuf {
        CompressionFormat::Gzip.compressed_path(path)
    }

    fn compress(&self, path: &Path, block_size: usize) -> Result<PathBuf> {
        if let Err(e) = self.enter(Call::Compress) {
            // An interrupted compressor leaves a truncated archive behind.
            let partial = self.compressed_path(path);
            fs::write(&partial, b"\x1f\x8b").map_err(|e| Error::io(e, &partial))?;
            return Err(e);
        }
        compress::gzip_file(path, block_size)
    }
}

/// Write a source image with recognizable contents.
pub fn write_source(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    fs::write(&path, data).expect("Failed to write source image");
    path
}

/// Sorted file names in `dir`.
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("Failed to read directory")
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
