//! External disk tooling.
//!
//! The export pipeline never manipulates image formats itself. Copying,
//! sparsifying, backing chain inspection, rebasing, digesting and compression
//! all go through the [`DiskTools`] trait. [`SystemTools`] implements it with
//! `cp`, `virt-sparsify`, `qemu-img` and `xz`.

use crate::checksum::{self, ChecksumAlgorithm};
use crate::compress::{self, CompressionFormat};
use crate::error::{Error, Result};
use crate::image::BackingChain;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Capabilities the export pipeline needs from disk tooling.
///
/// Every operation may fail; the pipeline never retries them.
pub trait DiskTools {
    /// Copy `src` to `dst` without materializing holes.
    fn copy_sparse(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Reclaim unused space inside `path` in place.
    fn sparsify(&self, path: &Path, format: &str) -> Result<()>;

    /// Describe the backing chain of `path` (read-only).
    fn backing_chain(&self, path: &Path) -> Result<BackingChain>;

    /// Rewrite the backing file pointer of `target`.
    ///
    /// An empty `backing_file` in safe mode merges all backing layers into
    /// `target`. In unsafe mode only the header is rewritten, without checking
    /// the new backing file.
    fn rebase(
        &self,
        target: &Path,
        backing_file: &str,
        backing_format: Option<&str>,
        safe: bool,
    ) -> Result<()>;

    /// Hex digest of the file contents.
    fn digest(&self, path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
        checksum::digest_file(path, algorithm)
    }

    /// Where [`DiskTools::compress`] writes the compressed copy of `path`.
    fn compressed_path(&self, path: &Path) -> PathBuf;

    /// Write a compressed copy of `path` to [`DiskTools::compressed_path`]
    /// and return that path. The input is left in place.
    fn compress(&self, path: &Path, block_size: usize) -> Result<PathBuf>;
}

/// Locations and settings of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    /// `qemu-img` binary.
    pub qemu_img: PathBuf,
    /// `virt-sparsify` binary.
    pub virt_sparsify: PathBuf,
    /// `cp` binary; must support `--sparse=always`.
    pub cp: PathBuf,
    /// `xz` binary.
    pub xz: PathBuf,
    /// Compression output format.
    pub compression: CompressionFormat,
    /// Value for `LIBGUESTFS_BACKEND` when running `virt-sparsify`.
    pub libguestfs_backend: Option<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            qemu_img: PathBuf::from("qemu-img"),
            virt_sparsify: PathBuf::from("virt-sparsify"),
            cp: PathBuf::from("cp"),
            xz: PathBuf::from("xz"),
            compression: CompressionFormat::Xz,
            libguestfs_backend: Some("direct".to_string()),
        }
    }
}

impl ToolConfig {
    /// Defaults, overridden by `DISKEXPORT_QEMU_IMG`, `DISKEXPORT_VIRT_SPARSIFY`,
    /// `DISKEXPORT_CP`, `DISKEXPORT_XZ` and `LIBGUESTFS_BACKEND`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup("DISKEXPORT_QEMU_IMG") {
            config.qemu_img = path.into();
        }
        if let Some(path) = lookup("DISKEXPORT_VIRT_SPARSIFY") {
            config.virt_sparsify = path.into();
        }
        if let Some(path) = lookup("DISKEXPORT_CP") {
            config.cp = path.into();
        }
        if let Some(path) = lookup("DISKEXPORT_XZ") {
            config.xz = path.into();
        }
        if let Some(backend) = lookup("LIBGUESTFS_BACKEND") {
            config.libguestfs_backend = Some(backend);
        }
        config
    }

    /// Use a different compression format.
    pub fn with_compression(mut self, compression: CompressionFormat) -> Self {
        self.compression = compression;
        self
    }
}

/// [`DiskTools`] backed by the host's binaries.
#[derive(Debug, Clone, Default)]
pub struct SystemTools {
    config: ToolConfig,
}

impl SystemTools {
    /// Create tools with the given configuration.
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn run(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        let tool = tool_name(cmd.get_program());
        tracing::debug!(command = ?cmd, "running");

        let output = cmd
            .output()
            .map_err(|e| Error::tool(&tool, format!("failed to execute: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::tool(
                &tool,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }

        Ok(output.stdout)
    }
}

fn tool_name(program: &OsStr) -> String {
    Path::new(program)
        .file_name()
        .unwrap_or(program)
        .to_string_lossy()
        .into_owned()
}

impl DiskTools for SystemTools {
    fn copy_sparse(&self, src: &Path, dst: &Path) -> Result<()> {
        self.run(
            Command::new(&self.config.cp)
                .arg("--sparse=always")
                .arg(src)
                .arg(dst),
        )?;
        Ok(())
    }

    fn sparsify(&self, path: &Path, format: &str) -> Result<()> {
        let mut cmd = Command::new(&self.config.virt_sparsify);
        cmd.args(["-q", "--in-place", "--format", format]).arg(path);
        if let Some(backend) = &self.config.libguestfs_backend {
            cmd.env("LIBGUESTFS_BACKEND", backend);
        }
        self.run(&mut cmd)?;
        Ok(())
    }

    fn backing_chain(&self, path: &Path) -> Result<BackingChain> {
        let stdout = self.run(
            Command::new(&self.config.qemu_img)
                .args(["info", "--backing-chain", "--output=json"])
                .arg(path),
        )?;
        BackingChain::from_json(&stdout).map_err(|e| {
            Error::tool(
                tool_name(self.config.qemu_img.as_os_str()),
                format!("unexpected output for '{}': {e}", path.display()),
            )
        })
    }

    fn rebase(
        &self,
        target: &Path,
        backing_file: &str,
        backing_format: Option<&str>,
        safe: bool,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.config.qemu_img);
        cmd.arg("rebase");
        if !safe {
            cmd.arg("-u");
        }
        cmd.args(["-b", backing_file]);
        if let (false, Some(format)) = (backing_file.is_empty(), backing_format) {
            cmd.args(["-F", format]);
        }
        cmd.arg(target);
        self.run(&mut cmd)?;
        Ok(())
    }

    fn compressed_path(&self, path: &Path) -> PathBuf {
        self.config.compression.compressed_path(path)
    }

    fn compress(&self, path: &Path, block_size: usize) -> Result<PathBuf> {
        match self.config.compression {
            CompressionFormat::Xz => {
                let output = self.compressed_path(path);
                let result = self.run(
                    Command::new(&self.config.xz)
                        .args(["--compress", "--keep", "--threads=0", "--best", "--force"])
                        .arg(format!("--block-size={block_size}"))
                        .arg(path),
                );
                if let Err(e) = result {
                    crate::rollback::remove_quietly(&output);
                    return Err(e);
                }
                Ok(output)
            }
            CompressionFormat::Gzip => compress::gzip_file(path, block_size),
        }
    }
}
