//! Disk image reader with memory-mapped I/O.
//!
//! Digesting and block compression both walk the exported image front to
//! back. Mapping the file lets them borrow slices instead of copying every
//! chunk into a fresh buffer.

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::slice::Chunks;

/// A memory-mapped, read-only view of a disk image.
///
/// # Example
///
/// ```no_run
/// use diskexport_core::image::ImageReader;
/// use std::path::Path;
///
/// let reader = ImageReader::open(Path::new("/exports/base.qcow2")).unwrap();
/// for (index, chunk) in reader.chunks(4 * 1024 * 1024).enumerate() {
///     println!("chunk {}: {} bytes", index, chunk.len());
/// }
/// ```
#[derive(Debug)]
pub struct ImageReader {
    /// `None` for empty files, which can not be mapped.
    mmap: Option<Mmap>,
    size: u64,
}

impl ImageReader {
    /// Opens an image file and maps it into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file can not be opened, stat'ed or mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();

        if size == 0 {
            return Ok(Self { mmap: None, size });
        }

        // Safety: the mapping is read-only and the file handle stays valid for
        // the lifetime of the Mmap. Concurrent truncation of the file by another
        // process is outside what an export guarantees.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        Ok(Self {
            mmap: Some(mmap),
            size,
        })
    }

    /// Returns the size of the image file in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the whole mapped file.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Iterates over the file in `chunk_size` pieces. The last chunk may be shorter.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn chunks(&self, chunk_size: usize) -> Chunks<'_, u8> {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        self.data().chunks(chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_file(size: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        let pattern: Vec<u8> = (0u8..=255).cycle().take(size).collect();
        file.write_all(&pattern).expect("Failed to write test data");
        file.flush().expect("Failed to flush");
        file
    }

    #[test]
    fn test_open_and_size() {
        let file = create_test_file(1024);
        let reader = ImageReader::open(file.path()).unwrap();
        assert_eq!(reader.size(), 1024);
        assert_eq!(reader.data().len(), 1024);
    }

    #[test]
    fn test_empty_file() {
        let file = create_test_file(0);
        let reader = ImageReader::open(file.path()).unwrap();
        assert_eq!(reader.size(), 0);
        assert!(reader.data().is_empty());
        assert_eq!(reader.chunks(16).count(), 0);
    }

    #[test]
    fn test_chunks_cover_file() {
        let file = create_test_file(1000);
        let reader = ImageReader::open(file.path()).unwrap();
        let chunks: Vec<_> = reader.chunks(256).collect();

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].len(), 1000 - 3 * 256);
        assert_eq!(chunks[2][0], (512 % 256) as u8);

        let rejoined: Vec<u8> = chunks.concat();
        assert_eq!(rejoined, reader.data());
    }

    #[test]
    fn test_exact_multiple_has_no_short_tail() {
        let file = create_test_file(512);
        let reader = ImageReader::open(file.path()).unwrap();
        let chunks: Vec<_> = reader.chunks(256).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 256);
    }

    #[test]
    fn test_open_missing_file() {
        let err = ImageReader::open(Path::new("/nonexistent/disk.img")).unwrap_err();
        assert!(matches!(err, Error::Io { path: Some(_), .. }));
    }
}
