//! Error types for the diskexport core library.

use std::path::PathBuf;

/// The main error type for disk export operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The disk type has no export variant.
    #[error("Export is not supported for disk type '{disk_type}'")]
    UnsupportedDiskType { disk_type: String },

    /// A layered export was requested for a backing chain deeper than one backing layer.
    #[error(
        "Layered export supports exactly one backing layer (backing chain has {depth} images); \
         use standalone export for deeper chains"
    )]
    UnsupportedLayerDepth { depth: usize },

    /// The checksum algorithm name is not known.
    #[error("Unsupported checksum algorithm '{name}'")]
    UnsupportedChecksum { name: String },

    /// An external tool (or the in-process replacement for one) failed.
    #[error("{tool} failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The disk descriptor or destination can not be exported.
    #[error("Invalid disk descriptor: {message}")]
    InvalidDescriptor { message: String },

    /// Metadata could not be encoded or decoded.
    #[error("Metadata error: {message}")]
    Metadata { message: String },
}

/// A specialized Result type for disk export operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an external tool failure.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create an invalid descriptor error.
    pub fn invalid_descriptor(message: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            message: message.into(),
        }
    }

    /// Create a metadata error.
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::io(io_err, "/exports/disk.qcow2.hash");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/exports/disk.qcow2.hash"));
    }

    #[test]
    fn test_io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io_simple(io_err);
        assert!(!err.to_string().contains("at '"));
    }

    #[test]
    fn test_unsupported_disk_type_names_type() {
        let err = Error::UnsupportedDiskType {
            disk_type: "iso".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Export is not supported for disk type 'iso'"
        );
    }

    #[test]
    fn test_layer_depth_suggests_standalone() {
        let err = Error::UnsupportedLayerDepth { depth: 3 };
        let msg = err.to_string();
        assert!(msg.contains("exactly one backing layer"));
        assert!(msg.contains("standalone"));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_tool_error() {
        let err = Error::tool("qemu-img", "exited with status 1");
        assert_eq!(err.to_string(), "qemu-img failed: exited with status 1");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "no space left on device");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }
}
