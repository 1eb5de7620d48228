//! Backing chain description as reported by `qemu-img info --backing-chain`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One image in a backing chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    /// Path of the image file.
    pub filename: String,
    /// Image format (e.g. "qcow2", "raw").
    pub format: String,
    /// Guest-visible size in bytes.
    #[serde(default)]
    pub virtual_size: u64,
    /// Bytes allocated on the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_size: Option<u64>,
    /// Backing file reference as stored in the image header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_filename: Option<String>,
    /// Backing file reference resolved to an absolute path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_backing_filename: Option<String>,
    /// Format of the backing file, when recorded in the header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_filename_format: Option<String>,
}

impl ImageInfo {
    /// Describe a standalone image with no backing file.
    pub fn base(filename: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            format: format.into(),
            virtual_size: 0,
            actual_size: None,
            backing_filename: None,
            full_backing_filename: None,
            backing_filename_format: None,
        }
    }

    /// Describe an image layered on `backing`.
    pub fn layer(
        filename: impl Into<String>,
        format: impl Into<String>,
        backing: impl Into<String>,
    ) -> Self {
        let backing = backing.into();
        Self {
            full_backing_filename: Some(backing.clone()),
            backing_filename: Some(backing),
            ..Self::base(filename, format)
        }
    }
}

/// The chain of images an image depends on.
///
/// Element 0 is the inspected image itself and its `backing_filename` names the
/// nearest backing file. The last element is the base image. A chain of one
/// image has no backing file at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingChain {
    images: Vec<ImageInfo>,
}

impl BackingChain {
    /// Build a chain from images ordered from the inspected layer down to the base.
    ///
    /// # Errors
    ///
    /// Returns an error if `images` is empty; every chain contains at least the
    /// inspected image.
    pub fn new(images: Vec<ImageInfo>) -> Result<Self> {
        if images.is_empty() {
            return Err(Error::metadata("backing chain contains no images"));
        }
        Ok(Self { images })
    }

    /// Parse the JSON array printed by `qemu-img info --backing-chain --output=json`.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let images: Vec<ImageInfo> = serde_json::from_slice(json)
            .map_err(|e| Error::metadata(format!("invalid backing chain JSON: {e}")))?;
        Self::new(images)
    }

    /// Number of images in the chain, including the inspected image.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Always false; a chain holds at least the inspected image.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// True if the inspected image has no backing file.
    pub fn is_base(&self) -> bool {
        self.images.len() == 1
    }

    /// All images, inspected layer first.
    pub fn images(&self) -> &[ImageInfo] {
        &self.images
    }

    /// The inspected image.
    pub fn top(&self) -> &ImageInfo {
        &self.images[0]
    }

    /// The image at the bottom of the chain.
    pub fn base_image(&self) -> &ImageInfo {
        &self.images[self.images.len() - 1]
    }

    /// The backing file reference of the inspected image, as written in its header.
    pub fn immediate_backing_file(&self) -> Option<&str> {
        self.top().backing_filename.as_deref()
    }

    /// Format of the nearest backing file, from the header or the next chain element.
    pub fn immediate_backing_format(&self) -> Option<&str> {
        self.top()
            .backing_filename_format
            .as_deref()
            .or_else(|| self.images.get(1).map(|image| image.format.as_str()))
    }

    /// The nearest backing file reduced to `./<basename>`.
    ///
    /// A leading `<protocol>:` qualifier (as in `file:/store/base.qcow2`) is
    /// dropped first, so the exported layer resolves its parent next to itself.
    pub fn relative_backing_reference(&self) -> Option<String> {
        let backing = self.immediate_backing_file()?;
        let path = match backing.split_once(':') {
            Some((protocol, rest)) if !protocol.is_empty() && !protocol.contains('/') => rest,
            _ => backing,
        };
        let name = Path::new(path).file_name()?;
        Some(format!("./{}", name.to_string_lossy()))
    }

    /// Total guest-visible size of the inspected image.
    pub fn virtual_size(&self) -> u64 {
        self.top().virtual_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYERED_JSON: &str = r#"[
        {
            "virtual-size": 10737418240,
            "filename": "/var/lib/images/layer.qcow2",
            "cluster-size": 65536,
            "format": "qcow2",
            "actual-size": 200704,
            "backing-filename": "/var/lib/store/el9-base.qcow2",
            "full-backing-filename": "/var/lib/store/el9-base.qcow2",
            "backing-filename-format": "qcow2",
            "dirty-flag": false
        },
        {
            "virtual-size": 10737418240,
            "filename": "/var/lib/store/el9-base.qcow2",
            "cluster-size": 65536,
            "format": "qcow2",
            "actual-size": 1073741824,
            "dirty-flag": false
        }
    ]"#;

    #[test]
    fn test_parse_layered_chain() {
        let chain = BackingChain::from_json(LAYERED_JSON.as_bytes()).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(!chain.is_base());
        assert_eq!(chain.top().filename, "/var/lib/images/layer.qcow2");
        assert_eq!(chain.base_image().filename, "/var/lib/store/el9-base.qcow2");
        assert_eq!(chain.virtual_size(), 10737418240);
        assert_eq!(chain.top().actual_size, Some(200704));
        assert_eq!(
            chain.immediate_backing_file(),
            Some("/var/lib/store/el9-base.qcow2")
        );
        assert_eq!(chain.immediate_backing_format(), Some("qcow2"));
    }

    #[test]
    fn test_relative_backing_reference() {
        let chain = BackingChain::from_json(LAYERED_JSON.as_bytes()).unwrap();
        assert_eq!(
            chain.relative_backing_reference().as_deref(),
            Some("./el9-base.qcow2")
        );
    }

    #[test]
    fn test_relative_reference_drops_protocol() {
        let chain = BackingChain::new(vec![
            ImageInfo::layer("/work/layer.qcow2", "qcow2", "file:/store/fc40.qcow2"),
            ImageInfo::base("/store/fc40.qcow2", "raw"),
        ])
        .unwrap();
        assert_eq!(
            chain.relative_backing_reference().as_deref(),
            Some("./fc40.qcow2")
        );
        // No format in the header, so the next element's format is used.
        assert_eq!(chain.immediate_backing_format(), Some("raw"));
    }

    #[test]
    fn test_relative_reference_keeps_colon_in_path() {
        let chain = BackingChain::new(vec![
            ImageInfo::layer("/work/layer.qcow2", "qcow2", "/store/el9:2024.qcow2"),
            ImageInfo::base("/store/el9:2024.qcow2", "qcow2"),
        ])
        .unwrap();
        assert_eq!(
            chain.relative_backing_reference().as_deref(),
            Some("./el9:2024.qcow2")
        );

        let chain = BackingChain::new(vec![
            ImageInfo::layer("/work/layer.qcow2", "qcow2", "file:/store/el9:2024.qcow2"),
            ImageInfo::base("/store/el9:2024.qcow2", "qcow2"),
        ])
        .unwrap();
        assert_eq!(
            chain.relative_backing_reference().as_deref(),
            Some("./el9:2024.qcow2")
        );
    }

    #[test]
    fn test_base_image_chain() {
        let chain = BackingChain::new(vec![ImageInfo::base("/work/base.qcow2", "qcow2")]).unwrap();
        assert!(chain.is_base());
        assert_eq!(chain.immediate_backing_file(), None);
        assert_eq!(chain.immediate_backing_format(), None);
        assert_eq!(chain.relative_backing_reference(), None);
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(BackingChain::new(Vec::new()).is_err());
        assert!(matches!(
            BackingChain::from_json(b"[]"),
            Err(Error::Metadata { .. })
        ));
    }

    #[test]
    fn test_invalid_json() {
        let err = BackingChain::from_json(b"{\"filename\": 1}").unwrap_err();
        assert!(err.to_string().contains("invalid backing chain JSON"));
    }
}
