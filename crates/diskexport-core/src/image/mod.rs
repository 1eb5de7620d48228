//! Disk image access.
//!
//! This module provides read access to image files and the description of
//! their backing chains.

pub mod chain;
pub mod reader;

pub use chain::{BackingChain, ImageInfo};
pub use reader::ImageReader;
