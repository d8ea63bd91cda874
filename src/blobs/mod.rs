//! Blob upload capability.
//!
//! The engine only needs "upload bytes, get back a stable URL". Anything
//! referencing that URL is written after `upload` has returned.

mod memory;

pub use memory::MemoryBlobStore;

use crate::error::Result;

/// Uploads media and returns a durable, retrievable URL.
pub trait BlobUploader: Send + Sync {
    fn upload(&self, name: &str, content: &[u8], content_type: &str) -> Result<String>;
}
