//! Content-addressed in-memory blob store.

use crate::error::{Result, SyncError};
use crate::types::{Hash, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use super::BlobUploader;

const URL_SCHEME: &str = "mem://blobs/";

/// Uploaded blob data.
#[derive(Clone, Debug)]
pub struct StoredBlob {
    pub hash: Hash,
    pub content: Vec<u8>,
    pub content_type: String,
    pub uploaded: Timestamp,
    checksum: u32,
}

/// Blob storage keyed by SHA-256 of the content.
///
/// URLs look like `mem://blobs/<shard>/<hash>/<name>` where `<shard>` is the
/// first byte of the hash; identical content maps to the same stored blob.
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<Hash, StoredBlob>>,
    failures: AtomicU32,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            failures: AtomicU32::new(0),
        }
    }

    /// Fail the next `times` uploads with a transient error.
    pub fn fail_next_uploads(&self, times: u32) {
        self.failures.fetch_add(times, Ordering::SeqCst);
    }

    /// Resolve a URL handed out by `upload`.
    pub fn fetch(&self, url: &str) -> Result<Option<StoredBlob>> {
        let hash = Self::parse_url(url)?;
        let blob = match self.blobs.read().get(&hash) {
            Some(b) => b.clone(),
            None => return Ok(None),
        };

        let computed = crc32fast::hash(&blob.content);
        if computed != blob.checksum {
            return Err(SyncError::Serialization(format!(
                "blob {} checksum mismatch: expected {}, got {}",
                hash, blob.checksum, computed
            )));
        }
        Ok(Some(blob))
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn parse_url(url: &str) -> Result<Hash> {
        let invalid = || SyncError::Validation(format!("not a blob url: {}", url));
        let rest = url.strip_prefix(URL_SCHEME).ok_or_else(invalid)?;
        let mut parts = rest.split('/');
        let _shard = parts.next().ok_or_else(invalid)?;
        let hex = parts.next().ok_or_else(invalid)?;
        Hash::from_hex(hex).map_err(|_| invalid())
    }

    /// Consume one pending injected failure, if any.
    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobUploader for MemoryBlobStore {
    fn upload(&self, name: &str, content: &[u8], content_type: &str) -> Result<String> {
        if self.take_failure() {
            return Err(SyncError::TransientNetwork(format!("upload of {} failed", name)));
        }

        let hash = Hash::from_bytes(content);
        self.blobs.write().entry(hash).or_insert_with(|| StoredBlob {
            hash,
            content: content.to_vec(),
            content_type: content_type.to_string(),
            uploaded: Timestamp::now(),
            checksum: crc32fast::hash(content),
        });

        Ok(format!(
            "{}{}/{}/{}",
            URL_SCHEME,
            hash.shard_prefix(),
            hash.to_hex(),
            name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_and_fetch() {
        let blobs = MemoryBlobStore::new();
        let url = blobs.upload("cat.png", b"png bytes", "image/png").unwrap();
        assert!(url.starts_with(URL_SCHEME));
        assert!(url.ends_with("/cat.png"));

        let blob = blobs.fetch(&url).unwrap().unwrap();
        assert_eq!(blob.content, b"png bytes");
        assert_eq!(blob.content_type, "image/png");
    }

    #[test]
    fn test_deduplication() {
        let blobs = MemoryBlobStore::new();
        let a = blobs.upload("a.png", b"same", "image/png").unwrap();
        let b = blobs.upload("b.png", b"same", "image/png").unwrap();
        assert_ne!(a, b);
        assert_eq!(blobs.len(), 1);
        assert_eq!(
            blobs.fetch(&a).unwrap().unwrap().hash,
            blobs.fetch(&b).unwrap().unwrap().hash
        );
    }

    #[test]
    fn test_injected_failure_stores_nothing() {
        let blobs = MemoryBlobStore::new();
        blobs.fail_next_uploads(1);
        let err = blobs.upload("x.png", b"x", "image/png").unwrap_err();
        assert!(err.is_transient());
        assert!(blobs.is_empty());

        assert!(blobs.upload("x.png", b"x", "image/png").is_ok());
    }

    #[test]
    fn test_fetch_rejects_foreign_url() {
        let blobs = MemoryBlobStore::new();
        assert!(matches!(
            blobs.fetch("https://example.com/x.png"),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_corrupted_content_fails_checksum() {
        let blobs = MemoryBlobStore::new();
        let url = blobs.upload("cat.png", b"png bytes", "image/png").unwrap();
        let hash = blobs.fetch(&url).unwrap().unwrap().hash;

        blobs.blobs.write().get_mut(&hash).unwrap().content[0] ^= 0xff;

        match blobs.fetch(&url) {
            Err(SyncError::Serialization(msg)) => assert!(msg.contains("checksum mismatch")),
            other => panic!("expected checksum error, got {:?}", other),
        }
    }
}
