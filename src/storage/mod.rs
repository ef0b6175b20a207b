//! Storage layer - ordered byte-keyed store capability
//!
//! Handles:
//! - Structured slash-delimited keys (`eav/...`, `feed/{fp}`, `pub/{hash}`)
//! - The [`Store`] capability consumed by the entity store
//! - Atomic write batches so readers never see a half-applied operation
//!
//! Backends: [`MemoryStore`] (tests, ephemeral nodes) and [`SqliteStore`].

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Byte separating key components
pub const SEPARATOR: u8 = b'/';

/// A key/value pair returned by prefix scans
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Structured store key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    /// Join `parts` with the separator: `["eav", "fp:1", "Bookmark/url"]`
    /// becomes `eav/fp:1/Bookmark/url`.
    pub fn new(parts: &[&str]) -> Self {
        let mut bytes = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                bytes.push(SEPARATOR);
            }
            bytes.extend_from_slice(part.as_bytes());
        }
        Key(bytes)
    }

    /// Like [`Key::new`] with a trailing separator, so `ave/db/Kind/Bookmark/`
    /// does not also match `ave/db/Kind/BookmarkFolder/...`.
    pub fn prefix(parts: &[&str]) -> Self {
        let mut key = Self::new(parts);
        key.0.push(SEPARATOR);
        key
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Set of writes applied atomically by [`Store::write`].
///
/// Later writes to the same key replace earlier ones, so the batch doubles as
/// a read-your-writes overlay while it is being built.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) {
        self.ops.insert(key.as_ref().to_vec(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.ops.insert(key.as_ref().to_vec(), None);
    }

    /// Staged state of `key`: `None` if untouched, `Some(None)` if deleted.
    pub fn staged(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.ops.get(key).map(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.ops.iter().map(|(k, v)| (k.as_slice(), v.as_deref()))
    }

    /// Read `key` through the batch, falling back to `store`.
    pub fn read_through(
        &self,
        store: &dyn Store,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        match self.staged(key) {
            Some(staged) => Ok(staged.map(|v| v.to_vec())),
            None => store.get(key),
        }
    }
}

/// Ordered byte-keyed storage engine
pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn prefix(&self, prefix: &[u8]) -> Result<Vec<KeyValue>, StoreError>;

    /// Apply every write in `batch` or none of them.
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}

/// Smallest key greater than every key starting with `prefix`
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_joins_parts() {
        let key = Key::new(&["eav", "fp:1", "Bookmark/url"]);
        assert_eq!(key.as_bytes(), b"eav/fp:1/Bookmark/url");
        assert_eq!(Key::prefix(&["ave", "db/Kind", "Bookmark"]).as_bytes(), b"ave/db/Kind/Bookmark/");
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b"eav/"), Some(b"eav0".to_vec()));
        assert_eq!(prefix_upper_bound(&[b'a', 0xff]), Some(vec![b'b']));
        assert_eq!(prefix_upper_bound(&[0xff, 0xff]), None);
        assert_eq!(prefix_upper_bound(b""), None);
    }

    #[test]
    fn test_batch_last_write_wins() {
        let mut batch = WriteBatch::new();
        batch.set(b"k", b"v1".to_vec());
        batch.delete(b"k");
        assert_eq!(batch.staged(b"k"), Some(None));
        batch.set(b"k", b"v2".to_vec());
        assert_eq!(batch.staged(b"k"), Some(Some(&b"v2"[..])));
        assert_eq!(batch.staged(b"other"), None);
        assert_eq!(batch.len(), 1);
    }
}
