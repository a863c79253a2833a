//! Process-local metadata store

use super::MetadataBackend;
use crate::backend::FsckReport;
use crate::error::{EsdmError, Result};
use crate::types::FormatFlags;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Entries in an ordered map; nothing survives the process.
#[derive(Debug)]
pub struct InMemoryMetadata {
    id: String,
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl InMemoryMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn not_found(&self, key: &str) -> EsdmError {
        EsdmError::NotFound(format!("entry '{}' in metadata backend '{}'", key, self.id))
    }
}

#[async_trait]
impl MetadataBackend for InMemoryMetadata {
    fn id(&self) -> &str {
        &self.id
    }

    async fn entry_create(&self, key: &str, payload: &[u8]) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Err(EsdmError::Conflict(format!("entry '{}' already exists", key)));
        }
        entries.insert(key.to_string(), Bytes::copy_from_slice(payload));
        Ok(())
    }

    async fn entry_retrieve(&self, key: &str) -> Result<Bytes> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| self.not_found(key))
    }

    async fn entry_update(&self, key: &str, payload: &[u8]) -> Result<()> {
        match self.entries.write().get_mut(key) {
            Some(entry) => {
                *entry = Bytes::copy_from_slice(payload);
                Ok(())
            }
            None => Err(self.not_found(key)),
        }
    }

    async fn entry_destroy(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| self.not_found(key))
    }

    async fn entry_list(&self, prefix: &str) -> Result<Vec<String>> {
        let start = format!("{}/", prefix);
        Ok(self
            .entries
            .read()
            .range(start.clone()..)
            .take_while(|(key, _)| key.starts_with(&start))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn mkfs(&self, flags: FormatFlags) -> Result<()> {
        if flags.contains(FormatFlags::DELETE) {
            self.entries.write().clear();
        }
        Ok(())
    }

    async fn fsck(&self) -> Result<FsckReport> {
        let entries = self.entries.read();
        let corrupt = entries
            .iter()
            .filter(|(_, payload)| serde_json::from_slice::<serde_json::Value>(payload).is_err())
            .map(|(key, _)| key.clone())
            .collect();
        Ok(FsckReport {
            checked: entries.len(),
            repaired: Vec::new(),
            corrupt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entry_crud() {
        let md = InMemoryMetadata::new("md");
        md.entry_create("containers/a", b"{}").await.unwrap();
        assert!(matches!(
            md.entry_create("containers/a", b"{}").await,
            Err(EsdmError::Conflict(_))
        ));
        assert_eq!(&md.entry_retrieve("containers/a").await.unwrap()[..], b"{}");

        md.entry_update("containers/a", b"[]").await.unwrap();
        assert_eq!(&md.entry_retrieve("containers/a").await.unwrap()[..], b"[]");
        assert!(matches!(
            md.entry_update("containers/b", b"[]").await,
            Err(EsdmError::NotFound(_))
        ));

        md.entry_destroy("containers/a").await.unwrap();
        assert!(matches!(
            md.entry_retrieve("containers/a").await,
            Err(EsdmError::NotFound(_))
        ));
        assert!(md.is_empty());
    }

    #[tokio::test]
    async fn test_list_is_prefix_scoped() {
        let md = InMemoryMetadata::new("md");
        for key in ["datasets/c/a", "datasets/c/b", "datasets/cc/x", "datasets/c"] {
            md.entry_create(key, b"{}").await.unwrap();
        }
        assert_eq!(
            md.entry_list("datasets/c").await.unwrap(),
            vec!["datasets/c/a", "datasets/c/b"]
        );
    }

    #[tokio::test]
    async fn test_fsck_and_mkfs() {
        let md = InMemoryMetadata::new("md");
        md.entry_create("a/x", b"{}").await.unwrap();
        md.entry_create("a/y", b"not json").await.unwrap();
        let report = md.fsck().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.corrupt, vec!["a/y".to_string()]);

        md.mkfs(FormatFlags::PURGE_RECREATE).await.unwrap();
        assert_eq!(md.len(), 0);
    }
}
