//! Metadata backends and the fragment index
//!
//! A metadata backend is a durable key/value entry store. Keys are
//! path-like:
//!
//! ```text
//! containers/<container>
//! datasets/<container>/<dataset>
//! fragments/<container>/<dataset>/<fragment-id>
//! ```
//!
//! Payloads are JSON records (see [`index`]). Each entry is written
//! atomically: readers see either the whole record or no record.

mod index;
mod memory;
mod posix;

pub use index::{ContainerRecord, DatasetRecord, MetadataIndex};
pub use memory::InMemoryMetadata;
pub use posix::PosixMetadata;

use crate::backend::FsckReport;
use crate::config::{BackendType, MetadataConfig};
use crate::dataspace::Dataspace;
use crate::error::{EsdmError, Result};
use crate::fragment::{DatasetKey, FragmentDescriptor, FragmentId};
use crate::types::{Accessibility, FormatFlags};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

pub const CONTAINERS: &str = "containers";
pub const DATASETS: &str = "datasets";
pub const FRAGMENTS: &str = "fragments";

pub fn container_key(container: &str) -> String {
    format!("{}/{}", CONTAINERS, container)
}

pub fn dataset_key(dataset: &DatasetKey) -> String {
    format!("{}/{}/{}", DATASETS, dataset.container, dataset.dataset)
}

pub fn fragment_key(dataset: &DatasetKey, fragment: FragmentId) -> String {
    format!("{}/{}", fragment_prefix(dataset), fragment)
}

/// Parent key of every fragment entry of `dataset`
pub fn fragment_prefix(dataset: &DatasetKey) -> String {
    format!("{}/{}/{}", FRAGMENTS, dataset.container, dataset.dataset)
}

/// Entry store holding container, dataset and fragment records.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    fn id(&self) -> &str;

    fn accessibility(&self) -> Accessibility {
        Accessibility::Global
    }

    /// Store a new entry; `Conflict` if the key exists
    async fn entry_create(&self, key: &str, payload: &[u8]) -> Result<()>;

    /// `NotFound` if the key is absent
    async fn entry_retrieve(&self, key: &str) -> Result<Bytes>;

    /// Replace an existing entry; `NotFound` if the key is absent
    async fn entry_update(&self, key: &str, payload: &[u8]) -> Result<()>;

    async fn entry_destroy(&self, key: &str) -> Result<()>;

    /// Every key below `prefix/`, sorted
    async fn entry_list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Persisted fragments of `dataset` whose region overlaps `query`.
    ///
    /// Fails with `NotFound` when the dataset has no record. The result is
    /// unordered.
    async fn lookup(&self, dataset: &DatasetKey, query: &Dataspace) -> Result<Vec<FragmentDescriptor>> {
        self.entry_retrieve(&dataset_key(dataset)).await?;

        let mut found = Vec::new();
        for key in self.entry_list(&fragment_prefix(dataset)).await? {
            let payload = match self.entry_retrieve(&key).await {
                Ok(payload) => payload,
                // destroyed between list and retrieve
                Err(EsdmError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let descriptor = FragmentDescriptor::deserialize(&payload)?;
            if descriptor.space.overlaps(query) {
                found.push(descriptor);
            }
        }
        Ok(found)
    }

    /// Largest commit sequence number registered so far, 0 if none
    async fn max_sequence(&self) -> Result<u64> {
        let mut max = 0;
        for key in self.entry_list(FRAGMENTS).await? {
            match self.entry_retrieve(&key).await {
                Ok(payload) => match FragmentDescriptor::deserialize(&payload) {
                    Ok(descriptor) => max = max.max(descriptor.sequence),
                    Err(err) => warn!(key = %key, %err, "skipping unreadable fragment record"),
                },
                Err(EsdmError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(max)
    }

    async fn mkfs(&self, flags: FormatFlags) -> Result<()>;

    async fn fsck(&self) -> Result<FsckReport>;

    async fn finalize(&self) -> Result<()> {
        Ok(())
    }
}

/// Build a built-in metadata backend from its configuration
pub async fn create_metadata_backend(config: &MetadataConfig) -> Result<Arc<dyn MetadataBackend>> {
    match &config.backend_type {
        BackendType::Posix => {
            if config.target.is_empty() {
                return Err(EsdmError::Configuration(format!(
                    "POSIX metadata backend '{}' needs a target directory",
                    config.id
                )));
            }
            Ok(Arc::new(PosixMetadata::init(config).await?))
        }
        BackendType::Memory => Ok(Arc::new(InMemoryMetadata::new(&config.id))),
        BackendType::Other(name) => Err(EsdmError::Configuration(format!(
            "metadata backend type '{}' is not built in; implement the MetadataBackend trait \
             and register the instance with Esdm::builder().with_metadata(..)",
            name
        ))),
    }
}
