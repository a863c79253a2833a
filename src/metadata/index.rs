//! Typed records on top of a [`MetadataBackend`]

use super::{container_key, dataset_key, fragment_key, fragment_prefix, MetadataBackend, DATASETS};
use crate::dataspace::Dataspace;
use crate::error::{EsdmError, Result};
use crate::fragment::{DatasetKey, FragmentDescriptor};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Persisted form of a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    /// Datasets committed under this container
    pub datasets: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            datasets: Vec::new(),
            attributes: BTreeMap::new(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// Persisted form of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub container: String,
    pub name: String,
    pub dataspace: Dataspace,
    #[serde(default)]
    pub dim_names: Option<Vec<String>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl DatasetRecord {
    pub fn new(key: &DatasetKey, dataspace: Dataspace) -> Self {
        let now = Utc::now();
        Self {
            container: key.container.clone(),
            name: key.dataset.clone(),
            dataspace,
            dim_names: None,
            attributes: BTreeMap::new(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn key(&self) -> DatasetKey {
        DatasetKey::new(&self.container, &self.name)
    }
}

/// Container, dataset and fragment records stored through one backend
#[derive(Clone)]
pub struct MetadataIndex {
    backend: Arc<dyn MetadataBackend>,
}

impl MetadataIndex {
    pub fn new(backend: Arc<dyn MetadataBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn MetadataBackend> {
        &self.backend
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let payload = self.backend.entry_retrieve(key).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.backend.entry_retrieve(key).await {
            Ok(_) => Ok(true),
            Err(EsdmError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create, or replace if the key already exists
    async fn upsert<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        match self.backend.entry_create(key, &payload).await {
            Err(EsdmError::Conflict(_)) => self.backend.entry_update(key, &payload).await,
            other => other,
        }
    }

    async fn destroy_if_present(&self, key: &str) -> Result<()> {
        match self.backend.entry_destroy(key).await {
            Err(EsdmError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn put_container(&self, record: &ContainerRecord) -> Result<()> {
        self.upsert(&container_key(&record.name), record).await
    }

    pub async fn container(&self, name: &str) -> Result<ContainerRecord> {
        self.get(&container_key(name)).await
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        self.exists(&container_key(name)).await
    }

    pub async fn put_dataset(&self, record: &DatasetRecord) -> Result<()> {
        self.upsert(&dataset_key(&record.key()), record).await
    }

    pub async fn dataset(&self, key: &DatasetKey) -> Result<DatasetRecord> {
        self.get(&dataset_key(key)).await
    }

    pub async fn dataset_exists(&self, key: &DatasetKey) -> Result<bool> {
        self.exists(&dataset_key(key)).await
    }

    /// Names of datasets with a record under `container`, sorted
    pub async fn dataset_names(&self, container: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/{}", DATASETS, container);
        let keys = self.backend.entry_list(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }

    /// Register a persisted fragment; repeating an identical registration is a no-op
    pub async fn register_fragment(&self, descriptor: &FragmentDescriptor) -> Result<()> {
        let key = fragment_key(&descriptor.dataset, descriptor.id);
        let payload = descriptor.serialize()?;
        match self.backend.entry_create(&key, &payload).await {
            Err(EsdmError::Conflict(_)) => {
                let existing = FragmentDescriptor::deserialize(&self.backend.entry_retrieve(&key).await?)?;
                if existing == *descriptor {
                    Ok(())
                } else {
                    Err(EsdmError::Conflict(format!(
                        "fragment {} is already registered with different contents",
                        descriptor.id
                    )))
                }
            }
            other => other,
        }
    }

    /// Every persisted fragment of a dataset
    pub async fn fragments(&self, dataset: &DatasetKey) -> Result<Vec<FragmentDescriptor>> {
        let mut descriptors = Vec::new();
        for key in self.backend.entry_list(&fragment_prefix(dataset)).await? {
            match self.get::<FragmentDescriptor>(&key).await {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(EsdmError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(descriptors)
    }

    pub async fn lookup(&self, dataset: &DatasetKey, query: &Dataspace) -> Result<Vec<FragmentDescriptor>> {
        self.backend.lookup(dataset, query).await
    }

    /// Drop a dataset's record and fragment records; returns the fragments removed
    pub async fn remove_dataset(&self, dataset: &DatasetKey) -> Result<Vec<FragmentDescriptor>> {
        let descriptors = self.fragments(dataset).await?;
        for descriptor in &descriptors {
            self.destroy_if_present(&fragment_key(dataset, descriptor.id)).await?;
        }
        self.destroy_if_present(&dataset_key(dataset)).await?;
        Ok(descriptors)
    }

    /// Drop a container and everything registered under it
    pub async fn remove_container(&self, container: &str) -> Result<Vec<FragmentDescriptor>> {
        let mut removed = Vec::new();
        for name in self.dataset_names(container).await? {
            removed.extend(self.remove_dataset(&DatasetKey::new(container, name)).await?);
        }
        self.destroy_if_present(&container_key(container)).await?;
        Ok(removed)
    }
}

impl std::fmt::Debug for MetadataIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataIndex")
            .field("backend", &self.backend.id())
            .finish()
    }
}
