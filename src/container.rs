//! Containers - named collections of datasets

use crate::dataset::{CommitReport, Dataset, DatasetState};
use crate::dataspace::Dataspace;
use crate::engine::EngineInner;
use crate::error::{EsdmError, Result};
use crate::fragment::DatasetKey;
use crate::metadata::ContainerRecord;
use crate::observe::EngineEvent;
use crate::utils::validate_name;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct ContainerState {
    name: String,
    datasets: RwLock<BTreeMap<String, Arc<DatasetState>>>,
    attributes: RwLock<BTreeMap<String, Value>>,
    created_at: DateTime<Utc>,
}

impl ContainerState {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datasets: RwLock::new(BTreeMap::new()),
            attributes: RwLock::new(BTreeMap::new()),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn from_record(record: ContainerRecord) -> Self {
        Self {
            name: record.name,
            datasets: RwLock::new(BTreeMap::new()),
            attributes: RwLock::new(record.attributes),
            created_at: record.created_at,
        }
    }
}

/// Handle to a container; clones share state
#[derive(Clone)]
pub struct Container {
    engine: Arc<EngineInner>,
    state: Arc<ContainerState>,
}

impl Container {
    pub(crate) fn new(engine: Arc<EngineInner>, state: Arc<ContainerState>) -> Self {
        Self { engine, state }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    fn key(&self, dataset: &str) -> DatasetKey {
        DatasetKey::new(&self.state.name, dataset)
    }

    fn handle(&self, state: Arc<DatasetState>) -> Dataset {
        Dataset::new(Arc::clone(&self.engine), state)
    }

    /// Create a dataset with a fixed shape; `Conflict` if the name is taken
    pub async fn dataset_create(&self, name: &str, dataspace: Dataspace) -> Result<Dataset> {
        validate_name("dataset", name)?;
        let key = self.key(name);
        if self.engine.metadata.dataset_exists(&key).await? {
            return Err(EsdmError::Conflict(format!("dataset {} already exists", key)));
        }

        let mut datasets = self.state.datasets.write();
        if datasets.contains_key(name) {
            return Err(EsdmError::Conflict(format!("dataset {} already exists", key)));
        }
        let state = Arc::new(DatasetState::new(key, dataspace));
        datasets.insert(name.to_string(), Arc::clone(&state));
        drop(datasets);
        Ok(self.handle(state))
    }

    /// Open a dataset created in this process or committed earlier
    pub async fn dataset_open(&self, name: &str) -> Result<Dataset> {
        if let Some(state) = self.state.datasets.read().get(name) {
            return Ok(self.handle(Arc::clone(state)));
        }

        let record = self.engine.metadata.dataset(&self.key(name)).await?;
        let state = Arc::clone(
            self.state
                .datasets
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(DatasetState::from_record(record))),
        );
        Ok(self.handle(state))
    }

    /// Release a dataset's in-memory state; committed data is kept
    pub fn dataset_destroy(&self, name: &str) -> Result<()> {
        self.state
            .datasets
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EsdmError::NotFound(format!("dataset {} is not open", self.key(name))))
    }

    pub async fn dataset_exists(&self, name: &str) -> Result<bool> {
        if self.state.datasets.read().contains_key(name) {
            return Ok(true);
        }
        self.engine.metadata.dataset_exists(&self.key(name)).await
    }

    /// Open and committed dataset names, sorted
    pub async fn dataset_names(&self) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> = self.state.datasets.read().keys().cloned().collect();
        names.extend(self.engine.metadata.dataset_names(&self.state.name).await?);
        Ok(names.into_iter().collect())
    }

    /// Commit every open dataset, then register the container record
    pub async fn commit(&self) -> Result<CommitReport> {
        let datasets: Vec<Arc<DatasetState>> = self.state.datasets.read().values().cloned().collect();

        let mut report = CommitReport::default();
        for state in &datasets {
            report.merge(self.handle(Arc::clone(state)).commit().await?);
        }

        let names = self.dataset_names().await?;
        let record = ContainerRecord {
            name: self.state.name.clone(),
            datasets: names,
            attributes: self.state.attributes.read().clone(),
            created_at: self.state.created_at,
            modified_at: Utc::now(),
        };
        self.engine.metadata.put_container(&record).await?;

        self.engine.observer.on_event(&EngineEvent::ContainerCommitted {
            container: &self.state.name,
            datasets: datasets.len(),
        });
        Ok(report)
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.attributes.write().insert(key.into(), value.into());
    }

    pub fn attributes(&self) -> BTreeMap<String, Value> {
        self.state.attributes.read().clone()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.state.name)
            .finish()
    }
}
