//! Process-local object store backend

use super::{capabilities_from_config, BackendCapabilities, DataBackend, FsckReport, PerformanceModel};
use crate::config::BackendConfig;
use crate::dataspace::Dataspace;
use crate::error::{EsdmError, Result};
use crate::fragment::{DatasetKey, FragmentId};
use crate::types::{Accessibility, FormatFlags};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

/// Keeps payloads in a concurrent map; nothing survives the process.
#[derive(Debug)]
pub struct InMemoryBackend {
    id: String,
    accessibility: Accessibility,
    capabilities: BackendCapabilities,
    model: PerformanceModel,
    objects: DashMap<String, Bytes>,
}

impl InMemoryBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            accessibility: Accessibility::NodeLocal,
            capabilities: BackendCapabilities::unbounded(),
            model: PerformanceModel::new(0.0, 10.0 * 1024.0 * 1024.0 * 1024.0),
            objects: DashMap::new(),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            accessibility: config.accessibility.unwrap_or(Accessibility::NodeLocal),
            capabilities: capabilities_from_config(config),
            model: config.performance_model.into(),
            ..Self::new(&config.id)
        }
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_performance_model(mut self, model: PerformanceModel) -> Self {
        self.model = model;
        self
    }

    /// Number of stored payloads
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn not_found(&self, location: &str) -> EsdmError {
        EsdmError::NotFound(format!("{} on backend '{}'", location, self.id))
    }
}

#[async_trait]
impl DataBackend for InMemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn accessibility(&self) -> Accessibility {
        self.accessibility
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn performance_estimate(&self, space: &Dataspace) -> f64 {
        self.model.estimate(space.byte_size())
    }

    // Flat namespace: containers need no preparation.
    async fn create(&self, _container: &str) -> Result<()> {
        Ok(())
    }

    async fn open(&self, _container: &str) -> Result<()> {
        Ok(())
    }

    async fn allocate(&self, dataset: &DatasetKey, fragment: FragmentId, _bytes: u64) -> Result<String> {
        Ok(format!("{}/{}/{}", dataset.container, dataset.dataset, fragment))
    }

    async fn write(&self, location: &str, data: &[u8]) -> Result<()> {
        self.objects
            .insert(location.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn read(&self, location: &str) -> Result<Bytes> {
        self.objects
            .get(location)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| self.not_found(location))
    }

    async fn update(&self, location: &str, data: &[u8]) -> Result<()> {
        match self.objects.get_mut(location) {
            Some(mut entry) => {
                *entry = Bytes::copy_from_slice(data);
                Ok(())
            }
            None => Err(self.not_found(location)),
        }
    }

    async fn remove(&self, location: &str) -> Result<()> {
        self.objects
            .remove(location)
            .map(|_| ())
            .ok_or_else(|| self.not_found(location))
    }

    async fn lookup(&self, dataset: &DatasetKey) -> Result<Option<Vec<String>>> {
        let prefix = format!("{}/{}/", dataset.container, dataset.dataset);
        let mut locations: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();
        locations.sort();
        Ok(Some(locations))
    }

    async fn mkfs(&self, flags: FormatFlags) -> Result<()> {
        if flags.contains(FormatFlags::DELETE) {
            self.objects.clear();
        }
        Ok(())
    }

    async fn fsck(&self) -> Result<FsckReport> {
        Ok(FsckReport {
            checked: self.objects.len(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendType;
    use crate::types::DataType;

    #[tokio::test]
    async fn test_object_lifecycle() {
        let backend = InMemoryBackend::new("m");
        let key = DatasetKey::new("c", "d");
        let location = backend.allocate(&key, FragmentId::new(), 4).await.unwrap();

        backend.write(&location, b"abcd").await.unwrap();
        assert_eq!(&backend.read(&location).await.unwrap()[..], b"abcd");
        backend.update(&location, b"efgh").await.unwrap();
        assert_eq!(&backend.read(&location).await.unwrap()[..], b"efgh");

        assert_eq!(backend.lookup(&key).await.unwrap(), Some(vec![location.clone()]));
        assert_eq!(
            backend.lookup(&DatasetKey::new("c", "other")).await.unwrap(),
            Some(vec![])
        );

        backend.remove(&location).await.unwrap();
        assert!(backend.is_empty());
        assert!(matches!(backend.remove(&location).await, Err(EsdmError::NotFound(_))));
        assert!(matches!(backend.update(&location, b"x").await, Err(EsdmError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_mkfs_delete_clears() {
        let backend = InMemoryBackend::new("m");
        backend.write("a", b"1").await.unwrap();
        backend.mkfs(FormatFlags::CREATE).await.unwrap();
        assert_eq!(backend.fsck().await.unwrap().checked, 1);
        backend.mkfs(FormatFlags::PURGE_RECREATE).await.unwrap();
        assert!(backend.is_empty());
    }

    #[test]
    fn test_from_config() {
        let config = BackendConfig::new(BackendType::Memory, "m1", "").with_max_fragment_size(64);
        let backend = InMemoryBackend::from_config(&config);
        assert_eq!(backend.id(), "m1");
        assert_eq!(backend.accessibility(), Accessibility::NodeLocal);

        let small = Dataspace::new(&[8], DataType::U64).unwrap();
        let large = Dataspace::new(&[9], DataType::U64).unwrap();
        assert!(backend.capabilities().accepts(&small));
        assert!(!backend.capabilities().accepts(&large));
        assert!(backend.performance_estimate(&large) > backend.performance_estimate(&small));

        let mut shared = BackendConfig::new(BackendType::Memory, "m2", "");
        shared.accessibility = Some(Accessibility::Global);
        assert_eq!(InMemoryBackend::from_config(&shared).accessibility(), Accessibility::Global);
    }
}
