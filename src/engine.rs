//! Engine - backend wiring, container lifecycle, mkfs/fsck

use crate::backend::{create_backend, BackendDescriptor, BackendKind, BackendRegistry, DataBackend, FsckReport};
use crate::config::EsdmConfig;
use crate::container::{Container, ContainerState};
use crate::error::{EsdmError, Result};
use crate::metadata::{create_metadata_backend, InMemoryMetadata, MetadataBackend, MetadataIndex};
use crate::observe::{EngineObserver, TracingObserver};
use crate::types::{Accessibility, FormatFlags};
use crate::utils::validate_name;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

const DEFAULT_MAX_CONCURRENT_IO: usize = 16;

/// State shared by the engine and every container and dataset handle
pub(crate) struct EngineInner {
    pub(crate) registry: BackendRegistry,
    pub(crate) metadata: MetadataIndex,
    pub(crate) observer: Arc<dyn EngineObserver>,
    sequence: AtomicU64,
    io_limit: Semaphore,
    io_timeout: Option<Duration>,
    containers: RwLock<HashMap<String, Arc<ContainerState>>>,
}

impl EngineInner {
    /// Next commit sequence number; strictly increasing
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn default_deadline(&self) -> Option<Instant> {
        self.io_timeout.map(|timeout| Instant::now() + timeout)
    }

    /// Run backend I/O under a worker-pool permit and an optional deadline
    pub(crate) async fn run_io<T>(
        &self,
        deadline: Option<Instant>,
        io: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let work = async {
            let _permit = self
                .io_limit
                .acquire()
                .await
                .map_err(|_| EsdmError::backend("engine", "I/O pool is closed"))?;
            io.await
        };
        match deadline {
            Some(deadline) => timeout_at(deadline, work)
                .await
                .map_err(|_| EsdmError::Timeout("backend I/O deadline expired".to_string()))?,
            None => work.await,
        }
    }
}

/// Builds an [`Esdm`] from configuration and/or pre-built backends
#[derive(Default)]
pub struct EsdmBuilder {
    config: Option<EsdmConfig>,
    backends: Vec<Arc<dyn DataBackend>>,
    metadata: Option<Arc<dyn MetadataBackend>>,
    observer: Option<Arc<dyn EngineObserver>>,
    max_concurrent_io: Option<usize>,
    io_timeout: Option<Duration>,
}

impl EsdmBuilder {
    /// Backends and settings from a configuration document
    pub fn with_config(mut self, config: EsdmConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register a data backend after any configured ones
    pub fn with_backend(mut self, backend: Arc<dyn DataBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Use this metadata backend instead of the configured one
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataBackend>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_max_concurrent_io(mut self, permits: usize) -> Self {
        self.max_concurrent_io = Some(permits);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub async fn build(self) -> Result<Esdm> {
        let mut registry = BackendRegistry::new();
        if let Some(config) = &self.config {
            config.validate()?;
            for backend in &config.backends {
                registry.register(create_backend(backend).await?)?;
            }
        }
        for backend in self.backends {
            registry.register(backend)?;
        }
        if registry.is_empty() {
            return Err(EsdmError::Configuration(
                "at least one data backend is required".to_string(),
            ));
        }

        let metadata = match (self.metadata, &self.config) {
            (Some(metadata), _) => metadata,
            (None, Some(config)) => create_metadata_backend(&config.metadata).await?,
            (None, None) => Arc::new(InMemoryMetadata::new("md")),
        };

        let permits = self
            .max_concurrent_io
            .or_else(|| self.config.as_ref().map(|c| c.max_concurrent_io))
            .unwrap_or(DEFAULT_MAX_CONCURRENT_IO);
        if permits == 0 {
            return Err(EsdmError::Configuration(
                "max-concurrent-io must be positive".to_string(),
            ));
        }
        let io_timeout = self
            .io_timeout
            .or_else(|| self.config.as_ref().and_then(EsdmConfig::io_timeout));

        let last_sequence = metadata.max_sequence().await?;
        info!(
            backends = ?registry,
            metadata = metadata.id(),
            last_sequence,
            "ESDM engine initialized"
        );

        Ok(Esdm {
            inner: Arc::new(EngineInner {
                registry,
                metadata: MetadataIndex::new(metadata),
                observer: self.observer.unwrap_or_else(|| Arc::new(TracingObserver)),
                sequence: AtomicU64::new(last_sequence),
                io_limit: Semaphore::new(permits),
                io_timeout,
                containers: RwLock::new(HashMap::new()),
            }),
        })
    }
}

/// Engine handle; clones share the same backends and open containers
#[derive(Clone)]
pub struct Esdm {
    inner: Arc<EngineInner>,
}

impl Esdm {
    pub fn builder() -> EsdmBuilder {
        EsdmBuilder::default()
    }

    /// Build an engine from configuration
    pub async fn init(config: EsdmConfig) -> Result<Self> {
        Self::builder().with_config(config).build().await
    }

    /// Build an engine from a JSON configuration document
    pub async fn from_json_str(json: &str) -> Result<Self> {
        Self::init(EsdmConfig::from_json_str(json)?).await
    }

    fn handle(&self, state: Arc<ContainerState>) -> Container {
        Container::new(Arc::clone(&self.inner), state)
    }

    /// Create a container; it is registered with the metadata backend on commit
    pub async fn container_create(&self, name: &str) -> Result<Container> {
        validate_name("container", name)?;
        let open = self.inner.containers.read().contains_key(name);
        if open || self.inner.metadata.container_exists(name).await? {
            return Err(EsdmError::Conflict(format!("container '{}' already exists", name)));
        }

        for backend in self.inner.registry.iter() {
            backend.create(name).await?;
        }

        let mut containers = self.inner.containers.write();
        if containers.contains_key(name) {
            return Err(EsdmError::Conflict(format!("container '{}' already exists", name)));
        }
        let state = Arc::new(ContainerState::new(name));
        containers.insert(name.to_string(), Arc::clone(&state));
        drop(containers);

        debug!(container = name, "container created");
        Ok(self.handle(state))
    }

    /// Open a container created in this process or committed earlier
    pub async fn container_open(&self, name: &str) -> Result<Container> {
        if let Some(state) = self.inner.containers.read().get(name) {
            return Ok(self.handle(Arc::clone(state)));
        }

        let record = self.inner.metadata.container(name).await?;
        for backend in self.inner.registry.iter() {
            backend.open(name).await?;
        }

        let state = Arc::clone(
            self.inner
                .containers
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ContainerState::from_record(record))),
        );
        Ok(self.handle(state))
    }

    /// Release a container's in-memory state; committed data is kept
    pub async fn container_destroy(&self, name: &str) -> Result<()> {
        if self.inner.containers.write().remove(name).is_none() {
            return Err(EsdmError::NotFound(format!("container '{}' is not open", name)));
        }
        for backend in self.inner.registry.iter() {
            backend.close(name).await?;
        }
        Ok(())
    }

    /// Remove a container's metadata records and fragment payloads
    pub async fn container_delete(&self, name: &str) -> Result<()> {
        validate_name("container", name)?;
        let was_open = self.inner.containers.write().remove(name).is_some();
        let registered = self.inner.metadata.container_exists(name).await?;
        let removed = self.inner.metadata.remove_container(name).await?;
        if !was_open && !registered && removed.is_empty() {
            return Err(EsdmError::NotFound(format!("container '{}'", name)));
        }

        let mut first_error = None;
        for descriptor in &removed {
            let location = &descriptor.location;
            let Some(backend) = self.inner.registry.get(&location.backend) else {
                warn!(backend = %location.backend, fragment = %descriptor.id, "payload on unknown backend left in place");
                continue;
            };
            match backend.remove(&location.location).await {
                Ok(()) | Err(EsdmError::NotFound(_)) => {}
                Err(err) => {
                    warn!(backend = %location.backend, fragment = %descriptor.id, %err, "failed to remove payload");
                    first_error.get_or_insert(err);
                }
            }
        }
        info!(container = name, fragments = removed.len(), "container deleted");
        first_error.map_or(Ok(()), Err)
    }

    /// Format every backend whose accessibility matches `target`
    pub async fn mkfs(&self, flags: FormatFlags, target: Accessibility) -> Result<()> {
        for backend in self.inner.registry.iter() {
            if backend.accessibility() == target {
                info!(backend = backend.id(), flags = flags.bits(), "formatting data backend");
                backend.mkfs(flags).await?;
            }
        }
        let metadata = self.inner.metadata.backend();
        if metadata.accessibility() == target {
            info!(backend = metadata.id(), flags = flags.bits(), "formatting metadata backend");
            metadata.mkfs(flags).await?;
        }
        if flags.contains(FormatFlags::DELETE) {
            self.inner.containers.write().clear();
        }
        Ok(())
    }

    /// Check and repair every backend
    pub async fn fsck(&self) -> Result<FsckReport> {
        let mut report = FsckReport::default();
        for backend in self.inner.registry.iter() {
            report.merge(backend.fsck().await?);
        }
        report.merge(self.inner.metadata.backend().fsck().await?);
        Ok(report)
    }

    /// Finalize every backend
    pub async fn finalize(&self) -> Result<()> {
        self.inner.containers.write().clear();
        for backend in self.inner.registry.iter() {
            backend.finalize().await?;
        }
        self.inner.metadata.backend().finalize().await
    }

    /// Registered data backends followed by the metadata backend
    pub fn backends(&self) -> Vec<BackendDescriptor> {
        let mut descriptors = self.inner.registry.descriptors();
        let metadata = self.inner.metadata.backend();
        descriptors.push(BackendDescriptor {
            name: metadata.id().to_string(),
            kind: BackendKind::Metadata,
            accessibility: metadata.accessibility(),
            capabilities: Default::default(),
        });
        descriptors
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.inner.registry
    }

    pub fn metadata(&self) -> &MetadataIndex {
        &self.inner.metadata
    }
}

impl std::fmt::Debug for Esdm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Esdm")
            .field("backends", &self.inner.registry)
            .field("metadata", &self.inner.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::dataspace::Dataspace;
    use crate::types::DataType;

    #[tokio::test]
    async fn test_build_requires_backend() {
        assert!(matches!(
            Esdm::builder().build().await,
            Err(EsdmError::Configuration(_))
        ));
        assert!(matches!(
            Esdm::builder()
                .with_backend(Arc::new(InMemoryBackend::new("m")))
                .with_max_concurrent_io(0)
                .build()
                .await,
            Err(EsdmError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_builder_appends_to_config() {
        let esdm = Esdm::builder()
            .with_config(EsdmConfig::in_memory())
            .with_backend(Arc::new(InMemoryBackend::new("extra")))
            .build()
            .await
            .unwrap();
        let names: Vec<_> = esdm.backends().into_iter().map(|d| (d.name, d.kind)).collect();
        assert_eq!(
            names,
            vec![
                ("mem".to_string(), BackendKind::Data),
                ("extra".to_string(), BackendKind::Data),
                ("md".to_string(), BackendKind::Metadata),
            ]
        );

        assert!(matches!(
            Esdm::builder()
                .with_config(EsdmConfig::in_memory())
                .with_backend(Arc::new(InMemoryBackend::new("mem")))
                .build()
                .await,
            Err(EsdmError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let esdm = Esdm::init(EsdmConfig::in_memory()).await.unwrap();
        let container = esdm.container_create("c").await.unwrap();
        assert!(matches!(esdm.container_create("c").await, Err(EsdmError::Conflict(_))));
        assert!(matches!(esdm.container_open("x").await, Err(EsdmError::NotFound(_))));

        let space = Dataspace::new(&[2], DataType::U8).unwrap();
        let ds = container.dataset_create("d", space.clone()).await.unwrap();
        ds.write(&[7, 8], &space).unwrap();
        container.commit().await.unwrap();

        esdm.container_destroy("c").await.unwrap();
        assert!(matches!(esdm.container_destroy("c").await, Err(EsdmError::NotFound(_))));
        assert!(matches!(esdm.container_create("c").await, Err(EsdmError::Conflict(_))));

        let reopened = esdm.container_open("c").await.unwrap();
        let ds = reopened.dataset_open("d").await.unwrap();
        assert_eq!(ds.read_elements::<u8>(&space).await.unwrap(), vec![7, 8]);

        esdm.container_delete("c").await.unwrap();
        assert!(matches!(esdm.container_open("c").await, Err(EsdmError::NotFound(_))));
        assert!(matches!(esdm.container_delete("c").await, Err(EsdmError::NotFound(_))));
        esdm.container_create("c").await.unwrap();
    }

    #[tokio::test]
    async fn test_sequence_is_seeded_from_metadata() {
        let metadata: Arc<dyn MetadataBackend> = Arc::new(InMemoryMetadata::new("md"));
        let build = || {
            Esdm::builder()
                .with_backend(Arc::new(InMemoryBackend::new("m")))
                .with_metadata(Arc::clone(&metadata))
                .build()
        };

        let first = build().await.unwrap();
        let space = Dataspace::new(&[1], DataType::U8).unwrap();
        let ds = first
            .container_create("c")
            .await
            .unwrap()
            .dataset_create("d", space.clone())
            .await
            .unwrap();
        ds.write(&[1], &space).unwrap();
        ds.write(&[2], &space).unwrap();
        ds.commit().await.unwrap();

        let second = build().await.unwrap();
        assert_eq!(second.inner.next_sequence(), 3);
    }

    #[tokio::test]
    async fn test_run_io_deadline() {
        let esdm = Esdm::init(EsdmConfig::in_memory()).await.unwrap();
        let expired = Instant::now();
        let result = esdm
            .inner
            .run_io(Some(expired), async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(EsdmError::Timeout(_))));
        esdm.inner.run_io(None, async { Ok(()) }).await.unwrap();
    }
}
