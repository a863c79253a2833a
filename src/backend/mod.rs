//! Data backends - pluggable storage for fragment payloads
//!
//! A backend stores opaque fragment payloads under location tokens it hands
//! out itself (`allocate`). The engine never interprets a location; it only
//! records it in the fragment's descriptor and hands it back on read.
//!
//! Built-in implementations are [`PosixBackend`] (directory tree) and
//! [`InMemoryBackend`] (process-local object store). Other storage systems
//! plug in by implementing [`DataBackend`] and passing the instance to
//! [`EsdmBuilder::with_backend`](crate::engine::EsdmBuilder::with_backend).

mod memory;
mod posix;
mod registry;

pub use memory::InMemoryBackend;
pub use posix::PosixBackend;
pub use registry::BackendRegistry;

use crate::config::{BackendConfig, BackendType, PerformanceModelConfig};
use crate::dataspace::Dataspace;
use crate::error::{EsdmError, Result};
use crate::fragment::{DatasetKey, FragmentId};
use crate::types::{Accessibility, DataType, FormatFlags};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// What a backend stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Data,
    Metadata,
}

/// Fragment shapes a data backend is willing to store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Largest payload in bytes; `None` is unbounded
    pub max_fragment_size: Option<u64>,
    /// Accepted element types; `None` accepts all
    pub data_types: Option<Vec<DataType>>,
    /// Highest accepted rank; `None` accepts all
    pub max_rank: Option<usize>,
}

impl BackendCapabilities {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_fragment_size(mut self, bytes: u64) -> Self {
        self.max_fragment_size = Some(bytes);
        self
    }

    pub fn with_data_types(mut self, types: Vec<DataType>) -> Self {
        self.data_types = Some(types);
        self
    }

    pub fn with_max_rank(mut self, rank: usize) -> Self {
        self.max_rank = Some(rank);
        self
    }

    /// Whether a fragment over `space` may be placed here
    pub fn accepts(&self, space: &Dataspace) -> bool {
        self.max_fragment_size.map_or(true, |max| space.byte_size() <= max)
            && self.max_rank.map_or(true, |max| space.rank() <= max)
            && self
                .data_types
                .as_ref()
                .map_or(true, |types| types.contains(&space.data_type()))
    }
}

/// Latency + size / throughput cost model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceModel {
    /// Fixed cost per operation, seconds
    pub latency: f64,
    /// Bytes per second
    pub throughput: f64,
}

impl PerformanceModel {
    pub fn new(latency: f64, throughput: f64) -> Self {
        Self { latency, throughput }
    }

    /// Estimated seconds to move `bytes`
    pub fn estimate(&self, bytes: u64) -> f64 {
        self.latency + bytes as f64 / self.throughput
    }
}

impl From<PerformanceModelConfig> for PerformanceModel {
    fn from(config: PerformanceModelConfig) -> Self {
        Self {
            latency: config.latency_ms / 1000.0,
            throughput: config.throughput_mbps * 1024.0 * 1024.0,
        }
    }
}

/// Static description of a registered backend
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: BackendKind,
    pub accessibility: Accessibility,
    pub capabilities: BackendCapabilities,
}

/// Outcome of a consistency check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsckReport {
    /// Payloads or entries inspected
    pub checked: usize,
    /// Structural problems that were fixed
    pub repaired: Vec<String>,
    /// Items that failed validation and were left alone
    pub corrupt: Vec<String>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
    }

    pub fn merge(&mut self, other: FsckReport) {
        self.checked += other.checked;
        self.repaired.extend(other.repaired);
        self.corrupt.extend(other.corrupt);
    }
}

/// Capability contract of a data backend.
///
/// Implementations must allow concurrent calls for distinct locations.
#[async_trait]
pub trait DataBackend: Send + Sync {
    /// Registered id, unique within an engine
    fn id(&self) -> &str;

    fn accessibility(&self) -> Accessibility {
        Accessibility::Global
    }

    fn capabilities(&self) -> &BackendCapabilities;

    /// Estimated cost of storing a fragment over `space`; lower is better
    fn performance_estimate(&self, space: &Dataspace) -> f64;

    /// Prepare the namespace for a container
    async fn create(&self, container: &str) -> Result<()>;

    /// Check that a container's namespace is usable
    async fn open(&self, container: &str) -> Result<()>;

    /// Release per-container resources
    async fn close(&self, _container: &str) -> Result<()> {
        Ok(())
    }

    /// Reserve a location for a new fragment payload
    async fn allocate(&self, dataset: &DatasetKey, fragment: FragmentId, bytes: u64) -> Result<String>;

    /// Store a payload at a freshly allocated location
    async fn write(&self, location: &str, data: &[u8]) -> Result<()>;

    async fn read(&self, location: &str) -> Result<Bytes>;

    /// Replace an existing payload
    async fn update(&self, location: &str, data: &[u8]) -> Result<()>;

    async fn remove(&self, location: &str) -> Result<()>;

    /// Locations stored for a dataset, if the backend can enumerate them
    async fn lookup(&self, _dataset: &DatasetKey) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    /// Format the backend root
    async fn mkfs(&self, flags: FormatFlags) -> Result<()>;

    /// Validate and repair the backend root
    async fn fsck(&self) -> Result<FsckReport>;

    async fn finalize(&self) -> Result<()> {
        Ok(())
    }
}

/// Build a built-in data backend from its configuration
pub async fn create_backend(config: &BackendConfig) -> Result<Arc<dyn DataBackend>> {
    match &config.backend_type {
        BackendType::Posix => Ok(Arc::new(PosixBackend::init(config).await?)),
        BackendType::Memory => Ok(Arc::new(InMemoryBackend::from_config(config))),
        BackendType::Other(name) => Err(EsdmError::Configuration(format!(
            "data backend type '{}' is not built in; implement the DataBackend trait \
             and register the instance with Esdm::builder().with_backend(..)",
            name
        ))),
    }
}

/// Capabilities implied by a backend configuration
pub(crate) fn capabilities_from_config(config: &BackendConfig) -> BackendCapabilities {
    BackendCapabilities {
        max_fragment_size: config.max_fragment_size,
        ..BackendCapabilities::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_accept() {
        let space = Dataspace::new(&[10, 20], DataType::U64).unwrap();
        assert!(BackendCapabilities::unbounded().accepts(&space));
        assert!(BackendCapabilities::unbounded().with_max_fragment_size(1600).accepts(&space));
        assert!(!BackendCapabilities::unbounded().with_max_fragment_size(1599).accepts(&space));
        assert!(!BackendCapabilities::unbounded().with_max_rank(1).accepts(&space));
        assert!(!BackendCapabilities::unbounded()
            .with_data_types(vec![DataType::F32])
            .accepts(&space));
    }

    #[test]
    fn test_performance_model() {
        let model = PerformanceModel::from(PerformanceModelConfig {
            latency_ms: 10.0,
            throughput_mbps: 1.0,
        });
        assert!((model.estimate(0) - 0.01).abs() < 1e-12);
        assert!((model.estimate(1024 * 1024) - 1.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unknown_type_is_configuration_error() {
        let config = BackendConfig::new(BackendType::Other("WOS".into()), "w", "");
        let err = create_backend(&config).await.err().unwrap();
        assert!(matches!(err, EsdmError::Configuration(_)));
    }

    #[test]
    fn test_fsck_merge() {
        let mut report = FsckReport {
            checked: 2,
            ..Default::default()
        };
        report.merge(FsckReport {
            checked: 3,
            repaired: vec!["containers".into()],
            corrupt: vec!["x.frag".into()],
        });
        assert_eq!(report.checked, 5);
        assert!(!report.is_clean());
    }
}
