//! ESDM - Earth System Data Middleware
//!
//! A storage engine for N-dimensional scientific arrays. Datasets are
//! written as fragments (contiguous rectangular regions) that are placed on
//! pluggable data backends and indexed by a metadata backend, so reads can
//! reassemble any region from whatever fragments cover it.
//!
//! # Features
//!
//! - Dataspaces up to 16 dimensions with absolute-offset subspaces
//! - Writes are staged and become visible on commit; the last commit wins
//!   where fragments overlap
//! - Cost-based placement across data backends, with tiling to each
//!   backend's fragment size bound
//! - POSIX and in-memory backends built in; implement [`DataBackend`] or
//!   [`MetadataBackend`] for other storage
//! - Optional Deflate/Zstd payload compression with CRC-32 verification
//! - Async I/O throughout
//!
//! # Example
//!
//! ```rust,no_run
//! use esdm::{DataType, Dataspace, Esdm, EsdmConfig};
//!
//! # async fn example() -> esdm::Result<()> {
//! let esdm = Esdm::init(EsdmConfig::in_memory()).await?;
//! let container = esdm.container_create("run1").await?;
//! let space = Dataspace::new(&[10, 20], DataType::U64)?;
//! let temperature = container.dataset_create("temperature", space.clone()).await?;
//!
//! let values: Vec<u64> = (0..200).collect();
//! temperature.write_elements(&values, &space)?;
//! container.commit().await?.into_result()?;
//!
//! let slab = space.subspace(&[5, 20], &[5, 0])?;
//! let back: Vec<u64> = temperature.read_elements(&slab).await?;
//! assert_eq!(back[0], 100);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod compression;
pub mod config;
pub mod container;
pub mod dataset;
pub mod dataspace;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod gather;
pub mod layout;
pub mod metadata;
pub mod observe;
pub mod types;
pub mod utils;

// Re-exports
pub use backend::{BackendCapabilities, BackendRegistry, DataBackend, InMemoryBackend, PosixBackend};
pub use compression::{Codec, CompressionMethod};
pub use config::{BackendConfig, BackendType, EsdmConfig, MetadataConfig};
pub use container::Container;
pub use dataset::{CommitReport, Dataset, DatasetStats};
pub use dataspace::{Dataspace, MAX_DIMS};
pub use engine::{Esdm, EsdmBuilder};
pub use error::{EsdmError, Result};
pub use fragment::{CommitState, DatasetKey, Fragment, FragmentDescriptor, FragmentId};
pub use metadata::{InMemoryMetadata, MetadataBackend, MetadataIndex, PosixMetadata};
pub use observe::{EngineEvent, EngineObserver, TracingObserver};
pub use types::{Accessibility, DataType, Element, FormatFlags};

/// Version of the ESDM implementation
pub const ESDM_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!ESDM_VERSION.is_empty());
    }
}
