//! Engine observability hook
//!
//! The engine reports state transitions to an injected [`EngineObserver`]
//! rather than printing. [`TracingObserver`] is the default and forwards
//! everything to `tracing`.

use crate::error::EsdmError;
use crate::fragment::{DatasetKey, FragmentId};

/// A state transition inside the engine
#[derive(Debug)]
pub enum EngineEvent<'a> {
    FragmentStaged {
        dataset: &'a DatasetKey,
        fragment: FragmentId,
        bytes: u64,
        backend: &'a str,
    },
    FragmentPersisted {
        dataset: &'a DatasetKey,
        fragment: FragmentId,
        backend: &'a str,
        sequence: u64,
    },
    FragmentCommitFailed {
        dataset: &'a DatasetKey,
        fragment: FragmentId,
        error: &'a EsdmError,
    },
    DatasetCommitted {
        dataset: &'a DatasetKey,
        persisted: usize,
        failed: usize,
    },
    ContainerCommitted {
        container: &'a str,
        datasets: usize,
    },
    ReadCompleted {
        dataset: &'a DatasetKey,
        fragments: usize,
        bytes: u64,
    },
}

/// Receives engine events. Must be cheap and must not block.
pub trait EngineObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent<'_>);
}

/// Forwards engine events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl EngineObserver for TracingObserver {
    fn on_event(&self, event: &EngineEvent<'_>) {
        match event {
            EngineEvent::FragmentStaged {
                dataset,
                fragment,
                bytes,
                backend,
            } => tracing::trace!(%dataset, %fragment, bytes, backend, "fragment staged"),
            EngineEvent::FragmentPersisted {
                dataset,
                fragment,
                backend,
                sequence,
            } => tracing::debug!(%dataset, %fragment, backend, sequence, "fragment persisted"),
            EngineEvent::FragmentCommitFailed {
                dataset,
                fragment,
                error,
            } => tracing::warn!(%dataset, %fragment, %error, "fragment commit failed"),
            EngineEvent::DatasetCommitted {
                dataset,
                persisted,
                failed,
            } => tracing::info!(%dataset, persisted, failed, "dataset committed"),
            EngineEvent::ContainerCommitted {
                container,
                datasets,
            } => tracing::info!(container, datasets, "container committed"),
            EngineEvent::ReadCompleted {
                dataset,
                fragments,
                bytes,
            } => tracing::debug!(%dataset, fragments, bytes, "read completed"),
        }
    }
}
