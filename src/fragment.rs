//! Fragments - physically stored pieces of a dataset

use crate::dataspace::Dataspace;
use crate::error::{EsdmError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a fragment, unique across writers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(Uuid);

impl FragmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FragmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Fully qualified dataset name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetKey {
    pub container: String,
    pub dataset: String,
}

impl DatasetKey {
    pub fn new(container: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            dataset: dataset.into(),
        }
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.dataset)
    }
}

/// Fragment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    /// In memory only; commit may be retried
    Staged,
    /// Durable and visible to lookups; terminal
    Persisted,
}

/// Where a persisted fragment's payload lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    /// Registered backend id
    pub backend: String,
    /// Backend-specific location token
    pub location: String,
}

/// In-memory fragment owned by a dataset handle
#[derive(Debug, Clone)]
pub struct Fragment {
    id: FragmentId,
    dataset: DatasetKey,
    space: Dataspace,
    data: Bytes,
    state: CommitState,
    placement: String,
    backend: Option<BackendRef>,
    sequence: Option<u64>,
    pub(crate) in_flight: bool,
    /// Descriptor assigned by an interrupted commit; retries register it unchanged
    pub(crate) pending: Option<FragmentDescriptor>,
}

impl Fragment {
    /// Stage a fragment over `space`; `data` is its dense row-major image.
    pub(crate) fn stage(dataset: DatasetKey, space: Dataspace, data: Bytes, placement: String) -> Result<Self> {
        if data.len() as u64 != space.byte_size() {
            return Err(EsdmError::InvalidArgument(format!(
                "fragment {} needs {} bytes, got {}",
                space,
                space.byte_size(),
                data.len()
            )));
        }
        Ok(Self {
            id: FragmentId::new(),
            dataset,
            space,
            data,
            state: CommitState::Staged,
            placement,
            backend: None,
            sequence: None,
            in_flight: false,
            pending: None,
        })
    }

    pub fn id(&self) -> FragmentId {
        self.id
    }

    pub fn dataset(&self) -> &DatasetKey {
        &self.dataset
    }

    pub fn space(&self) -> &Dataspace {
        &self.space
    }

    /// The fragment's bytes. Immutable once persisted.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn state(&self) -> CommitState {
        self.state
    }

    pub fn is_persisted(&self) -> bool {
        self.state == CommitState::Persisted
    }

    /// Backend chosen for this fragment when it was staged
    pub fn placement(&self) -> &str {
        &self.placement
    }

    /// Set once, when the fragment becomes persisted
    pub fn backend(&self) -> Option<&BackendRef> {
        self.backend.as_ref()
    }

    /// Commit order; assigned when the fragment becomes persisted
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub(crate) fn mark_persisted(&mut self, backend: BackendRef, sequence: u64) -> Result<()> {
        if self.is_persisted() {
            return Err(EsdmError::InvalidArgument(format!(
                "fragment {} is already persisted",
                self.id
            )));
        }
        self.backend = Some(backend);
        self.sequence = Some(sequence);
        self.state = CommitState::Persisted;
        self.pending = None;
        Ok(())
    }
}

/// The metadata record registered for a persisted fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    pub id: FragmentId,
    pub dataset: DatasetKey,
    pub space: Dataspace,
    #[serde(flatten)]
    pub location: BackendRef,
    /// Later sequence numbers win where fragments overlap
    pub sequence: u64,
    /// CRC-32 of the uncompressed payload
    pub checksum: u32,
    pub committed_at: DateTime<Utc>,
}

impl FragmentDescriptor {
    /// Self-describing JSON record
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
