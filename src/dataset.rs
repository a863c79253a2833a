//! Dataset handles - staging writes, committing fragments, resolving reads

use crate::dataspace::{uncovered, Dataspace};
use crate::engine::EngineInner;
use crate::error::{EsdmError, Result};
use crate::fragment::{BackendRef, DatasetKey, Fragment, FragmentDescriptor, FragmentId};
use crate::gather;
use crate::metadata::DatasetRecord;
use crate::observe::EngineEvent;
use crate::types::{DataType, Element};
use crate::utils::{bytes_to_elements, calculate_checksum, elements_to_bytes, format_bytes};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use ndarray::{ArrayD, IxDyn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// In-memory state shared by every handle to one dataset
#[derive(Debug)]
pub(crate) struct DatasetState {
    key: DatasetKey,
    space: Dataspace,
    fragments: Mutex<Vec<Fragment>>,
    dim_names: RwLock<Option<Vec<String>>>,
    attributes: RwLock<BTreeMap<String, Value>>,
    created_at: DateTime<Utc>,
}

impl DatasetState {
    pub(crate) fn new(key: DatasetKey, space: Dataspace) -> Self {
        Self {
            key,
            space,
            fragments: Mutex::new(Vec::new()),
            dim_names: RwLock::new(None),
            attributes: RwLock::new(BTreeMap::new()),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn from_record(record: DatasetRecord) -> Self {
        Self {
            key: record.key(),
            space: record.dataspace,
            fragments: Mutex::new(Vec::new()),
            dim_names: RwLock::new(record.dim_names),
            attributes: RwLock::new(record.attributes),
            created_at: record.created_at,
        }
    }

    fn record(&self) -> DatasetRecord {
        DatasetRecord {
            container: self.key.container.clone(),
            name: self.key.dataset.clone(),
            dataspace: self.space.clone(),
            dim_names: self.dim_names.read().clone(),
            attributes: self.attributes.read().clone(),
            created_at: self.created_at,
            modified_at: Utc::now(),
        }
    }
}

/// Outcome of committing a dataset or container.
///
/// Failures do not roll back fragments that were persisted in the same
/// call; failed fragments stay staged and the next commit retries them.
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Fragments persisted by this call
    pub persisted: Vec<FragmentId>,
    /// Fragments already persisted or being committed by another caller
    pub skipped: usize,
    /// Fragments left staged, with the reason
    pub failed: Vec<(FragmentId, EsdmError)>,
}

impl CommitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: CommitReport) {
        self.persisted.extend(other.persisted);
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
    }

    /// `CommitIncomplete` if any fragment failed
    pub fn into_result(self) -> Result<Vec<FragmentId>> {
        if self.failed.is_empty() {
            Ok(self.persisted)
        } else {
            Err(EsdmError::CommitIncomplete {
                failed: self.failed.len(),
                total: self.failed.len() + self.persisted.len(),
            })
        }
    }
}

/// Fragment counts and sizes held by a dataset handle
#[derive(Debug, Clone)]
pub struct DatasetStats {
    pub dataset: DatasetKey,
    pub data_type: DataType,
    pub shape: Vec<u64>,
    pub staged_fragments: usize,
    pub staged_bytes: u64,
    pub persisted_fragments: usize,
    pub persisted_bytes: u64,
}

impl DatasetStats {
    pub fn summary(&self) -> String {
        let shape: Vec<String> = self.shape.iter().map(|s| s.to_string()).collect();
        format!(
            "{} {}[{}]: {} staged ({}), {} persisted ({})",
            self.dataset,
            self.data_type,
            shape.join("x"),
            self.staged_fragments,
            format_bytes(self.staged_bytes),
            self.persisted_fragments,
            format_bytes(self.persisted_bytes),
        )
    }
}

/// A fragment taken out for commit
struct Claim {
    id: FragmentId,
    space: Dataspace,
    data: Bytes,
    placement: String,
    pending: Option<FragmentDescriptor>,
}

/// Releases the in-flight mark on claimed fragments, including when the
/// commit future is dropped.
struct ClaimGuard<'a> {
    state: &'a DatasetState,
    ids: Vec<FragmentId>,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        let mut fragments = self.state.fragments.lock();
        for fragment in fragments.iter_mut() {
            if self.ids.contains(&fragment.id()) {
                fragment.in_flight = false;
            }
        }
    }
}

/// Handle to a named N-dimensional array inside a container
#[derive(Clone)]
pub struct Dataset {
    engine: Arc<EngineInner>,
    state: Arc<DatasetState>,
}

impl Dataset {
    pub(crate) fn new(engine: Arc<EngineInner>, state: Arc<DatasetState>) -> Self {
        Self { engine, state }
    }

    pub fn name(&self) -> &str {
        &self.state.key.dataset
    }

    pub fn key(&self) -> &DatasetKey {
        &self.state.key
    }

    /// Declared shape; fixed at creation
    pub fn dataspace(&self) -> &Dataspace {
        &self.state.space
    }

    fn check_region(&self, region: &Dataspace) -> Result<()> {
        self.state.space.check_compatible(region)?;
        if !self.state.space.contains(region) {
            return Err(EsdmError::InvalidArgument(format!(
                "region {} is outside dataset {} {}",
                region, self.state.key, self.state.space
            )));
        }
        Ok(())
    }

    fn check_buffer(region: &Dataspace, len: usize) -> Result<usize> {
        let needed = Self::buffer_len(region)?;
        if len < needed {
            return Err(EsdmError::InvalidArgument(format!(
                "buffer of {} bytes is smaller than region {} ({} bytes)",
                len, region, needed
            )));
        }
        Ok(needed)
    }

    fn buffer_len(region: &Dataspace) -> Result<usize> {
        usize::try_from(region.byte_size()).map_err(|_| {
            EsdmError::InvalidArgument(format!("region {} does not fit in memory", region))
        })
    }

    fn check_element<T: Element>(&self) -> Result<()> {
        if T::DATA_TYPE != self.state.space.data_type() {
            return Err(EsdmError::InvalidArgument(format!(
                "dataset {} holds {}, not {}",
                self.state.key,
                self.state.space.data_type(),
                T::DATA_TYPE
            )));
        }
        Ok(())
    }

    /// Stage `buffer`, a dense image of `subspace`, as one or more fragments.
    ///
    /// The region is tiled to the registered backends' size bounds and each
    /// tile is placed on a backend. Nothing is durable until [`commit`].
    ///
    /// [`commit`]: Dataset::commit
    pub fn write(&self, buffer: &[u8], subspace: &Dataspace) -> Result<Vec<FragmentId>> {
        self.check_region(subspace)?;
        let len = Self::check_buffer(subspace, buffer.len())?;
        let buffer = &buffer[..len];

        let tiles = self.engine.registry.tiling_policy().tile(subspace)?;
        let mut staged = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let backend = self.engine.registry.select(&tile)?;
            let data = if tile == *subspace {
                Bytes::copy_from_slice(buffer)
            } else {
                Bytes::from(gather::extract(buffer, subspace, &tile)?)
            };
            staged.push(Fragment::stage(
                self.state.key.clone(),
                tile,
                data,
                backend.id().to_string(),
            )?);
        }

        Ok(self.push_staged(staged))
    }

    /// Stage exactly one fragment over `subspace`, without tiling
    pub fn create_fragment(&self, buffer: &[u8], subspace: &Dataspace) -> Result<FragmentId> {
        self.check_region(subspace)?;
        let len = Self::check_buffer(subspace, buffer.len())?;
        let backend = self.engine.registry.select(subspace)?;
        let fragment = Fragment::stage(
            self.state.key.clone(),
            subspace.clone(),
            Bytes::copy_from_slice(&buffer[..len]),
            backend.id().to_string(),
        )?;
        let id = fragment.id();
        self.push_staged(vec![fragment]);
        Ok(id)
    }

    /// Typed [`write`](Dataset::write)
    pub fn write_elements<T: Element>(&self, data: &[T], subspace: &Dataspace) -> Result<Vec<FragmentId>> {
        self.check_element::<T>()?;
        self.write(&elements_to_bytes(data), subspace)
    }

    fn push_staged(&self, staged: Vec<Fragment>) -> Vec<FragmentId> {
        for fragment in &staged {
            self.engine.observer.on_event(&EngineEvent::FragmentStaged {
                dataset: &self.state.key,
                fragment: fragment.id(),
                bytes: fragment.space().byte_size(),
                backend: fragment.placement(),
            });
        }
        let ids = staged.iter().map(Fragment::id).collect();
        self.state.fragments.lock().extend(staged);
        ids
    }

    /// Persist every staged fragment, then register the dataset record
    pub async fn commit(&self) -> Result<CommitReport> {
        self.commit_with(self.engine.default_deadline()).await
    }

    /// [`commit`](Dataset::commit) with backend I/O bounded by `deadline`
    pub async fn commit_before(&self, deadline: Instant) -> Result<CommitReport> {
        self.commit_with(Some(deadline)).await
    }

    async fn commit_with(&self, deadline: Option<Instant>) -> Result<CommitReport> {
        let mut report = CommitReport::default();
        let claims: Vec<Claim> = {
            let mut fragments = self.state.fragments.lock();
            let mut claims = Vec::new();
            for fragment in fragments.iter_mut() {
                if fragment.is_persisted() || fragment.in_flight {
                    report.skipped += 1;
                    continue;
                }
                fragment.in_flight = true;
                claims.push(Claim {
                    id: fragment.id(),
                    space: fragment.space().clone(),
                    data: fragment.data().clone(),
                    placement: fragment.placement().to_string(),
                    pending: fragment.pending.clone(),
                });
            }
            claims
        };
        let _guard = ClaimGuard {
            state: &self.state,
            ids: claims.iter().map(|c| c.id).collect(),
        };

        // Payloads go out concurrently; sequence numbers follow staging
        // order so a later write over the same region wins.
        let written = join_all(claims.iter().map(|claim| self.write_payload(claim, deadline))).await;

        let mut outcomes: Vec<(FragmentId, Result<FragmentDescriptor>)> = Vec::with_capacity(claims.len());
        for (claim, result) in claims.iter().zip(written) {
            let outcome = match &claim.pending {
                Some(pending) => result.map(|_| pending.clone()),
                None => result.map(|location| FragmentDescriptor {
                    id: claim.id,
                    dataset: self.state.key.clone(),
                    space: claim.space.clone(),
                    location,
                    sequence: self.engine.next_sequence(),
                    checksum: calculate_checksum(&claim.data),
                    committed_at: Utc::now(),
                }),
            };
            outcomes.push((claim.id, outcome));
        }

        // Registration may be cut short by a dropped future; whatever lands
        // in the index must match what the next attempt registers.
        {
            let mut fragments = self.state.fragments.lock();
            for (id, outcome) in &outcomes {
                if let (Ok(descriptor), Some(fragment)) = (outcome, fragments.iter_mut().find(|f| f.id() == *id)) {
                    fragment.pending = Some(descriptor.clone());
                }
            }
        }

        let registered = join_all(outcomes.iter().map(|(_, outcome)| async move {
            match outcome {
                Ok(descriptor) => {
                    self.engine
                        .run_io(None, self.engine.metadata.register_fragment(descriptor))
                        .await
                }
                Err(_) => Ok(()),
            }
        }))
        .await;

        {
            let mut fragments = self.state.fragments.lock();
            for ((id, outcome), registration) in outcomes.into_iter().zip(registered) {
                let result = outcome.and_then(|descriptor| registration.map(|_| descriptor));
                let Some(fragment) = fragments.iter_mut().find(|f| f.id() == id) else {
                    continue;
                };
                match result {
                    Ok(descriptor) => {
                        fragment.mark_persisted(descriptor.location.clone(), descriptor.sequence)?;
                        self.engine.observer.on_event(&EngineEvent::FragmentPersisted {
                            dataset: &self.state.key,
                            fragment: id,
                            backend: &descriptor.location.backend,
                            sequence: descriptor.sequence,
                        });
                        report.persisted.push(id);
                    }
                    Err(error) => {
                        self.engine.observer.on_event(&EngineEvent::FragmentCommitFailed {
                            dataset: &self.state.key,
                            fragment: id,
                            error: &error,
                        });
                        report.failed.push((id, error));
                    }
                }
            }
        }

        self.engine.metadata.put_dataset(&self.state.record()).await?;

        self.engine.observer.on_event(&EngineEvent::DatasetCommitted {
            dataset: &self.state.key,
            persisted: report.persisted.len(),
            failed: report.failed.len(),
        });
        Ok(report)
    }

    async fn write_payload(&self, claim: &Claim, deadline: Option<Instant>) -> Result<BackendRef> {
        // Payload already landed on an earlier attempt
        if let Some(pending) = &claim.pending {
            return Ok(pending.location.clone());
        }
        let backend = self.engine.registry.get(&claim.placement).cloned().ok_or_else(|| {
            EsdmError::NotFound(format!("backend '{}' is not registered", claim.placement))
        })?;
        let key = &self.state.key;
        let location = self
            .engine
            .run_io(deadline, async {
                let location = backend.allocate(key, claim.id, claim.data.len() as u64).await?;
                backend.write(&location, &claim.data).await?;
                Ok(location)
            })
            .await?;
        Ok(BackendRef {
            backend: backend.id().to_string(),
            location,
        })
    }

    /// Fill `buffer`, a dense image of `query`, from committed fragments.
    ///
    /// Where fragments overlap, the one committed last wins. If any part of
    /// `query` is covered by no committed fragment the call fails with
    /// `IncompleteData` and `buffer` is left untouched.
    pub async fn read(&self, buffer: &mut [u8], query: &Dataspace) -> Result<()> {
        self.read_with(buffer, query, self.engine.default_deadline()).await
    }

    /// [`read`](Dataset::read) with backend I/O bounded by `deadline`
    pub async fn read_before(&self, buffer: &mut [u8], query: &Dataspace, deadline: Instant) -> Result<()> {
        self.read_with(buffer, query, Some(deadline)).await
    }

    async fn read_with(&self, buffer: &mut [u8], query: &Dataspace, deadline: Option<Instant>) -> Result<()> {
        self.check_region(query)?;
        let len = Self::check_buffer(query, buffer.len())?;
        if query.is_empty() {
            return Ok(());
        }

        let mut descriptors = match self.engine.metadata.lookup(&self.state.key, query).await {
            Ok(descriptors) => descriptors,
            // No record yet: nothing of this dataset has been committed.
            Err(EsdmError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        descriptors.sort_by_key(|d| d.sequence);

        let gaps = uncovered(query, descriptors.iter().map(|d| &d.space))?;
        if let Some(gap) = gaps.first() {
            return Err(EsdmError::IncompleteData(format!(
                "{} of {} has no committed data ({} uncovered regions)",
                gap,
                self.state.key,
                gaps.len()
            )));
        }

        let visible = visible_fragments(query, descriptors)?;
        debug!(dataset = %self.state.key, fragments = visible.len(), "resolving read");

        let payloads = try_join_all(visible.iter().map(|(d, _)| self.fetch(d, deadline))).await?;

        let buffer = &mut buffer[..len];
        for ((descriptor, region), payload) in visible.iter().zip(&payloads) {
            gather::copy_region(payload, &descriptor.space, buffer, query, region)?;
        }

        self.engine.observer.on_event(&EngineEvent::ReadCompleted {
            dataset: &self.state.key,
            fragments: visible.len(),
            bytes: len as u64,
        });
        Ok(())
    }

    async fn fetch(&self, descriptor: &FragmentDescriptor, deadline: Option<Instant>) -> Result<Bytes> {
        let location = &descriptor.location;
        let backend = self.engine.registry.get(&location.backend).cloned().ok_or_else(|| {
            EsdmError::NotFound(format!(
                "backend '{}' holding fragment {} is not registered",
                location.backend, descriptor.id
            ))
        })?;
        let data = self
            .engine
            .run_io(deadline, backend.read(&location.location))
            .await?;

        if data.len() as u64 != descriptor.space.byte_size() || calculate_checksum(&data) != descriptor.checksum {
            return Err(EsdmError::Corrupt(format!(
                "fragment {} at {}:{} does not match its descriptor",
                descriptor.id, location.backend, location.location
            )));
        }
        Ok(data)
    }

    /// Typed [`read`](Dataset::read) into a new vector
    pub async fn read_elements<T: Element>(&self, query: &Dataspace) -> Result<Vec<T>> {
        self.check_element::<T>()?;
        self.check_region(query)?;
        let mut buffer = vec![0u8; Self::buffer_len(query)?];
        self.read(&mut buffer, query).await?;
        bytes_to_elements(&buffer)
    }

    /// Read `query` as an array shaped like the query region
    pub async fn read_array<T: Element>(&self, query: &Dataspace) -> Result<ArrayD<T>> {
        let elements = self.read_elements::<T>(query).await?;
        let shape: Vec<usize> = query.sizes().iter().map(|&s| s as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&shape), elements)
            .map_err(|e| EsdmError::InvalidArgument(format!("cannot shape {}: {}", query, e)))
    }

    /// Release a fragment's in-memory state; committed data is not touched
    pub fn fragment_destroy(&self, id: FragmentId) -> Result<()> {
        let mut fragments = self.state.fragments.lock();
        let index = fragments
            .iter()
            .position(|f| f.id() == id)
            .ok_or_else(|| EsdmError::NotFound(format!("fragment {} in {}", id, self.state.key)))?;
        if fragments[index].in_flight {
            return Err(EsdmError::Conflict(format!("fragment {} is being committed", id)));
        }
        fragments.remove(index);
        Ok(())
    }

    /// Fragments held by this handle, in staging order
    pub fn fragments(&self) -> Vec<Fragment> {
        self.state.fragments.lock().clone()
    }

    pub fn stats(&self) -> DatasetStats {
        let fragments = self.state.fragments.lock();
        let mut stats = DatasetStats {
            dataset: self.state.key.clone(),
            data_type: self.state.space.data_type(),
            shape: self.state.space.sizes().to_vec(),
            staged_fragments: 0,
            staged_bytes: 0,
            persisted_fragments: 0,
            persisted_bytes: 0,
        };
        for fragment in fragments.iter() {
            let bytes = fragment.space().byte_size();
            if fragment.is_persisted() {
                stats.persisted_fragments += 1;
                stats.persisted_bytes += bytes;
            } else {
                stats.staged_fragments += 1;
                stats.staged_bytes += bytes;
            }
        }
        stats
    }

    /// Name each axis; persisted with the dataset record on commit
    pub fn set_dim_names<S: Into<String>>(&self, names: impl IntoIterator<Item = S>) -> Result<()> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.len() != self.state.space.rank() {
            return Err(EsdmError::InvalidArgument(format!(
                "{} dimension names for a rank {} dataset",
                names.len(),
                self.state.space.rank()
            )));
        }
        *self.state.dim_names.write() = Some(names);
        Ok(())
    }

    pub fn dim_names(&self) -> Option<Vec<String>> {
        self.state.dim_names.read().clone()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.attributes.write().insert(key.into(), value.into());
    }

    pub fn attributes(&self) -> BTreeMap<String, Value> {
        self.state.attributes.read().clone()
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("key", &self.state.key)
            .field("space", &self.state.space)
            .finish()
    }
}

/// Drop fragments whose part of `query` is fully overwritten by later ones.
///
/// `descriptors` must be sorted by ascending sequence. Returns the rest,
/// still ascending, each with its intersection with `query`.
fn visible_fragments(
    query: &Dataspace,
    descriptors: Vec<FragmentDescriptor>,
) -> Result<Vec<(FragmentDescriptor, Dataspace)>> {
    let mut later: Vec<Dataspace> = Vec::new();
    let mut visible = Vec::new();
    for descriptor in descriptors.into_iter().rev() {
        let region = descriptor.space.overlap(query)?;
        if region.is_empty() || uncovered(&region, &later)?.is_empty() {
            continue;
        }
        later.push(region.clone());
        visible.push((descriptor, region));
    }
    visible.reverse();
    Ok(visible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCapabilities, InMemoryBackend};
    use crate::engine::Esdm;
    use crate::fragment::CommitState;
    use crate::observe::testing::RecordingObserver;

    async fn dataset(shape: &[u64], dt: DataType) -> Dataset {
        let esdm = Esdm::builder()
            .with_backend(Arc::new(InMemoryBackend::new("m")))
            .build()
            .await
            .unwrap();
        let container = esdm.container_create("c").await.unwrap();
        container
            .dataset_create("d", Dataspace::new(shape, dt).unwrap())
            .await
            .unwrap()
    }

    fn sequential(n: u64) -> Vec<u64> {
        (0..n).collect()
    }

    #[tokio::test]
    async fn test_write_stages_until_commit() {
        let ds = dataset(&[4, 4], DataType::U64).await;
        let all = ds.dataspace().clone();
        ds.write_elements(&sequential(16), &all).unwrap();

        let stats = ds.stats();
        assert_eq!((stats.staged_fragments, stats.persisted_fragments), (1, 0));
        assert!(matches!(
            ds.read_elements::<u64>(&all).await,
            Err(EsdmError::IncompleteData(_))
        ));

        let report = ds.commit().await.unwrap();
        assert_eq!(report.persisted.len(), 1);
        assert_eq!(ds.read_elements::<u64>(&all).await.unwrap(), sequential(16));

        let again = ds.commit().await.unwrap();
        assert!(again.persisted.is_empty());
        assert_eq!(again.skipped, 1);
        assert!(ds.stats().summary().contains("1 persisted"));
    }

    #[tokio::test]
    async fn test_later_write_in_same_commit_wins() {
        let ds = dataset(&[8], DataType::U8).await;
        let all = ds.dataspace().clone();
        ds.write(&[1u8; 8], &all).unwrap();
        let tail = all.subspace(&[4], &[4]).unwrap();
        ds.write(&[2u8; 4], &tail).unwrap();
        ds.commit().await.unwrap().into_result().unwrap();

        let fragments = ds.fragments();
        assert!(fragments[0].sequence() < fragments[1].sequence());
        assert_eq!(
            ds.read_elements::<u8>(&all).await.unwrap(),
            vec![1, 1, 1, 1, 2, 2, 2, 2]
        );
    }

    #[tokio::test]
    async fn test_validation() {
        let ds = dataset(&[4, 4], DataType::F32).await;
        let outside = Dataspace::new(&[5, 4], DataType::F32).unwrap();
        assert!(matches!(ds.write(&[0u8; 80], &outside), Err(EsdmError::InvalidArgument(_))));

        let all = ds.dataspace().clone();
        assert!(matches!(ds.write(&[0u8; 63], &all), Err(EsdmError::InvalidArgument(_))));
        assert!(matches!(
            ds.write_elements(&[0u32; 16], &all),
            Err(EsdmError::InvalidArgument(_))
        ));
        assert!(ds.set_dim_names(["x"]).is_err());
        ds.set_dim_names(["lat", "lon"]).unwrap();
        assert_eq!(ds.dim_names().unwrap(), vec!["lat", "lon"]);
        assert!(ds.fragments().is_empty());
    }

    #[tokio::test]
    async fn test_read_array_shape() {
        let ds = dataset(&[3, 4], DataType::I32).await;
        let all = ds.dataspace().clone();
        let values: Vec<i32> = (0..12).collect();
        ds.write_elements(&values, &all).unwrap();
        ds.commit().await.unwrap();

        let region = all.subspace(&[2, 2], &[1, 1]).unwrap();
        let array = ds.read_array::<i32>(&region).await.unwrap();
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array[[0, 0]], 5);
        assert_eq!(array[[1, 1]], 10);
    }

    #[tokio::test]
    async fn test_tiles_to_backend_bound() {
        let backend = InMemoryBackend::new("small")
            .with_capabilities(BackendCapabilities::unbounded().with_max_fragment_size(32));
        let observer = Arc::new(RecordingObserver::default());
        let esdm = Esdm::builder()
            .with_backend(Arc::new(backend))
            .with_observer(observer.clone())
            .build()
            .await
            .unwrap();
        let container = esdm.container_create("c").await.unwrap();
        let ds = container
            .dataset_create("d", Dataspace::new(&[4, 8], DataType::U16).unwrap())
            .await
            .unwrap();

        let all = ds.dataspace().clone();
        let ids = ds.write_elements(&(0..32u16).collect::<Vec<_>>(), &all).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ds.fragments().iter().all(|f| f.space().byte_size() <= 32));

        assert!(matches!(
            ds.create_fragment(&[0u8; 64], &all),
            Err(EsdmError::CapabilityMismatch(_))
        ));

        ds.commit().await.unwrap();
        assert_eq!(ds.read_elements::<u16>(&all).await.unwrap(), (0..32).collect::<Vec<_>>());

        let events = observer.events.lock().clone();
        assert_eq!(events.iter().filter(|e| *e == "staged").count(), 2);
        assert_eq!(events.iter().filter(|e| *e == "persisted").count(), 2);
        assert!(events.contains(&"dataset".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("read"));
    }

    #[tokio::test]
    async fn test_fragment_destroy() {
        let ds = dataset(&[4], DataType::U8).await;
        let id = ds.create_fragment(&[1, 2, 3, 4], ds.dataspace()).unwrap();
        assert_eq!(ds.fragments()[0].state(), CommitState::Staged);
        ds.fragment_destroy(id).unwrap();
        assert!(matches!(ds.fragment_destroy(id), Err(EsdmError::NotFound(_))));
        assert!(ds.commit().await.unwrap().persisted.is_empty());
    }

    #[test]
    fn test_visible_fragments_elides_shadowed() {
        let parent = Dataspace::new(&[10], DataType::U8).unwrap();
        let d = |offset: i64, size: u64, sequence: u64| FragmentDescriptor {
            id: FragmentId::new(),
            dataset: DatasetKey::new("c", "d"),
            space: parent.subspace(&[size], &[offset]).unwrap(),
            location: BackendRef {
                backend: "m".into(),
                location: String::new(),
            },
            sequence,
            checksum: 0,
            committed_at: Utc::now(),
        };
        let shadowed = d(2, 2, 1);
        let base = d(0, 10, 2);
        let top = d(5, 5, 3);

        let visible = visible_fragments(&parent, vec![shadowed, base.clone(), top.clone()]).unwrap();
        let ids: Vec<_> = visible.iter().map(|(d, _)| d.id).collect();
        assert_eq!(ids, vec![base.id, top.id]);

        let query = parent.subspace(&[3], &[6]).unwrap();
        let visible = visible_fragments(&query, vec![base, top.clone()]).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].0.id, top.id);
        assert_eq!(visible[0].1, query);
    }
}
