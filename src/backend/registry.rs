//! Ordered set of data backends and fragment placement

use super::{BackendDescriptor, BackendKind, DataBackend};
use crate::dataspace::Dataspace;
use crate::error::{EsdmError, Result};
use crate::layout::TilingPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// Data backends in registration order
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn DataBackend>>,
    index: HashMap<String, usize>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backend; ids must be unique
    pub fn register(&mut self, backend: Arc<dyn DataBackend>) -> Result<()> {
        let id = backend.id().to_string();
        if self.index.contains_key(&id) {
            return Err(EsdmError::Conflict(format!("backend '{}' is already registered", id)));
        }
        self.index.insert(id, self.backends.len());
        self.backends.push(backend);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn DataBackend>> {
        self.index.get(id).map(|&i| &self.backends[i])
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DataBackend>> {
        self.backends.iter()
    }

    /// Choose the backend for a fragment over `space`.
    ///
    /// Among backends whose capabilities accept the fragment, the lowest
    /// performance estimate wins; ties go to the earliest registered. A
    /// non-finite estimate counts as not accepting.
    pub fn select(&self, space: &Dataspace) -> Result<Arc<dyn DataBackend>> {
        let mut best: Option<(&Arc<dyn DataBackend>, f64)> = None;
        for backend in &self.backends {
            if !backend.capabilities().accepts(space) {
                continue;
            }
            let cost = backend.performance_estimate(space);
            if !cost.is_finite() {
                warn!(backend = backend.id(), cost, "ignoring backend with unusable estimate");
                continue;
            }
            trace!(backend = backend.id(), cost, "placement candidate");
            if best.map_or(true, |(_, best_cost)| cost < best_cost) {
                best = Some((backend, cost));
            }
        }

        best.map(|(backend, _)| Arc::clone(backend)).ok_or_else(|| {
            EsdmError::CapabilityMismatch(format!(
                "no registered backend accepts a fragment over {} ({} bytes)",
                space,
                space.byte_size()
            ))
        })
    }

    /// Fragment size bound that lets every tile find a backend.
    ///
    /// Unbounded if any backend is; otherwise the largest bound.
    pub fn tiling_policy(&self) -> TilingPolicy {
        let mut largest = None;
        for backend in &self.backends {
            match backend.capabilities().max_fragment_size {
                None => return TilingPolicy::unbounded(),
                Some(max) => largest = Some(largest.map_or(max, |l: u64| l.max(max))),
            }
        }
        largest.map_or_else(TilingPolicy::unbounded, TilingPolicy::with_max_bytes)
    }

    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.backends
            .iter()
            .map(|backend| BackendDescriptor {
                name: backend.id().to_string(),
                kind: BackendKind::Data,
                accessibility: backend.accessibility(),
                capabilities: backend.capabilities().clone(),
            })
            .collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|b| b.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCapabilities, InMemoryBackend, PerformanceModel};
    use crate::types::DataType;

    fn memory(id: &str, latency: f64, max: Option<u64>) -> Arc<dyn DataBackend> {
        let mut caps = BackendCapabilities::unbounded();
        caps.max_fragment_size = max;
        Arc::new(
            InMemoryBackend::new(id)
                .with_capabilities(caps)
                .with_performance_model(PerformanceModel::new(latency, 1e9)),
        )
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = BackendRegistry::new();
        registry.register(memory("a", 0.0, None)).unwrap();
        assert!(matches!(
            registry.register(memory("a", 1.0, None)),
            Err(EsdmError::Conflict(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_select_cheapest_then_first() {
        let mut registry = BackendRegistry::new();
        registry.register(memory("slow", 1.0, None)).unwrap();
        registry.register(memory("fast1", 0.1, None)).unwrap();
        registry.register(memory("fast2", 0.1, None)).unwrap();

        let space = Dataspace::new(&[10, 10], DataType::F32).unwrap();
        for _ in 0..10 {
            assert_eq!(registry.select(&space).unwrap().id(), "fast1");
        }
    }

    #[test]
    fn test_select_respects_capabilities() {
        let mut registry = BackendRegistry::new();
        registry.register(memory("tiny", 0.0, Some(16))).unwrap();
        registry.register(memory("big", 5.0, None)).unwrap();

        let small = Dataspace::new(&[2], DataType::U64).unwrap();
        let large = Dataspace::new(&[100], DataType::U64).unwrap();
        assert_eq!(registry.select(&small).unwrap().id(), "tiny");
        assert_eq!(registry.select(&large).unwrap().id(), "big");

        let mut bounded = BackendRegistry::new();
        bounded.register(memory("tiny", 0.0, Some(16))).unwrap();
        assert!(matches!(
            bounded.select(&large),
            Err(EsdmError::CapabilityMismatch(_))
        ));
        assert!(matches!(
            BackendRegistry::new().select(&small),
            Err(EsdmError::CapabilityMismatch(_))
        ));
    }

    #[test]
    fn test_select_skips_non_finite_estimates() {
        let mut registry = BackendRegistry::new();
        registry.register(memory("nan", f64::NAN, None)).unwrap();
        registry.register(memory("inf", f64::INFINITY, None)).unwrap();
        registry.register(memory("ok", 3.0, None)).unwrap();

        let space = Dataspace::new(&[4], DataType::U8).unwrap();
        assert_eq!(registry.select(&space).unwrap().id(), "ok");

        let mut broken = BackendRegistry::new();
        broken.register(memory("nan", f64::NAN, None)).unwrap();
        assert!(matches!(
            broken.select(&space),
            Err(EsdmError::CapabilityMismatch(_))
        ));
    }

    #[test]
    fn test_tiling_policy() {
        let mut registry = BackendRegistry::new();
        assert_eq!(registry.tiling_policy().max_fragment_bytes(), None);
        registry.register(memory("a", 0.0, Some(64))).unwrap();
        registry.register(memory("b", 0.0, Some(256))).unwrap();
        assert_eq!(registry.tiling_policy().max_fragment_bytes(), Some(256));
        registry.register(memory("c", 0.0, None)).unwrap();
        assert_eq!(registry.tiling_policy().max_fragment_bytes(), None);
    }

    #[test]
    fn test_descriptors_in_order() {
        let mut registry = BackendRegistry::new();
        registry.register(memory("x", 0.0, None)).unwrap();
        registry.register(memory("y", 0.0, Some(8))).unwrap();
        let names: Vec<_> = registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert!(registry.get("y").is_some());
        assert!(registry.get("z").is_none());
    }
}
