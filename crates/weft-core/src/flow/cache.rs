//! Process-wide cache of compiled graphs keyed by `(flow_id, version)`.
//!
//! Hits are served lock-free from a `DashMap`. Misses take the admission
//! lock, re-check, and compile at most once per key. Capacity is bounded;
//! the oldest inserted entry is evicted first. Entries never expire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;
use weft_types::flow::{FlowDefinition, FlowKey};

use super::compiler::{compile, CompileError};
use super::graph::CompiledGraph;

/// Default number of compiled graphs kept.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Counter snapshot for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compiles: u64,
    pub entries: usize,
}

pub struct GraphCache {
    capacity: usize,
    entries: DashMap<FlowKey, Arc<CompiledGraph>>,
    /// Insertion order; also the admission lock for compiles.
    order: Mutex<VecDeque<FlowKey>>,
    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
}

impl Default for GraphCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl GraphCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
        }
    }

    /// Return the compiled graph for this flow revision, compiling on miss.
    pub async fn get_or_compile(
        &self,
        flow: &FlowDefinition,
    ) -> Result<Arc<CompiledGraph>, CompileError> {
        let key = flow.key();

        if let Some(graph) = self.entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(graph.value()));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut order = self.order.lock().await;

        // Another caller may have compiled while we waited.
        if let Some(graph) = self.entries.get(&key) {
            return Ok(Arc::clone(graph.value()));
        }

        let graph = Arc::new(compile(flow)?);
        self.compiles.fetch_add(1, Ordering::Relaxed);

        while order.len() >= self.capacity {
            match order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    tracing::debug!(flow = %oldest, "evicted compiled graph");
                }
                None => break,
            }
        }

        self.entries.insert(key, Arc::clone(&graph));
        order.push_back(key);
        Ok(graph)
    }

    /// Look up without compiling.
    pub fn get(&self, key: &FlowKey) -> Option<Arc<CompiledGraph>> {
        self.entries.get(key).map(|g| Arc::clone(g.value()))
    }

    /// Drop every version of a flow.
    pub async fn invalidate(&self, flow_id: Uuid) {
        let mut order = self.order.lock().await;
        order.retain(|k| k.flow_id != flow_id);
        self.entries.retain(|k, _| k.flow_id != flow_id);
    }

    pub async fn clear(&self) {
        let mut order = self.order.lock().await;
        order.clear();
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::flow::{Policy, StepKind, StepNode};

    fn flow(id: Uuid, version: u32) -> FlowDefinition {
        FlowDefinition {
            id,
            name: "cached".to_string(),
            version,
            policy: Policy::default(),
            failure_policy: None,
            steps: vec![StepNode {
                id: "only".to_string(),
                name: None,
                index: 0,
                kind: StepKind::Tool {
                    tool_id: "echo".to_string(),
                },
                args: Default::default(),
                input_mapping: Default::default(),
                output_mapping: Default::default(),
                condition: None,
                execution_mode: None,
                policy: None,
                branches: Vec::new(),
            }],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_same_version_returns_same_arc() {
        let cache = GraphCache::default();
        let f = flow(Uuid::now_v7(), 1);

        let first = cache.get_or_compile(&f).await.unwrap();
        let second = cache.get_or_compile(&f).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.stats();
        assert_eq!(stats.compiles, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_version_bump_compiles_new_graph() {
        let cache = GraphCache::default();
        let id = Uuid::now_v7();

        let v1 = cache.get_or_compile(&flow(id, 1)).await.unwrap();
        let v2 = cache.get_or_compile(&flow(id, 2)).await.unwrap();
        assert!(!Arc::ptr_eq(&v1, &v2));
        assert_eq!(v2.key.version, 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_eviction_oldest_first() {
        let cache = GraphCache::new(2);
        let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

        cache.get_or_compile(&flow(a, 1)).await.unwrap();
        cache.get_or_compile(&flow(b, 1)).await.unwrap();
        cache.get_or_compile(&flow(c, 1)).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&flow(a, 1).key()).is_none());
        assert!(cache.get(&flow(b, 1).key()).is_some());
        assert!(cache.get(&flow(c, 1).key()).is_some());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = GraphCache::default();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        cache.get_or_compile(&flow(a, 1)).await.unwrap();
        cache.get_or_compile(&flow(a, 2)).await.unwrap();
        cache.get_or_compile(&flow(b, 1)).await.unwrap();

        cache.invalidate(a).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&flow(b, 1).key()).is_some());

        cache.clear().await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_misses_compile_once() {
        let cache = Arc::new(GraphCache::default());
        let f = Arc::new(flow(Uuid::now_v7(), 1));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let f = Arc::clone(&f);
            handles.push(tokio::spawn(async move {
                cache.get_or_compile(&f).await.unwrap()
            }));
        }

        let mut graphs = Vec::new();
        for h in handles {
            graphs.push(h.await.unwrap());
        }

        assert_eq!(cache.stats().compiles, 1);
        assert!(graphs.iter().all(|g| Arc::ptr_eq(g, &graphs[0])));
    }

    #[tokio::test]
    async fn test_compile_error_not_cached() {
        let cache = GraphCache::default();
        let mut f = flow(Uuid::now_v7(), 1);
        f.steps.clear();

        assert_eq!(
            cache.get_or_compile(&f).await.unwrap_err(),
            CompileError::NoSteps
        );
        assert!(cache.is_empty());
    }
}
