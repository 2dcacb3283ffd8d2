use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::graph::EntityRelation;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant_id: Uuid,
    signature: String,
}

struct CacheState {
    entries: LruCache<CacheKey, Vec<EntityRelation>>,
    /// Stamp of each tenant's latest invalidation, drawn from `epoch`.
    generations: HashMap<Uuid, u64>,
    /// Source of invalidation stamps. Never reused.
    epoch: u64,
    /// Generation of every tenant absent from `generations`.
    floor: u64,
}

impl CacheState {
    fn generation(&self, tenant_id: Uuid) -> u64 {
        self.generations.get(&tenant_id).copied().unwrap_or(self.floor)
    }

    /// Forget stamps of tenants with nothing cached once the table outgrows
    /// the cache. Raising `floor` to the current epoch keeps every
    /// pre-invalidation generation distinct from what follows.
    fn prune_generations(&mut self) {
        if self.generations.len() <= self.entries.cap().get() {
            return;
        }
        let live: HashSet<Uuid> = self.entries.iter().map(|(k, _)| k.tenant_id).collect();
        self.generations.retain(|tenant, _| live.contains(tenant));
        self.floor = self.epoch;
    }
}

/// Thread-safe LRU cache of relation query results, scoped per tenant.
///
/// Invalidation is coarse: any relation mutation drops every entry of the
/// owning tenant. A result computed before an invalidation is refused by
/// [`put`](Self::put), so a query that raced a mutation can never seed the
/// cache with a pre-mutation answer.
///
/// A poisoned lock turns the cache into a permanent miss; callers always
/// fall back to direct computation.
pub struct QueryResultCache {
    inner: Mutex<CacheState>,
}

impl QueryResultCache {
    /// Create a new query cache with the specified capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Mutex::new(CacheState {
                entries: LruCache::new(cap),
                generations: HashMap::new(),
                epoch: 0,
                floor: 0,
            }),
        }
    }

    fn state(&self) -> Option<MutexGuard<'_, CacheState>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                log::warn!("Query cache lock poisoned, bypassing cache");
                None
            }
        }
    }

    /// Current invalidation generation of a tenant.
    ///
    /// Read this before computing a result and hand it back to `put`.
    pub fn generation(&self, tenant_id: Uuid) -> Option<u64> {
        self.state().map(|s| s.generation(tenant_id))
    }

    /// Look up a cached result.
    pub fn get(&self, tenant_id: Uuid, signature: &str) -> Option<Vec<EntityRelation>> {
        let mut state = self.state()?;
        let key = CacheKey {
            tenant_id,
            signature: signature.to_string(),
        };
        state.entries.get(&key).cloned()
    }

    /// Store a result computed at `generation`.
    ///
    /// Returns false (and stores nothing) if the tenant was invalidated since.
    pub fn put(
        &self,
        tenant_id: Uuid,
        signature: String,
        generation: u64,
        relations: Vec<EntityRelation>,
    ) -> bool {
        let Some(mut state) = self.state() else {
            return false;
        };
        if state.generation(tenant_id) != generation {
            return false;
        }
        state.entries.put(CacheKey { tenant_id, signature }, relations);
        true
    }

    /// Drop every cached result of a tenant.
    pub fn invalidate_tenant(&self, tenant_id: Uuid) {
        let Some(mut state) = self.state() else {
            return;
        };
        state.epoch += 1;
        let stamp = state.epoch;
        state.generations.insert(tenant_id, stamp);

        let stale: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(k, _)| k.tenant_id == tenant_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            state.entries.pop(key);
        }
        state.prune_generations();
        if !stale.is_empty() {
            log::debug!("Invalidated {} cached queries for tenant {}", stale.len(), tenant_id);
        }
    }

    /// Get the current number of cached entries
    pub fn len(&self) -> usize {
        self.state().map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        if let Some(mut state) = self.state() {
            state.entries.clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = self.inner.lock();
                    panic!("cache lock poisoned on purpose");
                })
                .join()
        });
    }
}

/// Canonical cache signature: SHA-256 of `kind` plus the JSON form of `query`.
///
/// Callers normalize the query first so equivalent queries hash equal.
/// Returns None if the query cannot be serialized, which just skips caching.
pub fn query_signature<T: Serialize>(kind: &str, query: &T) -> Option<String> {
    let json = serde_json::to_string(query).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b":");
    hasher.update(json.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityRef, EntityType};

    fn edge() -> EntityRelation {
        EntityRelation::new(
            EntityRef::random(EntityType::Asset),
            EntityRef::random(EntityType::Device),
            "Contains",
        )
    }

    #[test]
    fn test_cache_put_and_get() {
        let cache = QueryResultCache::new(10);
        let tenant = Uuid::new_v4();
        let value = vec![edge()];

        let generation = cache.generation(tenant).unwrap();
        assert!(cache.put(tenant, "q1".to_string(), generation, value.clone()));
        assert_eq!(cache.get(tenant, "q1"), Some(value));
    }

    #[test]
    fn test_cache_miss_other_tenant() {
        let cache = QueryResultCache::new(10);
        let tenant = Uuid::new_v4();
        cache.put(tenant, "q1".to_string(), 0, vec![edge()]);

        assert!(cache.get(Uuid::new_v4(), "q1").is_none());
        assert!(cache.get(tenant, "q2").is_none());
    }

    #[test]
    fn test_invalidate_is_tenant_scoped() {
        let cache = QueryResultCache::new(10);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.put(a, "q1".to_string(), 0, vec![edge()]);
        cache.put(a, "q2".to_string(), 0, vec![]);
        cache.put(b, "q1".to_string(), 0, vec![edge()]);

        cache.invalidate_tenant(a);

        assert!(cache.get(a, "q1").is_none());
        assert!(cache.get(a, "q2").is_none());
        assert!(cache.get(b, "q1").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_after_invalidation_is_refused() {
        let cache = QueryResultCache::new(10);
        let tenant = Uuid::new_v4();

        let before = cache.generation(tenant).unwrap();
        cache.invalidate_tenant(tenant);

        assert!(!cache.put(tenant, "q1".to_string(), before, vec![edge()]));
        assert!(cache.get(tenant, "q1").is_none());

        let after = cache.generation(tenant).unwrap();
        assert!(cache.put(tenant, "q1".to_string(), after, vec![edge()]));
    }

    #[test]
    fn test_generations_pruned_without_losing_invalidations() {
        let cache = QueryResultCache::new(2);
        let kept = Uuid::new_v4();
        let racing = Uuid::new_v4();
        assert!(cache.put(kept, "q".to_string(), 0, vec![edge()]));
        let in_flight = cache.generation(racing).unwrap();

        for _ in 0..8 {
            cache.invalidate_tenant(Uuid::new_v4());
        }
        cache.invalidate_tenant(racing);
        assert!(cache.inner.lock().unwrap().generations.len() <= 2);

        assert!(cache.get(kept, "q").is_some());
        assert!(!cache.put(racing, "q".to_string(), in_flight, vec![edge()]));
        let fresh = cache.generation(racing).unwrap();
        assert!(cache.put(racing, "q".to_string(), fresh, vec![edge()]));
    }

    #[test]
    fn test_cache_eviction() {
        let cache = QueryResultCache::new(2);
        let tenant = Uuid::new_v4();

        cache.put(tenant, "q1".to_string(), 0, vec![]);
        cache.put(tenant, "q2".to_string(), 0, vec![]);
        cache.put(tenant, "q3".to_string(), 0, vec![]);

        assert!(cache.get(tenant, "q1").is_none());
        assert!(cache.get(tenant, "q2").is_some());
        assert!(cache.get(tenant, "q3").is_some());
    }

    #[test]
    fn test_cache_clear() {
        let cache = QueryResultCache::new(10);
        let tenant = Uuid::new_v4();
        cache.put(tenant, "q1".to_string(), 0, vec![]);

        cache.clear();

        assert!(cache.is_empty());
        assert!(cache.get(tenant, "q1").is_none());
    }

    #[test]
    fn test_poisoned_cache_always_misses() {
        let cache = QueryResultCache::new(10);
        let tenant = Uuid::new_v4();
        cache.put(tenant, "q1".to_string(), 0, vec![edge()]);

        cache.poison();

        assert!(cache.get(tenant, "q1").is_none());
        assert!(cache.generation(tenant).is_none());
        assert!(!cache.put(tenant, "q2".to_string(), 0, vec![]));
        cache.invalidate_tenant(tenant);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_signature_stable_and_distinct() {
        let a = query_signature("traverse", &vec![1, 2, 3]).unwrap();
        let b = query_signature("traverse", &vec![1, 2, 3]).unwrap();
        let c = query_signature("path", &vec![1, 2, 3]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
