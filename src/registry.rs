//! Resource registry: interns resources by id.
//!
//! Resources live in `2^bucket_bits` shards, each a `parking_lot::Mutex`
//! around a `HashMap`. A shard lock is only held to look up, insert or
//! remove an entry; when both a shard and a resource must be locked, the
//! shard is always taken first.

use crate::resource::{Resource, ResourcePolicy};
use crate::types::ResourceId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tracing::trace;

pub struct ResourceRegistry {
    buckets: Vec<Mutex<HashMap<ResourceId, Arc<Resource>>>>,
    bits: u32,
    policy: Arc<ResourcePolicy>,
    live_locks: Arc<AtomicUsize>,
}

impl ResourceRegistry {
    pub fn new(bits: u32, policy: Arc<ResourcePolicy>, live_locks: Arc<AtomicUsize>) -> Self {
        let buckets = (0..1usize << bits)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            buckets,
            bits,
            policy,
            live_locks,
        }
    }

    fn bucket(&self, id: &ResourceId) -> &Mutex<HashMap<ResourceId, Arc<Resource>>> {
        &self.buckets[id.bucket(self.bits)]
    }

    /// Look up `id`, creating it if absent, and take a reference.
    pub fn get(&self, id: ResourceId) -> Arc<Resource> {
        let mut bucket = self.bucket(&id).lock();
        let resource = bucket.entry(id).or_insert_with(|| {
            trace!(resource = %id, "Resource created");
            Arc::new(Resource::new(
                id,
                Arc::clone(&self.policy),
                Arc::clone(&self.live_locks),
            ))
        });
        resource.get_ref();
        Arc::clone(resource)
    }

    /// Look up `id` without creating it or taking a reference.
    pub fn lookup(&self, id: &ResourceId) -> Option<Arc<Resource>> {
        self.bucket(id).lock().get(id).cloned()
    }

    /// Drop a reference taken by [`get`](Self::get). Returns `true` if the
    /// resource was reclaimed.
    pub fn put(&self, resource: &Arc<Resource>) -> bool {
        if resource.put_ref() > 0 {
            return false;
        }
        self.try_reclaim(resource)
    }

    /// Remove `resource` if nobody references it and it holds no locks.
    pub fn try_reclaim(&self, resource: &Arc<Resource>) -> bool {
        let id = resource.id();
        let mut bucket = self.bucket(&id).lock();
        if resource.refcount() > 0 {
            return false;
        }
        let Some(current) = bucket.get(&id) else {
            return false;
        };
        if !Arc::ptr_eq(current, resource) {
            return false;
        }
        let mut state = resource.state.lock();
        if !state.is_empty() {
            return false;
        }
        state.released = true;
        drop(state);
        bucket.remove(&id);
        trace!(resource = %id, "Resource reclaimed");
        true
    }

    /// Number of interned resources.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every interned resource.
    pub fn resources(&self) -> Vec<Arc<Resource>> {
        let mut all = Vec::new();
        for bucket in &self.buckets {
            all.extend(bucket.lock().values().cloned());
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DelmConfig;

    fn registry() -> ResourceRegistry {
        let config = DelmConfig::default();
        ResourceRegistry::new(
            2,
            Arc::new(ResourcePolicy::from_config(&config)),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    #[test]
    fn test_get_interns() {
        let reg = registry();
        let a = reg.get(ResourceId::new(0, 1));
        let b = reg.get(ResourceId::new(0, 1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_put_reclaims_at_zero() {
        let reg = registry();
        let id = ResourceId::new(0, 7);
        let a = reg.get(id);
        let b = reg.get(id);
        assert!(!reg.put(&a));
        assert!(reg.lookup(&id).is_some());
        assert!(reg.put(&b));
        assert!(reg.lookup(&id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_many_resources_spread() {
        let reg = registry();
        let held: Vec<_> = (0..64).map(|i| reg.get(ResourceId::new(1, i))).collect();
        assert_eq!(reg.len(), 64);
        assert_eq!(reg.resources().len(), 64);
        for r in &held {
            reg.put(r);
        }
        assert!(reg.is_empty());
    }
}
