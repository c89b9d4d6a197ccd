//! Resource identity cache for the metrics-engine backend.
//!
//! Remote resources are identified by their groupby values, so every pushed
//! point would otherwise need a search request. This cache remembers the last
//! `capacity` resources seen, evicting the least recently used.

use std::num::NonZeroUsize;

use cloudrate_core::Attributes;
use lru::LruCache;

/// Order-independent identity of a remote resource.
///
/// Two groupby maps with the same pairs always yield the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    metric_type: String,
    scope_id: String,
    groupby: Vec<(String, String)>,
}

impl ResourceKey {
    /// Build the key of the resource holding `metric_type` points of
    /// `scope_id` with these groupby values.
    #[must_use]
    pub fn new(metric_type: &str, scope_id: &str, groupby: &Attributes) -> Self {
        let mut pairs: Vec<(String, String)> = groupby
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort();
        Self {
            metric_type: metric_type.to_string(),
            scope_id: scope_id.to_string(),
            groupby: pairs,
        }
    }

    /// Metric type of the resource.
    #[must_use]
    pub fn metric_type(&self) -> &str {
        &self.metric_type
    }

    /// Scope of the resource.
    #[must_use]
    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// Sorted groupby pairs.
    #[must_use]
    pub fn groupby(&self) -> &[(String, String)] {
        &self.groupby
    }
}

/// What the cache knows about a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResource {
    /// Remote resource id.
    pub id: String,
    /// Id of the quantity metric.
    pub qty_metric: String,
    /// Id of the cost metric.
    pub cost_metric: String,
    /// Unit last written.
    pub unit: String,
    /// Metadata last written.
    pub metadata: Attributes,
    /// Metadata changed since the remote copy was last written.
    pub needs_update: bool,
}

/// Fixed-capacity LRU cache of resource identities.
#[derive(Debug)]
pub struct ResourceCache {
    entries: LruCache<ResourceKey, CachedResource>,
}

impl ResourceCache {
    /// Create a cache holding at most `capacity` resources (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Look up a resource and refresh its recency.
    ///
    /// When `unit` or `metadata` differ from the cached copy, the cached copy
    /// is replaced and flagged `needs_update`.
    pub fn touch(&mut self, key: &ResourceKey, unit: &str, metadata: &Attributes) -> Option<&CachedResource> {
        let entry = self.entries.get_mut(key)?;
        if entry.metadata != *metadata || entry.unit != unit {
            entry.metadata.clone_from(metadata);
            entry.unit = unit.to_string();
            entry.needs_update = true;
        }
        Some(entry)
    }

    /// Insert a resource.
    ///
    /// Returns the entry evicted to make room, if any, so a pending update
    /// on it is not lost.
    pub fn insert(&mut self, key: ResourceKey, resource: CachedResource) -> Option<(ResourceKey, CachedResource)> {
        match self.entries.push(key.clone(), resource) {
            Some((evicted_key, evicted)) if evicted_key != key => Some((evicted_key, evicted)),
            _ => None,
        }
    }

    /// Resources whose metadata must be written back.
    #[must_use]
    pub fn pending_updates(&self) -> Vec<(ResourceKey, CachedResource)> {
        self.entries
            .iter()
            .filter(|(_, resource)| resource.needs_update)
            .map(|(key, resource)| (key.clone(), resource.clone()))
            .collect()
    }

    /// Clear the `needs_update` flag without touching recency.
    pub fn mark_updated(&mut self, key: &ResourceKey) {
        if let Some(entry) = self.entries.peek_mut(key) {
            entry.needs_update = false;
        }
    }

    /// Forget every resource.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn resource(id: &str) -> CachedResource {
        CachedResource {
            id: id.to_string(),
            qty_metric: format!("{id}-qty"),
            cost_metric: format!("{id}-cost"),
            unit: "h".into(),
            metadata: attrs(&[("flavor", "m1")]),
            needs_update: false,
        }
    }

    #[test]
    fn key_ignores_insertion_order() {
        let mut left = Attributes::new();
        left.insert("b".into(), "2".into());
        left.insert("a".into(), "1".into());
        let right = attrs(&[("a", "1"), ("b", "2")]);
        assert_eq!(
            ResourceKey::new("compute", "p1", &left),
            ResourceKey::new("compute", "p1", &right)
        );
        assert_ne!(
            ResourceKey::new("compute", "p1", &left),
            ResourceKey::new("compute", "p2", &right)
        );
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = ResourceCache::new(2);
        let a = ResourceKey::new("compute", "p1", &attrs(&[("id", "a")]));
        let b = ResourceKey::new("compute", "p1", &attrs(&[("id", "b")]));
        let c = ResourceKey::new("compute", "p1", &attrs(&[("id", "c")]));

        assert!(cache.insert(a.clone(), resource("a")).is_none());
        assert!(cache.insert(b.clone(), resource("b")).is_none());
        // Touching `a` makes `b` the eviction candidate.
        assert!(cache.touch(&a, "h", &attrs(&[("flavor", "m1")])).is_some());

        let evicted = cache.insert(c, resource("c")).unwrap();
        assert_eq!(evicted.0, b);
        assert_eq!(cache.len(), 2);
        assert!(cache.touch(&b, "h", &Attributes::new()).is_none());
    }

    #[test]
    fn reinserting_same_key_is_not_an_eviction() {
        let mut cache = ResourceCache::new(1);
        let a = ResourceKey::new("compute", "p1", &attrs(&[("id", "a")]));
        cache.insert(a.clone(), resource("a"));
        assert!(cache.insert(a, resource("a2")).is_none());
    }

    #[test]
    fn metadata_change_marks_needs_update() {
        let mut cache = ResourceCache::new(4);
        let key = ResourceKey::new("compute", "p1", &attrs(&[("id", "a")]));
        cache.insert(key.clone(), resource("a"));

        let same = cache.touch(&key, "h", &attrs(&[("flavor", "m1")])).unwrap();
        assert!(!same.needs_update);

        let changed = cache.touch(&key, "h", &attrs(&[("flavor", "m2")])).unwrap();
        assert!(changed.needs_update);
        assert_eq!(cache.pending_updates().len(), 1);

        cache.mark_updated(&key);
        assert!(cache.pending_updates().is_empty());
    }

    #[test]
    fn zero_capacity_holds_one_entry() {
        let mut cache = ResourceCache::new(0);
        cache.insert(ResourceKey::new("a", "p", &Attributes::new()), resource("a"));
        assert_eq!(cache.len(), 1);
    }
}
