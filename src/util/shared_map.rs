use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::Arc;

/// A copy-on-write map for read-mostly shared state (the server's peer
///  registry): readers grab a cheap snapshot (an `Arc` clone) and iterate
///  without holding any lock, writers clone the map, apply their change and
///  swap the snapshot in. Mutations are rare (peers connect and disconnect)
///  while reads happen on every datagram, which is the trade-off this tilts
///  toward.
pub struct SharedMap<K, V> {
    map: RwLock<Arc<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> SharedMap<K, V> {
    pub fn new() -> SharedMap<K, V> {
        SharedMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// An immutable snapshot of the current state. Later mutations swap in a
    ///  new map and leave the snapshot untouched.
    pub fn snapshot(&self) -> Arc<FxHashMap<K, V>> {
        self.map.read().clone()
    }

    pub fn values(&self) -> Vec<V> {
        self.map.read().values().cloned().collect()
    }

    pub fn insert(&self, key: K, value: V) {
        self.update(|m| {
            m.insert(key.clone(), value.clone());
        });
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut removed = None;
        self.update(|m| {
            removed = m.remove(key);
        });
        removed
    }

    fn update(&self, f: impl FnMut(&mut FxHashMap<K, V>)) {
        let mut f = f;
        let mut guard = self.map.write();
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Default for SharedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let map = SharedMap::<u32, String>::new();
        assert!(map.is_empty());

        map.insert(1, "one".to_string());
        map.insert(2, "two".to_string());
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&1), Some("one".to_string()));
        assert_eq!(map.get(&3), None);

        assert_eq!(map.remove(&1), Some("one".to_string()));
        assert_eq!(map.remove(&1), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_mutation() {
        let map = SharedMap::<u32, u32>::new();
        map.insert(1, 10);

        let snapshot = map.snapshot();
        map.insert(2, 20);
        map.remove(&1);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&1), Some(&10));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&2), Some(20));
    }

    #[test]
    fn test_values() {
        let map = SharedMap::<u32, u32>::new();
        map.insert(1, 10);
        map.insert(2, 20);

        let mut values = map.values();
        values.sort();
        assert_eq!(values, vec![10, 20]);
    }
}
