use crate::{
    make_error,
    status::{Result, StatusCode},
};

/// A small map with inline storage and linear lookup.
pub struct ArrayMap<K, V, const N: usize> {
    entries: [Option<(K, V)>; N],
}

impl<K: PartialEq, V, const N: usize> ArrayMap<K, V, N> {
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| None),
        }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.entries.iter().all(|e| e.is_some())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        if self.contains_key(&key) {
            return Err(make_error!(StatusCode::AlreadyAllocated));
        }
        let slot = self
            .entries
            .iter_mut()
            .find(|e| e.is_none())
            .ok_or_else(|| make_error!(StatusCode::Full))?;
        *slot = Some((key, value));
        Ok(())
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries
            .iter()
            .flatten()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries
            .iter_mut()
            .flatten()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().flatten().map(|(k, v)| (k, v))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self
            .entries
            .iter_mut()
            .find(|e| matches!(e, Some((k, _)) if k == key))?;
        slot.take().map(|(_, v)| v)
    }
}

impl<K: PartialEq, V, const N: usize> Default for ArrayMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}
