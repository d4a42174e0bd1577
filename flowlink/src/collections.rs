//! Maps that give memory back after bursts.
//!
//! Removals since the last insertion are counted. Once that count reaches
//! 1/16 of the configured capacity the table is shrunk. The per-round maps
//! swell while a round is pending and are cleared or thinned after.

use hashbrown::HashMap;

/// Shrink threshold from max capacity (1/16, minimum 1).
const fn shrink_threshold(max_capacity: usize) -> u8 {
    let threshold = max_capacity / 16;
    if threshold == 0 {
        1
    } else if threshold > u8::MAX as usize {
        u8::MAX
    } else {
        threshold as u8
    }
}

/// A HashMap that shrinks after consecutive removals without additions.
pub struct ShrinkingHashMap<K, V, S = hashbrown::DefaultHashBuilder> {
    inner: HashMap<K, V, S>,
    removals_since_add: u8,
    shrink_threshold: u8,
}

impl<K, V> ShrinkingHashMap<K, V, hashbrown::DefaultHashBuilder> {
    pub fn with_max_capacity(max_capacity: usize) -> Self {
        Self {
            inner: HashMap::new(),
            removals_since_add: 0,
            shrink_threshold: shrink_threshold(max_capacity),
        }
    }
}

impl<K, V, S> ShrinkingHashMap<K, V, S>
where
    K: Eq + core::hash::Hash,
    S: core::hash::BuildHasher,
{
    /// Insert or overwrite. Resets the removal counter.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.removals_since_add = 0;
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let result = self.inner.remove(key);
        if result.is_some() {
            self.note_removed();
        }
        result
    }

    /// Remove every entry and release the table.
    pub fn clear(&mut self) {
        self.inner.clear();
        self.inner.shrink_to_fit();
        self.removals_since_add = 0;
    }

    fn note_removed(&mut self) {
        self.removals_since_add = self.removals_since_add.saturating_add(1);
        if self.removals_since_add >= self.shrink_threshold {
            self.inner.shrink_to_fit();
            self.removals_since_add = 0;
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_overwrite_remove_and_clear() {
        let mut m = ShrinkingHashMap::with_max_capacity(20);
        assert_eq!(m.insert([1u8; 6], 1), None);
        assert_eq!(m.insert([1u8; 6], 2), Some(1));
        m.insert([2u8; 6], 3);
        assert_eq!(m.remove(&[1u8; 6]), Some(2));
        assert_eq!(m.remove(&[1u8; 6]), None);
        assert_eq!(m.get(&[2u8; 6]), Some(&3));
        m.clear();
        assert_eq!(m.get(&[2u8; 6]), None);
    }

    #[test]
    fn test_threshold_bounds() {
        assert_eq!(shrink_threshold(0), 1);
        assert_eq!(shrink_threshold(20), 1);
        assert_eq!(shrink_threshold(64), 4);
        assert_eq!(shrink_threshold(100_000), u8::MAX);
    }
}
