//! Densely numbered side tables.

use crate::EntityRef;
use crate::Keys;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Index, IndexMut};

/// A mapping `K -> V` for densely indexed entity references, used to associate
/// secondary information with entities owned by a `PrimaryMap`.
///
/// All keys are valid: entries not written yet read as the default value. The
/// map grows lazily on mutable access.
#[derive(Clone)]
pub struct SecondaryMap<K, V>
where
    K: EntityRef,
    V: Clone,
{
    elems: Vec<V>,
    default: V,
    unused: PhantomData<K>,
}

impl<K, V> SecondaryMap<K, V>
where
    K: EntityRef,
    V: Clone + Default,
{
    /// Create a new empty map.
    pub fn new() -> Self {
        Self {
            elems: Vec::new(),
            default: Default::default(),
            unused: PhantomData,
        }
    }

    /// Create a new, empty map with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            elems: Vec::with_capacity(capacity),
            default: Default::default(),
            unused: PhantomData,
        }
    }
}

impl<K, V> SecondaryMap<K, V>
where
    K: EntityRef,
    V: Clone,
{
    /// Create a new empty map with a specified default value.
    pub fn with_default(default: V) -> Self {
        Self {
            elems: Vec::new(),
            default,
            unused: PhantomData,
        }
    }

    /// Get the number of elements the backing storage holds. Note that
    /// conceptually the map covers every key; this is only relevant for
    /// iteration.
    pub fn capacity(&self) -> usize {
        self.elems.len()
    }

    /// Remove all entries from this map.
    pub fn clear(&mut self) {
        self.elems.clear()
    }

    /// Resize the backing storage to cover `n` entities.
    pub fn resize(&mut self, n: usize) {
        self.elems.resize(n, self.default.clone());
    }

    /// Iterate over the backed keys of this map.
    pub fn keys(&self) -> Keys<K> {
        Keys::with_len(self.elems.len())
    }

    /// Iterate over the backed values of this map.
    pub fn values(&self) -> core::slice::Iter<V> {
        self.elems.iter()
    }

    /// Iterate over the backed keys and values of this map.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.elems.iter().enumerate().map(|(i, v)| (K::new(i), v))
    }
}

impl<K, V> Default for SecondaryMap<K, V>
where
    K: EntityRef,
    V: Clone + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable indexing. All keys are valid; unbacked entries read as default.
impl<K, V> Index<K> for SecondaryMap<K, V>
where
    K: EntityRef,
    V: Clone,
{
    type Output = V;

    fn index(&self, k: K) -> &V {
        self.elems.get(k.index()).unwrap_or(&self.default)
    }
}

/// Mutable indexing. The backing storage grows as needed.
impl<K, V> IndexMut<K> for SecondaryMap<K, V>
where
    K: EntityRef,
    V: Clone,
{
    fn index_mut(&mut self, k: K) -> &mut V {
        let i = k.index();
        if i >= self.elems.len() {
            self.elems.resize(i + 1, self.default.clone());
        }
        &mut self.elems[i]
    }
}

impl<K, V> fmt::Debug for SecondaryMap<K, V>
where
    K: EntityRef + fmt::Debug,
    V: Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    struct E(u32);
    crate::entity_impl!(E);

    #[test]
    fn default_reads() {
        let map: SecondaryMap<E, i32> = SecondaryMap::new();
        assert_eq!(map[E::new(7)], 0);
    }

    #[test]
    fn grow_on_write() {
        let mut map: SecondaryMap<E, i32> = SecondaryMap::new();
        map[E::new(3)] = 42;
        assert_eq!(map[E::new(3)], 42);
        assert_eq!(map[E::new(0)], 0);
        assert_eq!(map.capacity(), 4);
    }
}
