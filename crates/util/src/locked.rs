//! Locked maps.
//!
//! [`SingleLockedMap`] keeps every entry behind one `RwLock`. [`ShardedMap`]
//! spreads entries over independent shards chosen by the FNV-1a hash of the
//! key, so unrelated keys do not contend. Both can be closed; a closed map
//! rejects every mutation with [`LockedMapError::Closed`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Errors of locked map operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockedMapError {
    /// The map was closed.
    #[error("locked map closed")]
    Closed,

    /// Returned by a callback to keep the current value untouched.
    #[error("ignore locked set")]
    SetIgnore,

    /// A sharded map needs at least one shard.
    #[error("empty shard size")]
    ZeroShards,

    /// Error raised by a caller's callback.
    #[error("{0}")]
    Callback(String),
}

/// A map behind a single lock.
#[derive(Debug)]
pub struct SingleLockedMap<K, V> {
    // None once closed
    inner: RwLock<Option<HashMap<K, V>>>,
}

impl<K: Eq + Hash, V> Default for SingleLockedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V> SingleLockedMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Some(HashMap::new())),
        }
    }

    /// Whether `key` is present.
    pub fn exists(&self, key: &K) -> bool {
        self.inner
            .read()
            .as_ref()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }

    /// Clone of the value under `key`.
    pub fn value(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.read().as_ref().and_then(|m| m.get(key).cloned())
    }

    /// Insert, returning whether a value was replaced.
    pub fn set_value(&self, key: K, value: V) -> Result<bool, LockedMapError> {
        let mut guard = self.inner.write();
        let map = guard.as_mut().ok_or(LockedMapError::Closed)?;
        Ok(map.insert(key, value).is_some())
    }

    /// Remove, returning whether a value was present.
    pub fn remove_value(&self, key: &K) -> Result<bool, LockedMapError> {
        let mut guard = self.inner.write();
        let map = guard.as_mut().ok_or(LockedMapError::Closed)?;
        Ok(map.remove(key).is_some())
    }

    /// Look at a value under the read lock.
    pub fn get<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> Result<R, LockedMapError> {
        let guard = self.inner.read();
        let map = guard.as_ref().ok_or(LockedMapError::Closed)?;
        Ok(f(map.get(key)))
    }

    /// Return the existing value or insert the one produced by `create`.
    ///
    /// The second element is `true` when the value was created.
    pub fn get_or_create(
        &self,
        key: K,
        create: impl FnOnce() -> Result<V, LockedMapError>,
    ) -> Result<(V, bool), LockedMapError>
    where
        V: Clone,
    {
        let mut guard = self.inner.write();
        let map = guard.as_mut().ok_or(LockedMapError::Closed)?;

        if let Some(v) = map.get(&key) {
            return Ok((v.clone(), false));
        }

        let v = create()?;
        map.insert(key, v.clone());
        Ok((v, true))
    }

    /// Replace the value with the result of `f`.
    ///
    /// When `f` returns [`LockedMapError::SetIgnore`] the current value is
    /// kept and `Ok(false)` is returned.
    pub fn set(
        &self,
        key: K,
        f: impl FnOnce(Option<&V>) -> Result<V, LockedMapError>,
    ) -> Result<bool, LockedMapError> {
        let mut guard = self.inner.write();
        let map = guard.as_mut().ok_or(LockedMapError::Closed)?;

        match f(map.get(&key)) {
            Ok(v) => {
                map.insert(key, v);
                Ok(true)
            }
            Err(LockedMapError::SetIgnore) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove the value if `f` agrees.
    ///
    /// When `f` returns [`LockedMapError::SetIgnore`] the value is kept.
    pub fn remove(
        &self,
        key: &K,
        f: impl FnOnce(Option<&V>) -> Result<(), LockedMapError>,
    ) -> Result<bool, LockedMapError> {
        let mut guard = self.inner.write();
        let map = guard.as_mut().ok_or(LockedMapError::Closed)?;

        match f(map.get(key)) {
            Ok(()) => Ok(map.remove(key).is_some()),
            Err(LockedMapError::SetIgnore) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Visit entries until `f` returns `false`. Returns `false` if stopped early.
    pub fn traverse(&self, mut f: impl FnMut(&K, &V) -> bool) -> bool {
        let guard = self.inner.read();
        let Some(map) = guard.as_ref() else {
            return true;
        };
        for (k, v) in map {
            if !f(k, v) {
                return false;
            }
        }
        true
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().as_ref().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn empty(&self) {
        if let Some(m) = self.inner.write().as_mut() {
            m.clear();
        }
    }

    /// Close the map; later mutations fail.
    pub fn close(&self) {
        *self.inner.write() = None;
    }

    /// Whether the map was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.read().is_none()
    }
}

/// 64-bit FNV-1a.
struct Fnv1a(u64);

impl Fnv1a {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
}

impl Hasher for Fnv1a {
    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

fn fnv1a<K: Hash>(key: &K) -> u64 {
    let mut h = Fnv1a(Fnv1a::OFFSET);
    key.hash(&mut h);
    h.finish()
}

/// A map sharded over independent [`SingleLockedMap`]s.
#[derive(Debug)]
pub struct ShardedMap<K, V> {
    shards: Vec<SingleLockedMap<K, V>>,
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    /// Create a map with `size` shards.
    pub fn new(size: usize) -> Result<Self, LockedMapError> {
        if size < 1 {
            return Err(LockedMapError::ZeroShards);
        }
        Ok(Self {
            shards: (0..size).map(|_| SingleLockedMap::new()).collect(),
        })
    }

    fn shard(&self, key: &K) -> &SingleLockedMap<K, V> {
        let i = (fnv1a(key) % self.shards.len() as u64) as usize;
        &self.shards[i]
    }

    fn is_closed(&self) -> bool {
        self.shards.iter().all(|s| s.is_closed())
    }
}

/// Locked map with either one lock or sharded locks.
#[derive(Debug)]
pub enum LockedMap<K, V> {
    /// One lock.
    Single(SingleLockedMap<K, V>),
    /// Sharded.
    Sharded(ShardedMap<K, V>),
}

impl<K: Eq + Hash, V> LockedMap<K, V> {
    /// Create a map. One shard gives a plain single-lock map; zero is an error.
    pub fn new(shards: usize) -> Result<Self, LockedMapError> {
        match shards {
            0 => Err(LockedMapError::ZeroShards),
            1 => Ok(LockedMap::Single(SingleLockedMap::new())),
            n => Ok(LockedMap::Sharded(ShardedMap::new(n)?)),
        }
    }

    fn slot(&self, key: &K) -> &SingleLockedMap<K, V> {
        match self {
            LockedMap::Single(m) => m,
            LockedMap::Sharded(s) => s.shard(key),
        }
    }

    fn all(&self) -> &[SingleLockedMap<K, V>] {
        match self {
            LockedMap::Single(m) => std::slice::from_ref(m),
            LockedMap::Sharded(s) => &s.shards,
        }
    }

    /// See [`SingleLockedMap::exists`].
    pub fn exists(&self, key: &K) -> bool {
        self.slot(key).exists(key)
    }

    /// See [`SingleLockedMap::value`].
    pub fn value(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.slot(key).value(key)
    }

    /// See [`SingleLockedMap::set_value`].
    pub fn set_value(&self, key: K, value: V) -> Result<bool, LockedMapError> {
        self.slot(&key).set_value(key, value)
    }

    /// See [`SingleLockedMap::remove_value`].
    pub fn remove_value(&self, key: &K) -> Result<bool, LockedMapError> {
        self.slot(key).remove_value(key)
    }

    /// See [`SingleLockedMap::get`].
    pub fn get<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> Result<R, LockedMapError> {
        self.slot(key).get(key, f)
    }

    /// See [`SingleLockedMap::get_or_create`].
    pub fn get_or_create(
        &self,
        key: K,
        create: impl FnOnce() -> Result<V, LockedMapError>,
    ) -> Result<(V, bool), LockedMapError>
    where
        V: Clone,
    {
        self.slot(&key).get_or_create(key, create)
    }

    /// See [`SingleLockedMap::set`].
    pub fn set(
        &self,
        key: K,
        f: impl FnOnce(Option<&V>) -> Result<V, LockedMapError>,
    ) -> Result<bool, LockedMapError> {
        self.slot(&key).set(key, f)
    }

    /// See [`SingleLockedMap::remove`].
    pub fn remove(
        &self,
        key: &K,
        f: impl FnOnce(Option<&V>) -> Result<(), LockedMapError>,
    ) -> Result<bool, LockedMapError> {
        self.slot(key).remove(key, f)
    }

    /// Visit entries of every shard until `f` returns `false`.
    pub fn traverse(&self, mut f: impl FnMut(&K, &V) -> bool) {
        for shard in self.all() {
            if !shard.traverse(&mut f) {
                return;
            }
        }
    }

    /// Number of entries over all shards.
    pub fn len(&self) -> usize {
        self.all().iter().map(|s| s.len()).sum()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn empty(&self) {
        self.all().iter().for_each(|s| s.empty());
    }

    /// Close every shard.
    pub fn close(&self) {
        self.all().iter().for_each(|s| s.close());
    }

    /// Whether the map was closed.
    pub fn is_closed(&self) -> bool {
        match self {
            LockedMap::Single(m) => m.is_closed(),
            LockedMap::Sharded(s) => s.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_shards_rejected() {
        assert_eq!(
            LockedMap::<u64, u64>::new(0).unwrap_err(),
            LockedMapError::ZeroShards
        );
        assert!(matches!(
            LockedMap::<u64, u64>::new(1).unwrap(),
            LockedMap::Single(_)
        ));
        assert!(matches!(
            LockedMap::<u64, u64>::new(4).unwrap(),
            LockedMap::Sharded(_)
        ));
    }

    #[test]
    fn test_sharded_basic_operations() {
        let m = LockedMap::new(8).unwrap();
        for i in 0..100u64 {
            assert!(!m.set_value(i, i * 2).unwrap());
        }
        assert_eq!(m.len(), 100);
        assert_eq!(m.value(&7), Some(14));
        assert!(m.remove_value(&7).unwrap());
        assert!(!m.exists(&7));

        let mut seen = 0;
        m.traverse(|_, _| {
            seen += 1;
            true
        });
        assert_eq!(seen, 99);
    }

    #[test]
    fn test_get_or_create_runs_create_once() {
        let m: LockedMap<&str, u32> = LockedMap::new(2).unwrap();
        let (v, created) = m.get_or_create("a", || Ok(1)).unwrap();
        assert_eq!((v, created), (1, true));

        let (v, created) = m
            .get_or_create("a", || panic!("should not be called"))
            .unwrap();
        assert_eq!((v, created), (1, false));
    }

    #[test]
    fn test_set_ignore_keeps_value() {
        let m: LockedMap<u8, u8> = LockedMap::new(1).unwrap();
        m.set_value(1, 10).unwrap();

        let updated = m.set(1, |_| Err(LockedMapError::SetIgnore)).unwrap();
        assert!(!updated);
        assert_eq!(m.value(&1), Some(10));

        let updated = m.set(1, |old| Ok(old.copied().unwrap_or(0) + 1)).unwrap();
        assert!(updated);
        assert_eq!(m.value(&1), Some(11));

        let removed = m.remove(&1, |_| Err(LockedMapError::SetIgnore)).unwrap();
        assert!(!removed);
        assert!(m.exists(&1));
    }

    #[test]
    fn test_closed_map_rejects_mutation() {
        let m: LockedMap<u8, u8> = LockedMap::new(3).unwrap();
        m.set_value(1, 1).unwrap();
        m.close();

        assert!(m.is_closed());
        assert_eq!(m.set_value(2, 2), Err(LockedMapError::Closed));
        assert_eq!(m.remove_value(&1), Err(LockedMapError::Closed));
        assert_eq!(m.value(&1), None);
        assert_eq!(m.len(), 0);
    }

    #[test]
    fn test_fnv1a_reference_value() {
        let mut h = Fnv1a(Fnv1a::OFFSET);
        h.write(b"a");
        assert_eq!(h.finish(), 0xaf63_dc4c_8601_ec8c);
    }
}
