//! The [`Ctrie`][crate::Ctrie] map type and its helpers.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::raw::config::Config;
use crate::raw::{self, Raw, TraverseMode};

// :-( It would be nice if we could provide deref to (K, V). But that is
// incompatible with unsized values.
/// An entry stored inside the [`Ctrie`].
///
/// Or, more precisely, the [`Arc`] handles to these are stored in there.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Entry<K, V: ?Sized> {
    key: K,
    value: V,
}

impl<K, V> Entry<K, V> {
    /// Creates a new entry with the given key and value.
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

impl<K, V: ?Sized> Entry<K, V> {
    /// Provides access to the key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Provides access to the value.
    pub fn value(&self) -> &V {
        &self.value
    }
}

struct MapPayload<K, V: ?Sized>(Arc<Entry<K, V>>);

impl<K, V: ?Sized> Clone for MapPayload<K, V> {
    fn clone(&self) -> Self {
        MapPayload(Arc::clone(&self.0))
    }
}

impl<K, V: ?Sized> Borrow<K> for MapPayload<K, V> {
    fn borrow(&self) -> &K {
        self.0.key()
    }
}

struct MapConfig<K, V: ?Sized>(PhantomData<(K, V)>);

impl<K, V> Config for MapConfig<K, V>
where
    V: ?Sized + 'static,
    K: Hash + Eq + 'static,
{
    type Payload = MapPayload<K, V>;
    type Key = K;
}

/// A concurrent map with constant-time snapshots.
///
/// The map stores its data as [`Arc<Entry<K, V>>`][Entry], so handles to
/// the held values can be returned cheaply even if the data is large or
/// impossible to clone, and the values may be `?Sized` (trait objects,
/// slices). Lookups, inserts and removals are lock-free; any number of
/// threads can hammer the same map through shared references.
///
/// What sets it apart from an ordinary concurrent map is
/// [`snapshot`][Ctrie::snapshot] and
/// [`snapshot_read_only`][Ctrie::snapshot_read_only]: both take a
/// point-in-time view of the whole map in O(1), without stopping readers or
/// writers. The writable flavour is an independent fork; the read-only
/// flavour is a frozen [`Snapshot`] that can be iterated consistently while
/// the original keeps changing.
///
/// Iteration always goes through a read-only snapshot (taking one is cheap),
/// so an iterator observes the map exactly as it was at one instant.
///
/// # Size accounting
///
/// [`len`][Ctrie::len] is maintained as an atomic counter adjusted after
/// each successful insert or remove. It converges whenever the map is
/// quiescent, but a reader racing writers may see the count lag the tree by
/// the operations currently in flight. An exact count of a frozen view is
/// available through [`Snapshot::count`].
///
/// # Examples
///
/// ```rust
/// use ctrie::Ctrie;
/// use crossbeam_utils::thread;
///
/// let map = Ctrie::new();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         map.insert("hello", 1);
///     });
///     s.spawn(|_| {
///         map.insert("world", 2);
///     });
/// }).unwrap();
/// assert_eq!(1, *map.get("hello").unwrap().value());
/// assert_eq!(2, *map.get("world").unwrap().value());
/// ```
///
/// ```rust
/// use ctrie::Ctrie;
///
/// let map = Ctrie::new();
/// map.insert("a", 0);
///
/// let frozen = map.snapshot_read_only();
/// map.insert("b", 1);
///
/// // The snapshot still sees the old state.
/// assert!(frozen.get("b").is_none());
/// assert_eq!(1, frozen.len());
/// assert_eq!(2, map.len());
/// ```
pub struct Ctrie<K, V, S = RandomState>
where
    // TODO: It would be great if the bounds wouldn't have to be on the
    // struct, only on the impls.
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    raw: Raw<MapConfig<K, V>, S>,
    len: AtomicUsize,
}

impl<K, V> Ctrie<K, V>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V, S> Ctrie<K, V, S>
where
    K: Hash + Eq + 'static,
    V: 'static,
    S: BuildHasher,
{
    /// Inserts a new entry, replacing and returning any previous one with
    /// the same key.
    pub fn insert(&self, key: K, value: V) -> Option<Arc<Entry<K, V>>> {
        self.insert_entry(Arc::new(Entry::new(key, value)))
    }

    /// Inserts a new entry unless the key is already present.
    ///
    /// Returns the preserved existing entry, or `None` if the new one went
    /// in. Nothing is overwritten either way.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<Arc<Entry<K, V>>> {
        self.insert_entry_if_absent(Arc::new(Entry::new(key, value)))
    }
}

impl<K, V, S> Ctrie<K, V, S>
where
    K: Hash + Eq,
    V: ?Sized,
    S: BuildHasher,
{
    /// Creates a new empty map, but with the provided hasher implementation.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            raw: Raw::with_hasher(hasher),
            len: AtomicUsize::new(0),
        }
    }

    /// Inserts an already created entry.
    ///
    /// This acts the same as [insert][Ctrie::insert], but takes the entry
    /// handle. It can be used when:
    ///
    /// * `V: ?Sized`.
    /// * You want to insert the same entry into multiple maps.
    pub fn insert_entry(&self, entry: Arc<Entry<K, V>>) -> Option<Arc<Entry<K, V>>> {
        let pin = crossbeam_epoch::pin();
        let previous = self
            .raw
            .insert(MapPayload(entry), TraverseMode::Overwrite, &pin)
            .expect("a writable map cannot be read-only")
            .map(|payload| Arc::clone(&payload.0));
        if previous.is_none() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        previous
    }

    /// The handle-taking flavour of [insert_if_absent][Ctrie::insert_if_absent].
    pub fn insert_entry_if_absent(&self, entry: Arc<Entry<K, V>>) -> Option<Arc<Entry<K, V>>> {
        let pin = crossbeam_epoch::pin();
        let existing = self
            .raw
            .insert(MapPayload(entry), TraverseMode::IfAbsent, &pin)
            .expect("a writable map cannot be read-only")
            .map(|payload| Arc::clone(&payload.0));
        if existing.is_none() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        existing
    }

    /// Looks up an entry.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .get(key, &pin)
            .map(|payload| Arc::clone(&payload.0))
    }

    /// Removes an entry identified by the given key, returning it.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        let removed = self
            .raw
            .remove(key, |_| true, &pin)
            .expect("a writable map cannot be read-only")
            .map(|payload| Arc::clone(&payload.0));
        if removed.is_some() {
            self.decrement_len();
        }
        removed
    }

    /// Removes the entry for the key only if its value equals the expected
    /// one.
    ///
    /// Returns the removed entry; `None` means either the key was absent or
    /// the value did not match (in which case nothing was removed).
    pub fn remove_conditional<Q>(&self, key: &Q, expected: &V) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: PartialEq,
    {
        let pin = crossbeam_epoch::pin();
        let removed = self
            .raw
            .remove(key, |payload| payload.0.value() == expected, &pin)
            .expect("a writable map cannot be read-only")
            .map(|payload| Arc::clone(&payload.0));
        if removed.is_some() {
            self.decrement_len();
        }
        removed
    }

}

impl<K, V, S> Ctrie<K, V, S>
where
    K: Hash + Eq,
    V: ?Sized,
    S: BuildHasher + Clone,
{
    /// Atomically replaces the whole content with an empty map.
    pub fn clear(&self) {
        let pin = crossbeam_epoch::pin();
        self.raw
            .clear(&pin)
            .expect("a writable map cannot be read-only");
        self.len.store(0, Ordering::Relaxed);
    }
}

impl<K, V, S> Ctrie<K, V, S>
where
    K: Hash + Eq,
    V: ?Sized,
{
    /// The number of entries, as maintained by the convergent counter.
    ///
    /// See the [type documentation][Ctrie] for the exact guarantee.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Checks if the map is currently empty.
    ///
    /// Equivalent to `len() == 0`, with the same caveat about concurrent
    /// writers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Removal can race `clear`, in which case the count is already zeroed;
    // saturate instead of wrapping around.
    fn decrement_len(&self) {
        let _ = self
            .len
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }
}

impl<K, V, S> Ctrie<K, V, S>
where
    K: Hash + Eq,
    V: ?Sized,
    S: Clone,
{
    /// An O(1) fork of this map.
    ///
    /// The fork and the original share structure and copy it lazily as
    /// either side gets written to; mutating one is never visible in the
    /// other.
    pub fn snapshot(&self) -> Self {
        let pin = crossbeam_epoch::pin();
        let raw = self
            .raw
            .snapshot(&pin)
            .expect("a writable map cannot be read-only");
        Ctrie {
            raw,
            len: AtomicUsize::new(self.len.load(Ordering::Relaxed)),
        }
    }

    /// An O(1) frozen view of this map.
    ///
    /// The snapshot can be looked up and iterated, but never written to; it
    /// keeps showing the state from the instant it was taken, no matter
    /// what happens to the original.
    pub fn snapshot_read_only(&self) -> Snapshot<K, V, S> {
        let pin = crossbeam_epoch::pin();
        let raw = self
            .raw
            .snapshot_read_only(&pin)
            .expect("a writable map cannot be read-only");
        Snapshot {
            raw,
            len: self.len.load(Ordering::Relaxed),
        }
    }

    /// Returns an iterator over a fresh read-only snapshot of the map.
    ///
    /// The iterator yields (cloned) handles to the entries present at the
    /// moment of the call, in unspecified order.
    pub fn iter(&self) -> SnapshotIter<K, V, S> {
        SnapshotIter::new(self.snapshot_read_only())
    }
}

impl<K, V> Default for Ctrie<K, V>
where
    K: Hash + Eq,
    V: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Debug for Ctrie<K, V, S>
where
    K: Debug + Hash + Eq,
    V: Debug + ?Sized,
    S: Clone + 'static,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        let mut d = fmt.debug_map();
        for entry in self.iter() {
            let val: &&V = &entry.value();
            d.entry(entry.key() as &dyn Debug, val);
        }
        d.finish()
    }
}

impl<K, V, S> Clone for Ctrie<K, V, S>
where
    K: Hash + Eq,
    V: ?Sized,
    S: Clone,
{
    /// Cloning takes a (cheap) writable snapshot instead of copying the
    /// entries one by one.
    fn clone(&self) -> Self {
        self.snapshot()
    }
}

/// A frozen point-in-time view of a [`Ctrie`].
///
/// Created by [`Ctrie::snapshot_read_only`]. The view never changes; the
/// trie it was taken from keeps living its own life.
pub struct Snapshot<K, V, S = RandomState>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    raw: Raw<MapConfig<K, V>, S>,
    len: usize,
}

impl<K, V, S> Snapshot<K, V, S>
where
    K: Hash + Eq,
    V: ?Sized,
{
    /// Looks up an entry in the frozen view.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        S: BuildHasher,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .get(key, &pin)
            .map(|payload| Arc::clone(&payload.0))
    }

    /// The counter value inherited at the snapshot instant.
    ///
    /// Exact whenever the source map was quiescent; see
    /// [`count`][Snapshot::count] for the walked, always-exact number.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Is the view empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counts the entries by walking the frozen tree.
    pub fn count(&self) -> usize {
        let mut iter = raw::iterator::Iter::new(&self.raw);
        let mut count = 0;
        while iter.next().is_some() {
            count += 1;
        }
        count
    }

    /// Returns an iterator through the entries of the view.
    pub fn iter(&self) -> Iter<K, V, S> {
        Iter {
            inner: raw::iterator::Iter::new(&self.raw),
        }
    }
}

/// The borrowing iterator of a [`Snapshot`].
///
/// See the [`iter`][Snapshot::iter] method for details.
pub struct Iter<'a, K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    inner: raw::iterator::Iter<'a, MapConfig<K, V>, S>,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    type Item = Arc<Entry<K, V>>;
    fn next(&mut self) -> Option<Arc<Entry<K, V>>> {
        self.inner.next().map(|payload| Arc::clone(&payload.0))
    }
}

impl<'a, K, V, S> IntoIterator for &'a Snapshot<K, V, S>
where
    K: Hash + Eq,
    V: ?Sized,
{
    type Item = Arc<Entry<K, V>>;
    type IntoIter = Iter<'a, K, V, S>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// An iterator owning the snapshot it walks.
///
/// Returned by [`Ctrie::iter`]; iterating the map always means iterating a
/// fresh frozen view of it.
pub struct SnapshotIter<K, V, S: 'static>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    // The inner iterator points into the boxed snapshot below. It is
    // declared first so it is dropped first; the 'static is a lie along the
    // same lines as the one inside the raw iterator.
    inner: raw::iterator::Iter<'static, MapConfig<K, V>, S>,
    _snapshot: Box<Snapshot<K, V, S>>,
}

impl<K, V, S: 'static> SnapshotIter<K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    fn new(snapshot: Snapshot<K, V, S>) -> Self {
        let snapshot = Box::new(snapshot);
        // The box gives the snapshot a stable address for as long as this
        // iterator lives, which is exactly the lifetime the inner iterator
        // needs and Rust cannot name.
        let raw: &'static Raw<MapConfig<K, V>, S> =
            unsafe { mem::transmute(&snapshot.raw) };
        SnapshotIter {
            inner: raw::iterator::Iter::new(raw),
            _snapshot: snapshot,
        }
    }
}

impl<K, V, S: 'static> Iterator for SnapshotIter<K, V, S>
where
    K: Hash + Eq + 'static,
    V: ?Sized + 'static,
{
    type Item = Arc<Entry<K, V>>;
    fn next(&mut self) -> Option<Arc<Entry<K, V>>> {
        self.inner.next().map(|payload| Arc::clone(&payload.0))
    }
}

impl<K, V, S> IntoIterator for &Ctrie<K, V, S>
where
    K: Hash + Eq,
    V: ?Sized,
    S: Clone + 'static,
{
    type Item = Arc<Entry<K, V>>;
    type IntoIter = SnapshotIter<K, V, S>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, S> Extend<Arc<Entry<K, V>>> for &'a Ctrie<K, V, S>
where
    K: Hash + Eq,
    V: ?Sized,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = Arc<Entry<K, V>>>,
    {
        for entry in iter {
            self.insert_entry(entry);
        }
    }
}

impl<'a, K, V, S> Extend<(K, V)> for &'a Ctrie<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        self.extend(iter.into_iter().map(|(k, v)| Arc::new(Entry::new(k, v))));
    }
}

impl<K, V, S> Extend<Arc<Entry<K, V>>> for Ctrie<K, V, S>
where
    K: Hash + Eq,
    V: ?Sized,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = Arc<Entry<K, V>>>,
    {
        let mut me: &Ctrie<_, _, _> = self;
        me.extend(iter);
    }
}

impl<K, V, S> Extend<(K, V)> for Ctrie<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me: &Ctrie<_, _, _> = self;
        me.extend(iter);
    }
}

impl<K, V> FromIterator<Arc<Entry<K, V>>> for Ctrie<K, V>
where
    K: Hash + Eq,
    V: ?Sized,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Arc<Entry<K, V>>>,
    {
        let mut me = Ctrie::new();
        me.extend(iter);
        me
    }
}

impl<K, V> FromIterator<(K, V)> for Ctrie<K, V>
where
    K: Hash + Eq,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me = Ctrie::new();
        me.extend(iter);
        me
    }
}

#[cfg(feature = "parallel")]
impl<'a, K, V, S> ParallelExtend<Arc<Entry<K, V>>> for &'a Ctrie<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: ?Sized + Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = Arc<Entry<K, V>>>,
    {
        par_iter.into_par_iter().for_each(|entry| {
            self.insert_entry(entry);
        });
    }
}

#[cfg(feature = "parallel")]
impl<'a, K, V, S> ParallelExtend<(K, V)> for &'a Ctrie<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    S: BuildHasher + Sync,
    V: Send + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        self.par_extend(
            par_iter
                .into_par_iter()
                .map(|(k, v)| Arc::new(Entry::new(k, v))),
        );
    }
}

#[cfg(feature = "parallel")]
impl<K, V, S> ParallelExtend<Arc<Entry<K, V>>> for Ctrie<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: ?Sized + Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = Arc<Entry<K, V>>>,
    {
        let mut me: &Ctrie<_, _, _> = self;
        me.par_extend(par_iter);
    }
}

#[cfg(feature = "parallel")]
impl<K, V, S> ParallelExtend<(K, V)> for Ctrie<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    S: BuildHasher + Sync,
    V: Send + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me: &Ctrie<_, _, _> = self;
        me.par_extend(par_iter);
    }
}

#[cfg(feature = "parallel")]
impl<K, V> FromParallelIterator<Arc<Entry<K, V>>> for Ctrie<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: ?Sized + Send + Sync,
{
    fn from_par_iter<T>(par_iter: T) -> Self
    where
        T: IntoParallelIterator<Item = Arc<Entry<K, V>>>,
    {
        let mut me = Ctrie::new();
        me.par_extend(par_iter);
        me
    }
}

#[cfg(feature = "parallel")]
impl<K, V> FromParallelIterator<(K, V)> for Ctrie<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
{
    fn from_par_iter<T>(par_iter: T) -> Self
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me = Ctrie::new();
        me.par_extend(par_iter);
        me
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_utils::thread;

    #[cfg(feature = "parallel")]
    use rayon::prelude::*;

    use super::*;
    use crate::raw::tests::{MakeSplatHasher, NoHasher};

    const TEST_THREADS: usize = 4;
    const TEST_BATCH: usize = 10000;
    const TEST_BATCH_SMALL: usize = 100;
    const TEST_REP: usize = 20;

    #[test]
    fn create_destroy() {
        let map: Ctrie<String, usize> = Ctrie::new();
        drop(map);
    }

    #[test]
    fn lookup_empty() {
        let map: Ctrie<String, usize> = Ctrie::new();
        assert!(map.get("hello").is_none());
    }

    #[test]
    fn insert_lookup() {
        let map = Ctrie::new();
        assert!(map.insert("hello", "world").is_none());
        assert!(map.get("world").is_none());
        let found = map.get("hello").unwrap();
        assert_eq!(Entry::new("hello", "world"), *found);
        assert_eq!(1, map.len());
    }

    #[test]
    fn insert_overwrite_lookup() {
        let map = Ctrie::new();
        assert!(map.insert("hello", "world").is_none());
        let old = map.insert("hello", "universe").unwrap();
        assert_eq!(Entry::new("hello", "world"), *old);
        let found = map.get("hello").unwrap();
        assert_eq!(Entry::new("hello", "universe"), *found);
        assert_eq!(1, map.len());
    }

    // Insert a lot of things, to make sure we have multiple levels.
    #[test]
    fn insert_many() {
        let map = Ctrie::new();
        for i in 0..TEST_BATCH {
            assert!(map.insert(i, i).is_none());
        }

        for i in 0..TEST_BATCH {
            assert_eq!(i, *map.get(&i).unwrap().value());
        }
        assert_eq!(TEST_BATCH, map.len());
    }

    #[test]
    fn par_insert_many() {
        for _ in 0..TEST_REP {
            let map: Ctrie<usize, usize> = Ctrie::new();
            thread::scope(|s| {
                for t in 0..TEST_THREADS {
                    let map = &map;
                    s.spawn(move |_| {
                        for i in 0..TEST_BATCH {
                            let num = t * TEST_BATCH + i;
                            assert!(map.insert(num, num).is_none());
                        }
                    });
                }
            })
            .unwrap();

            for i in 0..TEST_BATCH * TEST_THREADS {
                assert_eq!(*map.get(&i).unwrap().value(), i);
            }
            assert_eq!(TEST_BATCH * TEST_THREADS, map.len());
        }
    }

    #[test]
    fn par_get_many() {
        for _ in 0..TEST_REP {
            let map = Ctrie::new();
            for i in 0..TEST_BATCH * TEST_THREADS {
                assert!(map.insert(i, i).is_none());
            }
            thread::scope(|s| {
                for t in 0..TEST_THREADS {
                    let map = &map;
                    s.spawn(move |_| {
                        for i in 0..TEST_BATCH {
                            let num = t * TEST_BATCH + i;
                            assert_eq!(*map.get(&num).unwrap().value(), num);
                        }
                    });
                }
            })
            .unwrap();
        }
    }

    #[test]
    fn collisions() {
        let map = Ctrie::with_hasher(NoHasher);
        // While their hash is the same under the hasher, they don't kick
        // each other out.
        for i in 0..TEST_BATCH_SMALL {
            assert!(map.insert(i, i).is_none());
        }
        // And all are present.
        for i in 0..TEST_BATCH_SMALL {
            assert_eq!(i, *map.get(&i).unwrap().value());
        }
        // But reusing the key kicks the other one out.
        for i in 0..TEST_BATCH_SMALL {
            assert_eq!(i, *map.insert(i, i + 1).unwrap().value());
            assert_eq!(i + 1, *map.get(&i).unwrap().value());
        }
        assert_eq!(TEST_BATCH_SMALL, map.len());
    }

    #[test]
    fn insert_if_absent_empty() {
        let map = Ctrie::new();
        assert!(map.insert_if_absent("hello", 42).is_none());
        assert_eq!(42, *map.get("hello").unwrap().value());
    }

    #[test]
    fn insert_if_absent_existing() {
        let map = Ctrie::new();
        assert!(map.insert("hello", 42).is_none());
        let existing = map.insert_if_absent("hello", 0).unwrap();
        // We still have the original.
        assert_eq!(42, *existing.value());
        assert_eq!(42, *map.get("hello").unwrap().value());
        assert_eq!(1, map.len());
    }

    fn insert_if_absent_many_inner<H: BuildHasher>(map: Ctrie<usize, usize, H>, len: usize) {
        for i in 0..len {
            assert!(map.insert_if_absent(i, i).is_none());
        }

        for i in 0..len {
            let existing = map.insert_if_absent(i, 0).unwrap();
            assert_eq!(i, *existing.key());
            assert_eq!(i, *existing.value());
        }
        assert_eq!(len, map.len());
    }

    #[test]
    fn insert_if_absent_many() {
        insert_if_absent_many_inner(Ctrie::new(), TEST_BATCH);
    }

    #[test]
    fn insert_if_absent_collision() {
        insert_if_absent_many_inner(Ctrie::with_hasher(NoHasher), TEST_BATCH_SMALL);
    }

    #[test]
    fn simple_remove() {
        let map = Ctrie::new();
        assert!(map.remove(&42).is_none());
        assert!(map.insert(42, "hello").is_none());
        assert_eq!("hello", *map.get(&42).unwrap().value());
        assert_eq!("hello", *map.remove(&42).unwrap().value());
        assert!(map.get(&42).is_none());
        assert!(map.is_empty());
        assert!(map.remove(&42).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn conditional_remove() {
        let map = Ctrie::new();
        map.insert("k", 1);
        assert!(map.remove_conditional("k", &2).is_none());
        assert_eq!(1, *map.get("k").unwrap().value());
        assert_eq!(1, *map.remove_conditional("k", &1).unwrap().value());
        assert!(map.get("k").is_none());
        assert!(map.is_empty());
    }

    fn remove_many_inner<H: BuildHasher>(mut map: Ctrie<usize, usize, H>, len: usize) {
        for i in 0..len {
            assert!(map.insert(i, i).is_none());
        }
        for i in 0..len {
            assert_eq!(i, *map.get(&i).unwrap().value());
            assert_eq!(i, *map.remove(&i).unwrap().value());
            assert!(map.get(&i).is_none());
            map.raw.assert_invariants();
        }

        assert!(map.is_empty());
    }

    #[test]
    fn remove_many() {
        remove_many_inner(Ctrie::new(), TEST_BATCH);
    }

    #[test]
    fn remove_many_collision() {
        remove_many_inner(Ctrie::with_hasher(NoHasher), TEST_BATCH_SMALL);
    }

    #[test]
    fn remove_many_bad_hasher() {
        remove_many_inner(Ctrie::with_hasher(MakeSplatHasher), TEST_BATCH_SMALL);
    }

    #[test]
    fn collision_remove_one_left() {
        let mut map = Ctrie::with_hasher(NoHasher);
        map.insert(1, 1);
        map.insert(2, 2);

        map.raw.assert_invariants();

        assert!(map.remove(&2).is_some());
        assert_eq!(1, *map.get(&1).unwrap().value());
        map.raw.assert_invariants();

        assert!(map.remove(&1).is_some());
        map.raw.assert_invariants();
        assert!(map.is_empty());
    }

    #[test]
    fn remove_par() {
        let map = Ctrie::new();
        for i in 0..TEST_THREADS * TEST_BATCH {
            map.insert(i, i);
        }

        thread::scope(|s| {
            for t in 0..TEST_THREADS {
                let map = &map;
                s.spawn(move |_| {
                    for i in 0..TEST_BATCH {
                        let num = t * TEST_BATCH + i;
                        let entry = map.remove(&num).unwrap();
                        assert_eq!(num, *entry.value());
                        assert_eq!(num, *entry.key());
                    }
                });
            }
        })
        .unwrap();

        assert!(map.is_empty());
    }

    #[test]
    fn unsized_values() {
        let map: Ctrie<usize, [usize]> = Ctrie::new();
        assert!(map
            .insert_entry(Arc::new(Entry::new(42, [1, 2, 3])))
            .is_none());
        let found = map.get(&42).unwrap();
        assert_eq!(&[1, 2, 3], found.value());
        let removed = map.remove(&42).unwrap();
        assert_eq!(found, removed);
        assert!(map.is_empty());
    }

    fn iter_test_inner<S: BuildHasher + Clone + 'static>(map: Ctrie<usize, usize, S>) {
        for i in 0..TEST_BATCH_SMALL {
            assert!(map.insert(i, i).is_none());
        }

        let mut extracted = map.iter().map(|e| *e.value()).collect::<Vec<_>>();
        extracted.sort();
        let expected = (0..TEST_BATCH_SMALL).collect::<Vec<_>>();
        assert_eq!(expected, extracted);
    }

    #[test]
    fn iter() {
        let map = Ctrie::new();
        iter_test_inner(map);
    }

    #[test]
    fn iter_collision() {
        let map = Ctrie::with_hasher(NoHasher);
        iter_test_inner(map);
    }

    #[test]
    fn iter_bad_hasher() {
        let map = Ctrie::with_hasher(MakeSplatHasher);
        iter_test_inner(map);
    }

    #[test]
    fn collect() {
        let map = (0..TEST_BATCH_SMALL)
            .map(|i| (i, i))
            .collect::<Ctrie<_, _>>();

        let mut extracted = map
            .iter()
            .map(|e| {
                assert_eq!(e.key(), e.value());
                *e.value()
            })
            .collect::<Vec<_>>();

        extracted.sort();
        let expected = (0..TEST_BATCH_SMALL).collect::<Vec<_>>();
        assert_eq!(expected, extracted);
    }

    #[test]
    fn par_extend() {
        let map = Ctrie::new();
        thread::scope(|s| {
            for t in 0..TEST_THREADS {
                let mut map = &map;
                s.spawn(move |_| {
                    let start = t * TEST_BATCH_SMALL;
                    let iter = (start..start + TEST_BATCH_SMALL).map(|i| (i, i));
                    map.extend(iter);
                });
            }
        })
        .unwrap();

        let mut extracted = map
            .iter()
            .map(|e| {
                assert_eq!(e.key(), e.value());
                *e.value()
            })
            .collect::<Vec<_>>();

        extracted.sort();
        let expected = (0..TEST_THREADS * TEST_BATCH_SMALL).collect::<Vec<_>>();
        assert_eq!(expected, extracted);
    }

    #[test]
    fn snapshot_isolation() {
        let map = Ctrie::new();
        for i in 0..TEST_BATCH_SMALL {
            map.insert(i, i);
        }

        let frozen = map.snapshot_read_only();
        for i in 0..TEST_BATCH_SMALL / 2 {
            map.remove(&i);
        }
        map.insert(TEST_BATCH_SMALL + 1, 0);

        // The frozen view still has exactly the original content.
        assert_eq!(TEST_BATCH_SMALL, frozen.count());
        for i in 0..TEST_BATCH_SMALL {
            assert_eq!(i, *frozen.get(&i).unwrap().value());
        }
        assert!(frozen.get(&(TEST_BATCH_SMALL + 1)).is_none());

        // While the map has moved on.
        assert!(map.get(&0).is_none());
        assert_eq!(TEST_BATCH_SMALL / 2 + 1, map.len());
    }

    #[test]
    fn snapshot_fork_writes_stay_local() {
        let map = Ctrie::new();
        map.insert("shared", 0);

        let fork = map.snapshot();
        fork.insert("fork-only", 1);
        map.insert("map-only", 2);

        assert!(map.get("fork-only").is_none());
        assert!(fork.get("map-only").is_none());
        assert_eq!(0, *fork.get("shared").unwrap().value());
        assert_eq!(2, map.len());
        assert_eq!(2, fork.len());
    }

    #[test]
    fn snapshot_concurrent_removal() {
        let map = Ctrie::new();
        for i in 0..TEST_BATCH {
            map.insert(i, i);
        }
        let frozen = map.snapshot_read_only();

        thread::scope(|s| {
            for t in 0..TEST_THREADS {
                let map = &map;
                s.spawn(move |_| {
                    for i in 0..TEST_BATCH / TEST_THREADS {
                        let num = t * (TEST_BATCH / TEST_THREADS) + i;
                        if num % 2 == 0 {
                            map.remove(&num);
                        }
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(TEST_BATCH, frozen.count());
        assert_eq!(TEST_BATCH / 2, map.len());
    }

    #[test]
    fn clone_is_a_fork() {
        let map = Ctrie::new();
        map.insert(1, 1);
        let copy = map.clone();
        copy.insert(2, 2);
        assert!(map.get(&2).is_none());
        assert_eq!(1, *copy.get(&1).unwrap().value());
    }

    #[test]
    fn clear() {
        let map = Ctrie::new();
        for i in 0..TEST_BATCH_SMALL {
            map.insert(i, i);
        }
        map.clear();
        assert!(map.is_empty());
        assert!(map.get(&0).is_none());
        map.insert(1, 1);
        assert_eq!(1, map.len());
    }

    #[test]
    fn snapshot_iter_borrowed() {
        let map = Ctrie::new();
        for i in 0..TEST_BATCH_SMALL {
            map.insert(i, i);
        }
        let frozen = map.snapshot_read_only();
        let mut seen = (&frozen).into_iter().map(|e| *e.key()).collect::<Vec<_>>();
        seen.sort();
        let expected = (0..TEST_BATCH_SMALL).collect::<Vec<_>>();
        assert_eq!(expected, seen);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn rayon_extend() {
        let mut map = Ctrie::new();
        map.par_extend((0..TEST_BATCH_SMALL).into_par_iter().map(|i| (i, i)));

        let mut extracted = map
            .iter()
            .map(|e| {
                assert_eq!(e.key(), e.value());
                *e.value()
            })
            .collect::<Vec<_>>();
        extracted.sort();

        let expected = (0..TEST_BATCH_SMALL).collect::<Vec<_>>();
        assert_eq!(expected, extracted);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn rayon_from_par_iter() {
        let map = Ctrie::from_par_iter((0..TEST_BATCH_SMALL).into_par_iter().map(|i| (i, i)));
        let mut extracted = map
            .iter()
            .map(|e| {
                assert_eq!(e.key(), e.value());
                *e.value()
            })
            .collect::<Vec<_>>();
        extracted.sort();

        let expected = (0..TEST_BATCH_SMALL).collect::<Vec<_>>();
        assert_eq!(expected, extracted);
    }
}
