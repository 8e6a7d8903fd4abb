use core::borrow::Borrow;
use core::fmt::Debug;
use core::hash::BuildHasher;
use core::hash::Hash;
use core::mem;

use crate::hash_table::Drain as TableDrain;
use crate::hash_table::Entry as TableEntry;
use crate::hash_table::HashTable;
use crate::hash_table::Iter as TableIter;
use crate::hash_table::IterMut as TableIterMut;
use crate::hash_table::OccupiedEntry as TableOccupiedEntry;
use crate::hash_table::VacantEntry as TableVacantEntry;

/// A hash map backed by the raw SwissTable core.
///
/// `HashMap<K, V, S>` stores key-value pairs where keys implement `Hash +
/// Eq` and uses a configurable hasher builder `S` to hash keys. Lookups
/// scan 16 control tags per probe step, erases are tombstone-aware, and
/// small enough pairs live inline until the map holds more than one.
///
/// Iteration order is seeded per map: two maps with the same contents
/// iterate differently, and the order changes on rehash. Do not depend on
/// it.
///
/// # Examples
///
/// ```rust
/// use std::hash::RandomState;
///
/// use swiss_table::HashMap;
///
/// let mut map: HashMap<&str, i32, RandomState> = HashMap::new();
/// map.insert("a", 1);
/// map.insert("b", 2);
/// assert_eq!(map.get("a"), Some(&1));
/// assert_eq!(map.remove("b"), Some(2));
/// ```
#[derive(Clone)]
pub struct HashMap<K, V, S> {
    table: HashTable<(K, V)>,
    hash_builder: S,
}

impl<K, V, S> Debug for HashMap<K, V, S>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.iter() {
            map.entry(k, v);
        }
        map.finish()
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    S: Default,
{
    /// Creates a new, empty hash map with a default hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let map: HashMap<i32, String, RandomState> = HashMap::new();
    /// assert!(map.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::with_hasher(S::default())
    }

    /// Creates a new hash map that can hold at least `capacity` entries
    /// without resizing, with a default hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let map: HashMap<i32, String, RandomState> = HashMap::with_capacity(100);
    /// assert!(map.capacity() >= 100);
    /// assert!(map.is_empty());
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, S::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates a new, empty hash map with the given hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let map: HashMap<i32, i32, _> = HashMap::with_hasher(RandomState::new());
    /// assert!(map.is_empty());
    /// ```
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            table: HashTable::new(),
            hash_builder,
        }
    }

    /// Creates a new hash map that can hold at least `capacity` entries
    /// without resizing, with the given hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let map: HashMap<i32, i32, _> =
    ///     HashMap::with_capacity_and_hasher(100, RandomState::new());
    /// assert!(map.capacity() >= 100);
    /// ```
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self {
            table: HashTable::with_capacity(capacity),
            hash_builder,
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, &str, RandomState> = HashMap::new();
    /// assert_eq!(map.len(), 0);
    /// map.insert(1, "a");
    /// assert_eq!(map.len(), 1);
    /// ```
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the map contains no entries.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, &str, RandomState> = HashMap::new();
    /// assert!(map.is_empty());
    /// map.insert(1, "a");
    /// assert!(!map.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns the number of entries the map can hold before it must
    /// resize.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let map: HashMap<i32, i32, RandomState> = HashMap::with_capacity(100);
    /// assert!(map.capacity() >= 100);
    /// ```
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Returns the number of slots in the map's backing storage.
    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    /// Returns a reference to the map's hasher builder.
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Removes all entries from the map, keeping the allocated capacity.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, &str, RandomState> = HashMap::new();
    /// map.insert(1, "a");
    /// map.clear();
    /// assert!(map.is_empty());
    /// assert!(!map.contains_key(&1));
    /// ```
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Returns an iterator over the map's key-value pairs.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, i32, RandomState> = HashMap::new();
    /// map.insert(1, 10);
    /// map.insert(2, 20);
    /// let total: i32 = map.iter().map(|(k, v)| k + v).sum();
    /// assert_eq!(total, 33);
    /// ```
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            inner: self.table.iter(),
        }
    }

    /// Returns an iterator over the map's pairs with mutable values.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        IterMut {
            inner: self.table.iter_mut(),
        }
    }

    /// Returns an iterator over the map's keys.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, &str, RandomState> = HashMap::new();
    /// map.insert(1, "a");
    /// map.insert(2, "b");
    /// let mut keys: Vec<i32> = map.keys().copied().collect();
    /// keys.sort_unstable();
    /// assert_eq!(keys, [1, 2]);
    /// ```
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys { inner: self.iter() }
    }

    /// Returns an iterator over the map's values.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, i32, RandomState> = HashMap::new();
    /// map.insert(1, 10);
    /// map.insert(2, 20);
    /// let total: i32 = map.values().sum();
    /// assert_eq!(total, 30);
    /// ```
    pub fn values(&self) -> Values<'_, K, V> {
        Values { inner: self.iter() }
    }

    /// Returns an iterator over mutable references to the map's values.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, i32, RandomState> = HashMap::new();
    /// map.insert(1, 10);
    /// map.insert(2, 20);
    /// for value in map.values_mut() {
    ///     *value += 1;
    /// }
    /// assert_eq!(map.get(&1), Some(&11));
    /// assert_eq!(map.get(&2), Some(&21));
    /// ```
    pub fn values_mut(&mut self) -> ValuesMut<'_, K, V> {
        ValuesMut {
            inner: self.iter_mut(),
        }
    }

    /// Returns an iterator that removes and yields every key-value pair.
    ///
    /// Dropping the iterator drops the unyielded pairs.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, &str, RandomState> = HashMap::new();
    /// map.insert(1, "a");
    /// map.insert(2, "b");
    /// let drained: Vec<(i32, &str)> = map.drain().collect();
    /// assert_eq!(drained.len(), 2);
    /// assert!(map.is_empty());
    /// ```
    pub fn drain(&mut self) -> Drain<'_, K, V> {
        Drain {
            inner: self.table.drain(),
        }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Inserts a key-value pair, returning the previous value for the key
    /// if there was one.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<&str, i32, RandomState> = HashMap::new();
    /// assert_eq!(map.insert("a", 1), None);
    /// assert_eq!(map.insert("a", 2), Some(1));
    /// assert_eq!(map.get("a"), Some(&2));
    /// ```
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let hash = self.hash_builder.hash_one(&key);
        let hash_builder = &self.hash_builder;
        match self.table.entry(
            hash,
            |entry| entry.0 == key,
            |entry| hash_builder.hash_one(&entry.0),
        ) {
            TableEntry::Occupied(mut entry) => Some(mem::replace(&mut entry.get_mut().1, value)),
            TableEntry::Vacant(entry) => {
                entry.insert((key, value));
                None
            }
        }
    }

    /// Inserts a key-value pair only if the key is absent.
    ///
    /// On success returns a mutable reference to the inserted value; on a
    /// duplicate key the pair is handed back unconsumed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<&str, i32, RandomState> = HashMap::new();
    /// assert!(map.try_insert("a", 1).is_ok());
    /// assert_eq!(map.try_insert("a", 2), Err(("a", 2)));
    /// assert_eq!(map.get("a"), Some(&1));
    /// ```
    pub fn try_insert(&mut self, key: K, value: V) -> Result<&mut V, (K, V)> {
        let hash = self.hash_builder.hash_one(&key);
        let hash_builder = &self.hash_builder;
        match self.table.entry(
            hash,
            |entry| entry.0 == key,
            |entry| hash_builder.hash_one(&entry.0),
        ) {
            TableEntry::Occupied(_) => Err((key, value)),
            TableEntry::Vacant(entry) => Ok(&mut entry.insert((key, value)).1),
        }
    }

    /// Returns a reference to the value for `key`, if present.
    ///
    /// The key may be any borrowed form of the map's key type; `Hash` and
    /// `Eq` on the borrowed form must agree with the key type.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<String, i32, RandomState> = HashMap::new();
    /// map.insert("alpha".to_string(), 1);
    /// assert_eq!(map.get("alpha"), Some(&1));
    /// assert_eq!(map.get("beta"), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_key_value(key).map(|(_, v)| v)
    }

    /// Returns the stored key and value for `key`, if present.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, &str, RandomState> = HashMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.get_key_value(&1), Some((&1, &"a")));
    /// assert_eq!(map.get_key_value(&2), None);
    /// ```
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_builder.hash_one(key);
        self.table
            .find(hash, |entry| entry.0.borrow() == key)
            .map(|entry| (&entry.0, &entry.1))
    }

    /// Returns a mutable reference to the value for `key`, if present.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, String, RandomState> = HashMap::new();
    /// map.insert(1, "hello".to_string());
    /// if let Some(value) = map.get_mut(&1) {
    ///     value.push_str(" world");
    /// }
    /// assert_eq!(map.get(&1), Some(&"hello world".to_string()));
    /// ```
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_builder.hash_one(key);
        self.table
            .find_mut(hash, |entry| entry.0.borrow() == key)
            .map(|entry| &mut entry.1)
    }

    /// Returns `true` if the map contains `key`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, &str, RandomState> = HashMap::new();
    /// map.insert(1, "a");
    /// assert!(map.contains_key(&1));
    /// assert!(!map.contains_key(&2));
    /// ```
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Removes `key` from the map, returning its value if it was present.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, &str, RandomState> = HashMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.remove(&1), Some("a"));
    /// assert_eq!(map.remove(&1), None);
    /// ```
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove_entry(key).map(|(_, v)| v)
    }

    /// Removes `key` from the map, returning the stored key and value if
    /// present.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, &str, RandomState> = HashMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.remove_entry(&1), Some((1, "a")));
    /// assert!(map.is_empty());
    /// ```
    pub fn remove_entry<Q>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_builder.hash_one(key);
        self.table.remove(hash, |entry| entry.0.borrow() == key)
    }

    /// Gets the entry for `key` for in-place manipulation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<&str, i32, RandomState> = HashMap::new();
    /// *map.entry("counter").or_insert(0) += 1;
    /// *map.entry("counter").or_insert(0) += 1;
    /// assert_eq!(map.get("counter"), Some(&2));
    /// ```
    pub fn entry(&mut self, key: K) -> Entry<'_, K, V> {
        let hash = self.hash_builder.hash_one(&key);
        let hash_builder = &self.hash_builder;
        match self.table.entry(
            hash,
            |entry| entry.0 == key,
            |entry| hash_builder.hash_one(&entry.0),
        ) {
            TableEntry::Occupied(entry) => Entry::Occupied(OccupiedEntry { entry, key }),
            TableEntry::Vacant(entry) => Entry::Vacant(VacantEntry { entry, key }),
        }
    }

    /// Retains only the entries for which the predicate returns `true`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, i32, RandomState> = (0..8).map(|i| (i, i)).collect();
    /// map.retain(|k, _| k % 2 == 0);
    /// assert_eq!(map.len(), 4);
    /// assert!(map.contains_key(&6));
    /// assert!(!map.contains_key(&3));
    /// ```
    pub fn retain(&mut self, mut f: impl FnMut(&K, &mut V) -> bool) {
        self.table.retain(|entry| f(&entry.0, &mut entry.1));
    }

    /// Reserves capacity for at least `additional` more entries.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, i32, RandomState> = HashMap::new();
    /// map.reserve(100);
    /// assert!(map.capacity() >= 100);
    /// ```
    pub fn reserve(&mut self, additional: usize) {
        let hash_builder = &self.hash_builder;
        self.table
            .reserve(additional, |entry| hash_builder.hash_one(&entry.0));
    }

    /// Shrinks the map's storage as much as possible, releasing it
    /// entirely if the map is empty.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, i32, RandomState> = HashMap::with_capacity(1000);
    /// map.insert(1, 1);
    /// map.shrink_to_fit();
    /// assert!(map.capacity() < 1000);
    /// assert_eq!(map.get(&1), Some(&1));
    /// ```
    pub fn shrink_to_fit(&mut self) {
        let hash_builder = &self.hash_builder;
        self.table
            .shrink_to_fit(|entry| hash_builder.hash_one(&entry.0));
    }

    /// Rebuilds the map for at least `min_size` entries. `rehash(0)`
    /// shrinks to fit and refreshes the iteration order even when the
    /// capacity is unchanged.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<i32, i32, RandomState> = HashMap::new();
    /// map.insert(1, 1);
    /// map.rehash(100);
    /// assert!(map.capacity() >= 100);
    /// assert_eq!(map.get(&1), Some(&1));
    /// ```
    pub fn rehash(&mut self, min_size: usize) {
        let hash_builder = &self.hash_builder;
        self.table
            .rehash(min_size, |entry| hash_builder.hash_one(&entry.0));
    }

    /// Moves every entry of `other` whose key is absent from `self` into
    /// `self`. Entries with duplicate keys stay in `other`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut a: HashMap<&str, i32, RandomState> = HashMap::new();
    /// let mut b: HashMap<&str, i32, RandomState> = HashMap::new();
    /// a.insert("x", 1);
    /// b.insert("x", 10);
    /// b.insert("y", 2);
    /// a.merge(&mut b);
    /// assert_eq!(a.get("x"), Some(&1));
    /// assert_eq!(a.get("y"), Some(&2));
    /// assert_eq!(b.get("x"), Some(&10));
    /// assert_eq!(b.len(), 1);
    /// ```
    pub fn merge<S2>(&mut self, other: &mut HashMap<K, V, S2>)
    where
        S2: BuildHasher,
    {
        let hash_builder = &self.hash_builder;
        self.table.merge_from(
            &mut other.table,
            |entry| hash_builder.hash_one(&entry.0),
            |a, b| a.0 == b.0,
        );
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> Extend<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        let iter = iter.into_iter();
        self.reserve(iter.size_hint().0);
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::with_hasher(S::default());
        map.extend(iter);
        map
    }
}

impl<'a, K, V, S> IntoIterator for &'a HashMap<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

impl<'a, K, V, S> IntoIterator for &'a mut HashMap<K, V, S> {
    type Item = (&'a K, &'a mut V);
    type IntoIter = IterMut<'a, K, V>;

    fn into_iter(self) -> IterMut<'a, K, V> {
        self.iter_mut()
    }
}

/// A view into a single map entry, occupied or vacant.
pub enum Entry<'a, K, V> {
    /// The key is present.
    Occupied(OccupiedEntry<'a, K, V>),
    /// The key is absent.
    Vacant(VacantEntry<'a, K, V>),
}

impl<'a, K, V> Entry<'a, K, V> {
    /// Returns a mutable reference to the value, inserting `default` if
    /// the key is absent.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<&str, i32, RandomState> = HashMap::new();
    /// map.entry("poneyland").or_insert(3);
    /// assert_eq!(map.get("poneyland"), Some(&3));
    /// ```
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Returns a mutable reference to the value, inserting the result of
    /// `default()` if the key is absent.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<&str, String, RandomState> = HashMap::new();
    /// map.entry("key").or_insert_with(|| "value".to_string());
    /// assert_eq!(map.get("key"), Some(&"value".to_string()));
    /// ```
    pub fn or_insert_with<F>(self, default: F) -> &'a mut V
    where
        F: FnOnce() -> V,
    {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Applies `f` to the value if the key is present, then returns the
    /// entry for further chaining.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::hash::RandomState;
    ///
    /// use swiss_table::HashMap;
    ///
    /// let mut map: HashMap<&str, i32, RandomState> = HashMap::new();
    /// map.entry("counter").and_modify(|v| *v += 1).or_insert(0);
    /// assert_eq!(map.get("counter"), Some(&0));
    /// map.entry("counter").and_modify(|v| *v += 1).or_insert(0);
    /// assert_eq!(map.get("counter"), Some(&1));
    /// ```
    pub fn and_modify<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut V),
    {
        if let Entry::Occupied(entry) = &mut self {
            f(entry.get_mut());
        }
        self
    }

    /// The key that was used to look up the entry.
    pub fn key(&self) -> &K {
        match self {
            Entry::Occupied(entry) => entry.key(),
            Entry::Vacant(entry) => entry.key(),
        }
    }

    /// Returns a mutable reference to the value, inserting `V::default()`
    /// if the key is absent.
    pub fn or_default(self) -> &'a mut V
    where
        V: Default,
    {
        self.or_insert_with(V::default)
    }
}

/// A vacant map entry.
pub struct VacantEntry<'a, K, V> {
    entry: TableVacantEntry<'a, (K, V)>,
    key: K,
}

impl<'a, K, V> VacantEntry<'a, K, V> {
    /// The key that would be inserted.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Takes the key back out of the entry.
    pub fn into_key(self) -> K {
        self.key
    }

    /// Inserts the key with `value` and returns a mutable reference to
    /// the value.
    pub fn insert(self, value: V) -> &'a mut V {
        &mut self.entry.insert((self.key, value)).1
    }
}

/// An occupied map entry.
pub struct OccupiedEntry<'a, K, V> {
    entry: TableOccupiedEntry<'a, (K, V)>,
    key: K,
}

impl<'a, K, V> OccupiedEntry<'a, K, V> {
    /// The key that was used to look up the entry.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns a reference to the value.
    pub fn get(&self) -> &V {
        &self.entry.get().1
    }

    /// Returns a mutable reference to the value.
    pub fn get_mut(&mut self) -> &mut V {
        &mut self.entry.get_mut().1
    }

    /// Converts the entry into a mutable reference tied to the map.
    pub fn into_mut(self) -> &'a mut V {
        &mut self.entry.into_mut().1
    }

    /// Replaces the value, returning the old one.
    pub fn insert(&mut self, value: V) -> V {
        mem::replace(self.get_mut(), value)
    }

    /// Removes the entry, returning the value.
    pub fn remove(self) -> V {
        self.entry.remove().1
    }

    /// Removes the entry, returning the stored key and value.
    pub fn remove_entry(self) -> (K, V) {
        self.entry.remove()
    }
}

/// An iterator over a map's key-value pairs.
pub struct Iter<'a, K, V> {
    inner: TableIter<'a, (K, V)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|entry| (&entry.0, &entry.1))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// An iterator over a map's pairs with mutable values.
pub struct IterMut<'a, K, V> {
    inner: TableIterMut<'a, (K, V)>,
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some((&entry.0, &mut entry.1))
    }
}

/// An iterator over a map's keys.
pub struct Keys<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K, V> Iterator for Keys<'a, K, V> {
    type Item = &'a K;

    fn next(&mut self) -> Option<&'a K> {
        self.inner.next().map(|(k, _)| k)
    }
}

/// An iterator over a map's values.
pub struct Values<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K, V> Iterator for Values<'a, K, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<&'a V> {
        self.inner.next().map(|(_, v)| v)
    }
}

/// An iterator over mutable references to a map's values.
pub struct ValuesMut<'a, K, V> {
    inner: IterMut<'a, K, V>,
}

impl<'a, K, V> Iterator for ValuesMut<'a, K, V> {
    type Item = &'a mut V;

    fn next(&mut self) -> Option<&'a mut V> {
        self.inner.next().map(|(_, v)| v)
    }
}

/// A draining iterator over a map's key-value pairs.
pub struct Drain<'a, K, V> {
    inner: TableDrain<'a, (K, V)>,
}

impl<K, V> Iterator for Drain<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        self.inner.next()
    }
}
