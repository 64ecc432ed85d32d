// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A hash map which keeps a reference count for each entry.

use std::collections::hash_map::{Entry, HashMap};

use core::hash::Hash;
use core::num::NonZeroUsize;

use nonzero_ext::nonzero;

/// The result of inserting an element into a [`RefCountedHashMap`].
#[cfg_attr(test, derive(Debug, Eq, PartialEq))]
pub(crate) enum InsertResult<O> {
    /// The key was not previously in the map, so it was inserted.
    Inserted(O),
    /// The key was already in the map; its reference count was incremented.
    AlreadyPresent,
}

/// The result of removing an entry from a [`RefCountedHashMap`].
#[cfg_attr(test, derive(Debug, Eq, PartialEq))]
pub(crate) enum RemoveResult<V> {
    /// The reference count reached 0, so the entry was removed.
    Removed(V),
    /// The reference count did not reach 0, so the entry remains in the map.
    StillPresent,
    /// The key was not in the map.
    NotPresent,
}

/// A [`HashMap`] which keeps a reference count for each entry.
///
/// An entry's value is created on the first insertion of its key and dropped
/// when as many removals as insertions have been observed.
#[cfg_attr(test, derive(Debug))]
pub(crate) struct RefCountedHashMap<K, V> {
    inner: HashMap<K, (NonZeroUsize, V)>,
}

impl<K, V> Default for RefCountedHashMap<K, V> {
    fn default() -> RefCountedHashMap<K, V> {
        RefCountedHashMap { inner: HashMap::default() }
    }
}

impl<K: Eq + Hash, V> RefCountedHashMap<K, V> {
    /// Increments the reference count of the entry with the given key.
    ///
    /// If the key isn't in the map, the given function is called to create
    /// its associated value.
    pub(crate) fn insert_with<O, F: FnOnce() -> (V, O)>(
        &mut self,
        key: K,
        f: F,
    ) -> InsertResult<O> {
        match self.inner.entry(key) {
            Entry::Occupied(mut entry) => {
                let (refcnt, _): &mut (NonZeroUsize, V) = entry.get_mut();
                *refcnt = refcnt.checked_add(1).unwrap();
                InsertResult::AlreadyPresent
            }
            Entry::Vacant(entry) => {
                let (value, output) = f();
                let _: &mut (NonZeroUsize, V) = entry.insert((nonzero!(1usize), value));
                InsertResult::Inserted(output)
            }
        }
    }

    /// Decrements the reference count of the entry with the given key.
    ///
    /// If the reference count reaches 0, the entry is removed and its value
    /// returned.
    pub(crate) fn remove(&mut self, key: K) -> RemoveResult<V> {
        match self.inner.entry(key) {
            Entry::Vacant(_) => RemoveResult::NotPresent,
            Entry::Occupied(mut entry) => {
                let (refcnt, _): &mut (NonZeroUsize, V) = entry.get_mut();
                match NonZeroUsize::new(refcnt.get() - 1) {
                    None => {
                        let (_, value): (NonZeroUsize, V) = entry.remove();
                        RemoveResult::Removed(value)
                    }
                    Some(new_refcnt) => {
                        *refcnt = new_refcnt;
                        RemoveResult::StillPresent
                    }
                }
            }
        }
    }

    /// Returns `true` if the map contains a value for the specified key.
    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns a mutable reference to the value corresponding to the key.
    pub(crate) fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key).map(|(_, value)| value)
    }

    /// An iterator visiting all key-value pairs in arbitrary order, with
    /// immutable references to the values.
    pub(crate) fn iter<'a>(&'a self) -> impl 'a + Iterator<Item = (&'a K, &'a V)> {
        self.inner.iter().map(|(key, (_, value))| (key, value))
    }

    /// An iterator visiting all key-value pairs in arbitrary order, with
    /// mutable references to the values.
    pub(crate) fn iter_mut<'a>(&'a mut self) -> impl 'a + Iterator<Item = (&'a K, &'a mut V)> {
        self.inner.iter_mut().map(|(key, (_, value))| (key, value))
    }
}
