use std::mem;

use crate::common::value::{Handle, Value};

/// One slot of the table.
/// A tombstone is left behind by deletion so that probe chains stay
/// intact; tombstones count toward the load factor and are reclaimed
/// on insert and dropped on resize.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Entry {
    Empty,
    Tombstone,
    Full { key: Handle, hash: u32, value: Value },
}

/// An open-addressed hash table with linear probing,
/// keyed by interned strings.
/// Because interning makes strings canonical, keys compare by handle
/// identity; the string's hash rides along in the entry so probing
/// never has to chase the handle back to the heap.
///
/// The same table backs the global environment, per-class method
/// tables, per-instance fields, and the weak intern set itself.
#[derive(Debug, Clone)]
pub struct Table {
    /// Full entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

/// `count + 1 > capacity * 3/4`, in integers.
fn over_loaded(count: usize, capacity: usize) -> bool {
    (count + 1) * 4 > capacity * 3
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: vec![],
        }
    }

    /// The slot `key` lives in, or the slot an insert of `key` should
    /// use: the first tombstone on the probe chain if there was one,
    /// otherwise the empty slot that terminated the probe.
    fn find_slot(&self, key: Handle, hash: u32) -> usize {
        // capacity is always a power of two
        let mut index = hash as usize & (self.entries.len() - 1);
        let mut tombstone = None;

        loop {
            match self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                },
                Entry::Full { key: found, .. } => {
                    if found == key {
                        return index;
                    }
                },
            }

            index = (index + 1) & (self.entries.len() - 1);
        }
    }

    pub fn get(&self, key: Handle, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        match self.entries[self.find_slot(key, hash)] {
            Entry::Full { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Inserts or updates a binding.
    /// Returns `true` when `key` was not present before.
    pub fn set(&mut self, key: Handle, hash: u32, value: Value) -> bool {
        if over_loaded(self.count, self.entries.len()) {
            let capacity = if self.entries.len() < 8 {
                8
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(capacity);
        }

        let slot = self.find_slot(key, hash);
        let is_new = !matches!(self.entries[slot], Entry::Full { .. });

        // a reused tombstone was already counted toward the load
        if matches!(self.entries[slot], Entry::Empty) {
            self.count += 1;
        }

        self.entries[slot] = Entry::Full { key, hash, value };
        is_new
    }

    /// Removes a binding, leaving a tombstone.
    /// Returns `true` when `key` was present.
    pub fn delete(&mut self, key: Handle, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }

        let slot = self.find_slot(key, hash);
        match self.entries[slot] {
            Entry::Full { .. } => {
                self.entries[slot] = Entry::Tombstone;
                true
            },
            _ => false,
        }
    }

    /// Copies every binding of `other` into `self`.
    /// Existing keys are overwritten; this is what method inheritance
    /// uses to seed a subclass from its superclass.
    pub fn extend_from(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Entry::Full { key, hash, value } = entry {
                self.set(*key, *hash, *value);
            }
        }
    }

    /// Rebuilds the table at `capacity`, dropping tombstones and
    /// recomputing the count.
    fn adjust_capacity(&mut self, capacity: usize) {
        let old = mem::replace(&mut self.entries, vec![Entry::Empty; capacity]);
        self.count = 0;

        for entry in old {
            if let Entry::Full { key, hash, value } = entry {
                let slot = self.find_slot(key, hash);
                self.entries[slot] = entry;
                self.count += 1;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Full { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Appends every live key and value, for the mark phase.
    pub fn collect_refs(&self, refs: &mut Vec<Value>) {
        for (key, value) in self.iter() {
            refs.push(Value::Obj(key));
            refs.push(value);
        }
    }

    /// The buffer footprint of this table, for allocation accounting.
    pub fn byte_size(&self) -> usize {
        self.entries.capacity() * mem::size_of::<Entry>()
    }

    /// Looks up an entry by string content rather than by handle.
    /// Probes by `hash`; `eq` settles hash collisions by comparing the
    /// candidate key's bytes. Used exclusively by the interner, which is
    /// the one caller that doesn't yet hold a canonical handle.
    pub fn find_string(&self, hash: u32, mut eq: impl FnMut(Handle) -> bool) -> Option<Handle> {
        if self.count == 0 {
            return None;
        }

        let mut index = hash as usize & (self.entries.len() - 1);
        loop {
            match self.entries[index] {
                Entry::Empty => return None,
                Entry::Tombstone => (),
                Entry::Full { key, hash: found, .. } => {
                    if found == hash && eq(key) {
                        return Some(key);
                    }
                },
            }

            index = (index + 1) & (self.entries.len() - 1);
        }
    }

    /// Deletes every entry whose key fails `live`.
    /// This is the weak half of the intern table: entries for strings
    /// the mark phase didn't reach are dropped just before the sweep
    /// would free the strings themselves.
    pub fn retain_keys(&mut self, mut live: impl FnMut(Handle) -> bool) {
        for entry in self.entries.iter_mut() {
            if let Entry::Full { key, .. } = entry {
                if !live(*key) {
                    *entry = Entry::Tombstone;
                }
            }
        }
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use std::collections::HashMap;

    use super::*;

    fn key(index: u32) -> Handle {
        Handle(index)
    }

    #[test]
    fn set_get_delete() {
        let mut table = Table::new();
        assert_eq!(table.get(key(1), 10), None);

        assert!(table.set(key(1), 10, Value::Number(1.0)));
        assert!(!table.set(key(1), 10, Value::Number(2.0)));
        assert_eq!(table.get(key(1), 10), Some(Value::Number(2.0)));

        assert!(table.delete(key(1), 10));
        assert!(!table.delete(key(1), 10));
        assert_eq!(table.get(key(1), 10), None);
    }

    #[test]
    fn colliding_keys_coexist() {
        // same hash, different identities: linear probing must keep both
        let mut table = Table::new();
        table.set(key(1), 7, Value::Number(1.0));
        table.set(key(2), 7, Value::Number(2.0));
        assert_eq!(table.get(key(1), 7), Some(Value::Number(1.0)));
        assert_eq!(table.get(key(2), 7), Some(Value::Number(2.0)));
    }

    #[test]
    fn tombstones_keep_chains_reachable() {
        let mut table = Table::new();
        table.set(key(1), 7, Value::Number(1.0));
        table.set(key(2), 7, Value::Number(2.0));
        table.delete(key(1), 7);
        // key(2) sits past the tombstone on the same chain
        assert_eq!(table.get(key(2), 7), Some(Value::Number(2.0)));
        // and the tombstone slot is reused on insert
        table.set(key(3), 7, Value::Number(3.0));
        assert_eq!(table.get(key(3), 7), Some(Value::Number(3.0)));
    }

    #[test]
    fn extend_from_overwrites() {
        let mut base = Table::new();
        base.set(key(1), 1, Value::Number(1.0));

        let mut sub = Table::new();
        sub.set(key(2), 2, Value::Number(2.0));
        sub.extend_from(&base);

        assert_eq!(sub.get(key(1), 1), Some(Value::Number(1.0)));
        assert_eq!(sub.get(key(2), 2), Some(Value::Number(2.0)));
    }

    #[test]
    fn retain_keys_tombstones_dead_entries() {
        let mut table = Table::new();
        table.set(key(1), 1, Value::Bool(true));
        table.set(key(2), 2, Value::Bool(true));
        table.retain_keys(|k| k == key(2));
        assert_eq!(table.get(key(1), 1), None);
        assert_eq!(table.get(key(2), 2), Some(Value::Bool(true)));
    }

    proptest! {
        /// Random churn against a `HashMap` model, with hashes drawn
        /// from a tiny range to force heavy collisions, resizes, and
        /// tombstone reuse.
        #[test]
        fn behaves_like_a_map(ops in prop::collection::vec(
            (0u32..32, prop::num::f64::NORMAL, prop::bool::ANY),
            1..200,
        )) {
            let mut table = Table::new();
            let mut model: HashMap<u32, Value> = HashMap::new();

            for (index, number, insert) in ops {
                let hash = index % 4;
                if insert {
                    let value = Value::Number(number);
                    table.set(key(index), hash, value);
                    model.insert(index, value);
                } else {
                    table.delete(key(index), hash);
                    model.remove(&index);
                }

                prop_assert_eq!(table.get(key(index), hash), model.get(&index).copied());
            }

            for (index, value) in &model {
                prop_assert_eq!(table.get(key(*index), *index % 4), Some(*value));
            }
        }
    }
}
