//! Open-addressed hash table, keyed on interned strings.
//!
//! Linear probing, load factor 0.75, tombstones so deletion during
//! iteration stays safe. The globals table and the string intern set are
//! the *same* structure — a generic `string -> value` map — so `Table`
//! is written once here and used for both: the VM globals table stores
//! real `Value`s; the interner stores a dummy `Value::Bool(true)` and
//! only cares about `find_string`'s probe-by-bytes lookup.

use crate::heap::{Heap, Obj, ObjRef, ObjString, hash_bytes};
use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;

#[derive(Clone)]
enum Entry {
    Empty,
    Tombstone,
    Occupied { key: ObjRef, value: Value },
}

pub struct Table {
    entries: Vec<Entry>,
    /// Occupied + tombstone count, matching clox's `count` field — this is
    /// what load factor is computed against so tombstones still trigger a
    /// resize (and get dropped when the resize re-inserts live entries).
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn live_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Entry::Occupied { .. }))
            .count()
    }

    fn find_slot(entries: &[Entry], heap: &Heap, key: ObjRef) -> usize {
        let key_str = heap.as_string(key);
        let cap = entries.len() as u32;
        let mut index = key_str.hash % cap;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &entries[index as usize] {
                Entry::Empty => return first_tombstone.unwrap_or(index as usize),
                Entry::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index as usize);
                    }
                }
                Entry::Occupied { key: k, .. } => {
                    if *k == key || heap.as_string(*k).as_str() == key_str.as_str() {
                        return index as usize;
                    }
                }
            }
            index = (index + 1) % cap;
        }
    }

    fn grow(&mut self, heap: &Heap) {
        let new_cap = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        tracing::trace!(from = self.entries.len(), to = new_cap, "table: resizing");
        let mut new_entries = vec![Entry::Empty; 0];
        new_entries.resize_with(new_cap, || Entry::Empty);
        let mut live = 0;
        for entry in self.entries.drain(..) {
            if let Entry::Occupied { key, value } = entry {
                let slot = Self::find_slot(&new_entries, heap, key);
                new_entries[slot] = Entry::Occupied { key, value };
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
    }

    fn ensure_capacity(&mut self, heap: &Heap) {
        if self.entries.is_empty()
            || (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD_FACTOR
        {
            self.grow(heap);
        }
    }

    /// `set(k, v) -> was_new_key`.
    pub fn set(&mut self, heap: &Heap, key: ObjRef, value: Value) -> bool {
        self.ensure_capacity(heap);
        let slot = Self::find_slot(&self.entries, heap, key);
        let is_new = !matches!(self.entries[slot], Entry::Occupied { .. });
        if is_new && !matches!(self.entries[slot], Entry::Tombstone) {
            self.count += 1;
        }
        self.entries[slot] = Entry::Occupied { key, value };
        is_new
    }

    /// `get(k) -> Option<v>`.
    pub fn get(&self, heap: &Heap, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match &self.entries[Self::find_slot(&self.entries, heap, key)] {
            Entry::Occupied { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// `delete(k) -> was_present`. Leaves a tombstone so any probe chain
    /// that passed through this slot still finds later entries.
    pub fn delete(&mut self, heap: &Heap, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let slot = Self::find_slot(&self.entries, heap, key);
        if matches!(self.entries[slot], Entry::Occupied { .. }) {
            self.entries[slot] = Entry::Tombstone;
            true
        } else {
            false
        }
    }

    /// Probe by raw bytes and precomputed hash, without needing a key
    /// `ObjRef` to already exist — this is what makes interning cheap:
    /// the caller checks here *before* allocating a new `ObjString`.
    pub fn find_string(&self, heap: &Heap, bytes: &str, hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let cap = self.entries.len() as u32;
        let mut index = hash % cap;
        loop {
            match &self.entries[index as usize] {
                Entry::Empty => return None,
                Entry::Tombstone => {}
                Entry::Occupied { key, .. } => {
                    let s = heap.as_string(*key);
                    if s.hash == hash && s.as_str() == bytes {
                        return Some(*key);
                    }
                }
            }
            index = (index + 1) % cap;
        }
    }

    /// Remove `key` by identity, used when the GC frees a string that was
    /// acting purely as an intern-table entry: a collected string must be
    /// removed from the interner at the same time it's swept from the heap.
    pub fn delete_by_ref(&mut self, key: ObjRef) -> bool {
        for entry in &mut self.entries {
            if let Entry::Occupied { key: k, .. } = entry {
                if *k == key {
                    *entry = Entry::Tombstone;
                    return true;
                }
            }
        }
        false
    }

    pub fn keys(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Entry::Occupied { key, .. } => Some(*key),
            _ => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Entry::Occupied { key, value } => Some((*key, *value)),
            _ => None,
        })
    }
}

/// Find-or-create the canonical interned `ObjRef` for `bytes`. This is the
/// one path that is allowed to allocate a new `ObjString` into `heap`.
pub fn intern(heap: &mut Heap, interner: &mut Table, bytes: &str) -> ObjRef {
    let hash = hash_bytes(bytes.as_bytes());
    if let Some(existing) = interner.find_string(heap, bytes, hash) {
        return existing;
    }
    let obj_ref = heap.alloc(Obj::String(ObjString {
        hash,
        chars: bytes.into(),
    }));
    interner.set(heap, obj_ref, Value::Bool(true));
    obj_ref
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_collapses_equal_bytes() {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let a = intern(&mut heap, &mut interner, "abc");
        let b = intern(&mut heap, &mut interner, "abc");
        assert_eq!(a, b);
        let c = intern(&mut heap, &mut interner, "xyz");
        assert_ne!(a, c);
    }

    #[test]
    fn table_set_get_delete() {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let key = intern(&mut heap, &mut interner, "n");

        let mut globals = Table::new();
        assert!(globals.set(&heap, key, Value::Number(1.0)));
        assert!(!globals.set(&heap, key, Value::Number(2.0)));
        assert_eq!(globals.get(&heap, key), Some(Value::Number(2.0)));
        assert!(globals.delete(&heap, key));
        assert_eq!(globals.get(&heap, key), None);
        assert!(!globals.delete(&heap, key));
    }

    #[test]
    fn table_survives_resizing_many_entries() {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let mut globals = Table::new();
        let mut keys = Vec::new();
        for i in 0..200 {
            let key = intern(&mut heap, &mut interner, &format!("k{i}"));
            globals.set(&heap, key, Value::Number(i as f64));
            keys.push(key);
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(globals.get(&heap, *key), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn tombstones_keep_probe_chain_intact() {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let mut t = Table::new();
        let a = intern(&mut heap, &mut interner, "a");
        let b = intern(&mut heap, &mut interner, "b");
        t.set(&heap, a, Value::Number(1.0));
        t.set(&heap, b, Value::Number(2.0));
        t.delete(&heap, a);
        // b must still be reachable even though a's slot (possibly earlier
        // in the probe chain) is now a tombstone.
        assert_eq!(t.get(&heap, b), Some(Value::Number(2.0)));
    }
}
