use crate::runtime::{
    gc::{GcHandle, Heap},
    object::HeapObject,
    value::Value,
};

/// Open-addressed hash table from `Value` to `Value`, with linear probing
/// and power-of-two capacities.
///
/// Slots whose key is `Undefined` are either empty (value `Nil`) or
/// tombstones left by deletion (value `true`); live keys are never `Nil` or
/// `Undefined`; the VM rejects those before they reach the table. Storing
/// `Nil` as a value deletes the entry.
///
/// Keys carry their precomputed hash (see [`Heap::value_hash`]), so probing
/// never needs heap access; only [`Table::find_string`], which compares
/// string contents for the intern pool, reads through the heap.
#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries plus tombstones; drives the load-factor check.
    count: usize,
    live: usize,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Value,
    hash: u64,
    value: Value,
}

const EMPTY: Entry = Entry {
    key: Value::Undefined,
    hash: 0,
    value: Value::Nil,
};

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns the stored value, or `Nil` if the key is absent.
    pub fn get(&self, key: Value, hash: u64) -> Value {
        if self.entries.is_empty() {
            return Value::Nil;
        }
        let entry = &self.entries[self.find_slot(key, hash)];
        match entry.key {
            Value::Undefined => Value::Nil,
            _ => entry.value,
        }
    }

    /// Inserts or updates `key`. A `Nil` value deletes the entry instead.
    pub fn set(&mut self, key: Value, hash: u64, value: Value) {
        debug_assert!(
            !matches!(key, Value::Nil | Value::Undefined),
            "table keys are checked by the VM"
        );
        if let Value::Nil = value {
            self.delete(key, hash);
            return;
        }

        if (self.count + 1) * 4 > self.entries.len() * 3 {
            self.grow();
        }

        let slot = self.find_slot(key, hash);
        let entry = &mut self.entries[slot];
        if let Value::Undefined = entry.key {
            if let Value::Nil = entry.value {
                self.count += 1;
            }
            self.live += 1;
            *entry = Entry { key, hash, value };
        } else {
            entry.value = value;
        }
    }

    fn delete(&mut self, key: Value, hash: u64) {
        if self.entries.is_empty() {
            return;
        }
        let slot = self.find_slot(key, hash);
        let entry = &mut self.entries[slot];
        if let Value::Undefined = entry.key {
            return;
        }
        // Leave a tombstone so probe chains stay intact.
        *entry = Entry {
            key: Value::Undefined,
            hash: 0,
            value: Value::Bool(true),
        };
        self.live -= 1;
    }

    /// Probes for an interned string with the given contents, comparing
    /// hash first and bytes only on a hash match. Used by the string pool
    /// before allocating a new string.
    pub fn find_string(&self, heap: &Heap, chars: &str, hash: u64) -> Option<GcHandle> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = (hash as usize) & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Value::Undefined => {
                    if let Value::Nil = entry.value {
                        return None;
                    }
                }
                Value::Object(handle) if entry.hash == hash => {
                    if let HeapObject::Str(s) = heap.get(handle) {
                        if &*s.chars == chars {
                            return Some(handle);
                        }
                    }
                }
                _ => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Iterates over live `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !matches!(e.key, Value::Undefined))
            .map(|e| (e.key, e.value))
    }

    /// Bytes owned by the backing storage, for GC accounting.
    pub fn storage_bytes(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }

    /// Index of the entry for `key`, or of the slot where it would be
    /// inserted (reusing the earliest tombstone on the probe chain).
    fn find_slot(&self, key: Value, hash: u64) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = (hash as usize) & mask;
        let mut tombstone = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Value::Undefined => {
                    if let Value::Nil = entry.value {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                k if k == key => return index,
                _ => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = (self.entries.len() * 2).max(8);
        let old = std::mem::replace(&mut self.entries, vec![EMPTY; new_capacity]);
        self.count = 0;
        self.live = 0;
        for entry in old {
            if matches!(entry.key, Value::Undefined) {
                continue;
            }
            let slot = self.find_slot(entry.key, entry.hash);
            self.entries[slot] = entry;
            self.count += 1;
            self.live += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::object::{hash_str, Str};

    fn num_key(n: f64) -> (Value, u64) {
        let heap = Heap::new();
        let key = Value::Num(n);
        let hash = heap.value_hash(key);
        (key, hash)
    }

    #[test]
    fn test_get_from_empty_is_nil() {
        let table = Table::new();
        let (k, h) = num_key(1.0);
        assert_eq!(table.get(k, h), Value::Nil);
    }

    #[test]
    fn test_set_get_update() {
        let mut table = Table::new();
        let (k, h) = num_key(1.0);
        table.set(k, h, Value::Num(10.0));
        assert_eq!(table.get(k, h), Value::Num(10.0));
        table.set(k, h, Value::Num(20.0));
        assert_eq!(table.get(k, h), Value::Num(20.0));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_nil_value_deletes() {
        let mut table = Table::new();
        let (k, h) = num_key(1.0);
        table.set(k, h, Value::Num(10.0));
        table.set(k, h, Value::Nil);
        assert_eq!(table.get(k, h), Value::Nil);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_tombstone_slot_is_reused() {
        let mut table = Table::new();
        let (k, h) = num_key(1.0);
        table.set(k, h, Value::Num(10.0));
        table.set(k, h, Value::Nil);
        let count_after_delete = table.count;
        table.set(k, h, Value::Num(30.0));
        assert_eq!(table.get(k, h), Value::Num(30.0));
        // Reinsertion reuses the tombstone instead of claiming a new slot.
        assert_eq!(table.count, count_after_delete);
    }

    #[test]
    fn test_growth_keeps_all_entries() {
        let heap = Heap::new();
        let mut table = Table::new();
        for i in 0..100 {
            let key = Value::Num(i as f64);
            table.set(key, heap.value_hash(key), Value::Num((i * 2) as f64));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            let key = Value::Num(i as f64);
            assert_eq!(
                table.get(key, heap.value_hash(key)),
                Value::Num((i * 2) as f64)
            );
        }
    }

    #[test]
    fn test_bool_keys() {
        let heap = Heap::new();
        let mut table = Table::new();
        let t = Value::Bool(true);
        let f = Value::Bool(false);
        table.set(t, heap.value_hash(t), Value::Num(1.0));
        table.set(f, heap.value_hash(f), Value::Num(2.0));
        assert_eq!(table.get(t, heap.value_hash(t)), Value::Num(1.0));
        assert_eq!(table.get(f, heap.value_hash(f)), Value::Num(2.0));
    }

    #[test]
    fn test_find_string() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let hash = hash_str("hello");
        let handle = heap.alloc(HeapObject::Str(Str {
            chars: "hello".into(),
            hash,
        }));
        table.set(Value::Object(handle), hash, Value::Bool(true));

        assert_eq!(table.find_string(&heap, "hello", hash), Some(handle));
        assert_eq!(
            table.find_string(&heap, "world", hash_str("world")),
            None
        );
    }

    #[test]
    fn test_iter_skips_holes() {
        let heap = Heap::new();
        let mut table = Table::new();
        for i in 0..10 {
            let key = Value::Num(i as f64);
            table.set(key, heap.value_hash(key), Value::Bool(true));
        }
        let key = Value::Num(3.0);
        table.set(key, heap.value_hash(key), Value::Nil);
        assert_eq!(table.iter().count(), 9);
        assert!(table.iter().all(|(k, _)| k != Value::Num(3.0)));
    }
}
