//! An open-addressed hash table keyed by guest values.
//!
//! `hashbrown` covers the identity-keyed tables (globals, method tables,
//! property tables, all keyed by interned strings), but a guest `Map` is
//! keyed by arbitrary values whose hash and equality route through the
//! heap, so `f64`-bearing keys cannot implement `Hash`. This table keeps
//! the key's hash alongside the entry and asks the heap only on probe
//! collisions. Linear probing, tombstone deletion, 75% load factor.

use crate::heap::Heap;
use crate::value::Value;

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;
const TABLE_MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy)]
enum Entry {
    Empty,
    Tombstone,
    Used { hash: u64, key: Value, value: Value },
}

/// A Value→Value hash table.
#[derive(Debug, Default)]
pub struct LoxTable {
    entries: Vec<Entry>,
    count: usize,
    live: usize,
}

impl LoxTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live key/value pairs.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Approximate byte footprint of the entry array.
    pub fn byte_size(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }

    fn find_slot(&self, heap: &Heap, hash: u64, key: &Value) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = (hash as usize) & mask;
        let mut first_tombstone = None;
        loop {
            match &self.entries[index] {
                Entry::Empty => return Some(first_tombstone.unwrap_or(index)),
                Entry::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Entry::Used {
                    hash: h, key: k, ..
                } => {
                    if *h == hash && heap.values_equal(k, key) {
                        return Some(index);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self, heap: &Heap) {
        let new_capacity = (self.entries.len() * 2).max(TABLE_MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![Entry::Empty; new_capacity]);
        self.count = 0;
        self.live = 0;
        for entry in old {
            if let Entry::Used { hash, key, value } = entry {
                self.insert_prehashed(heap, hash, key, value);
            }
        }
    }

    fn insert_prehashed(&mut self, heap: &Heap, hash: u64, key: Value, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.entries.len() * TABLE_MAX_LOAD_NUM {
            self.grow(heap);
        }
        let index = self
            .find_slot(heap, hash, &key)
            .expect("table grown before insert");
        let is_new = !matches!(self.entries[index], Entry::Used { .. });
        if is_new {
            if matches!(self.entries[index], Entry::Empty) {
                self.count += 1;
            }
            self.live += 1;
        }
        self.entries[index] = Entry::Used { hash, key, value };
        is_new
    }

    /// Inserts a key/value pair. Returns true if the key was new.
    pub fn set(&mut self, heap: &Heap, key: Value, value: Value) -> bool {
        let hash = heap.value_hash(&key);
        self.insert_prehashed(heap, hash, key, value)
    }

    /// Looks up a key.
    pub fn get(&self, heap: &Heap, key: &Value) -> Option<Value> {
        if self.live == 0 {
            return None;
        }
        let hash = heap.value_hash(key);
        match self.find_slot(heap, hash, key) {
            Some(index) => match self.entries[index] {
                Entry::Used { value, .. } => Some(value),
                _ => None,
            },
            None => None,
        }
    }

    /// Removes a key. Returns the removed value, if any.
    pub fn delete(&mut self, heap: &Heap, key: &Value) -> Option<Value> {
        if self.live == 0 {
            return None;
        }
        let hash = heap.value_hash(key);
        let index = self.find_slot(heap, hash, key)?;
        match self.entries[index] {
            Entry::Used { value, .. } => {
                self.entries[index] = Entry::Tombstone;
                self.live -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
        self.live = 0;
    }

    /// Iterates live entries as `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Entry::Used { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn test_set_get_delete() {
        let heap = Heap::new();
        let mut table = LoxTable::new();

        assert!(table.set(&heap, Value::Number(1.0), Value::TRUE));
        assert!(table.set(&heap, Value::Nil, Value::Number(9.0)));
        assert!(!table.set(&heap, Value::Number(1.0), Value::FALSE));
        assert_eq!(table.len(), 2);

        assert_eq!(table.get(&heap, &Value::Number(1.0)), Some(Value::FALSE));
        assert_eq!(table.get(&heap, &Value::Nil), Some(Value::Number(9.0)));
        assert_eq!(table.get(&heap, &Value::TRUE), None);

        assert_eq!(table.delete(&heap, &Value::Nil), Some(Value::Number(9.0)));
        assert_eq!(table.get(&heap, &Value::Nil), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_growth_keeps_entries() {
        let heap = Heap::new();
        let mut table = LoxTable::new();
        for i in 0..100 {
            table.set(&heap, Value::Number(i as f64), Value::Number((i * 2) as f64));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            assert_eq!(
                table.get(&heap, &Value::Number(i as f64)),
                Some(Value::Number((i * 2) as f64))
            );
        }
    }

    #[test]
    fn test_string_keys_compare_by_content() {
        let mut heap = Heap::new();
        let a = heap.alloc_plain_string(b"key".to_vec());
        let b = heap.alloc_plain_string(b"key".to_vec());
        assert_ne!(a, b);

        let mut table = LoxTable::new();
        table.set(&heap, Value::Obj(a), Value::Number(1.0));
        assert_eq!(table.get(&heap, &Value::Obj(b)), Some(Value::Number(1.0)));
    }
}
