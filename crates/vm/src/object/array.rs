//! Array objects with copy-on-write backing buffers.

use super::InstanceCore;
use crate::value::Value;
use std::sync::Arc;

/// A dynamic sequence of values.
///
/// The backing buffer is shared (`Arc`) so literal arrays cloned out of
/// a chunk's constant pool and `dup`ed arrays alias their source until
/// the first mutation; [`ArrayObj::dedupe`] copies at that point, which
/// is the copy-on-write contract.
#[derive(Debug, Default)]
pub struct ArrayObj {
    pub core: InstanceCore,
    values: Arc<Vec<Value>>,
}

impl ArrayObj {
    pub fn new(core: InstanceCore, values: Vec<Value>) -> Self {
        Self {
            core,
            values: Arc::new(values),
        }
    }

    /// Creates an array aliasing another array's buffer.
    pub fn shared_from(core: InstanceCore, source: &ArrayObj) -> Self {
        Self {
            core,
            values: Arc::clone(&source.values),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.values.get(index).copied()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns true while the buffer is aliased by another array.
    pub fn is_buffer_shared(&self) -> bool {
        Arc::strong_count(&self.values) > 1
    }

    /// Copies the buffer if it is aliased. Every mutating entry point
    /// goes through here first.
    pub fn dedupe(&mut self) -> &mut Vec<Value> {
        Arc::make_mut(&mut self.values)
    }

    pub fn push(&mut self, value: Value) {
        self.dedupe().push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.dedupe().pop()
    }

    pub fn set(&mut self, index: usize, value: Value) {
        let values = self.dedupe();
        if index >= values.len() {
            values.resize(index + 1, Value::Nil);
        }
        values[index] = value;
    }

    pub fn clear(&mut self) {
        self.dedupe().clear();
    }

    /// Approximate byte footprint of the backing buffer, counted once
    /// per owning arena slot even when aliased.
    pub fn byte_size(&self) -> usize {
        self.values.capacity() * std::mem::size_of::<Value>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_on_write() {
        let mut source = ArrayObj::new(InstanceCore::default(), vec![Value::Number(1.0)]);
        let mut copy = ArrayObj::shared_from(InstanceCore::default(), &source);
        assert!(source.is_buffer_shared());

        // Mutating the copy leaves the source untouched.
        copy.push(Value::Number(2.0));
        assert_eq!(copy.len(), 2);
        assert_eq!(source.len(), 1);
        assert!(!source.is_buffer_shared());

        // And vice versa.
        source.push(Value::Number(3.0));
        assert_eq!(copy.len(), 2);
        assert_eq!(source.get(1), Some(Value::Number(3.0)));
    }

    #[test]
    fn test_set_grows() {
        let mut ary = ArrayObj::default();
        ary.set(2, Value::TRUE);
        assert_eq!(ary.len(), 3);
        assert_eq!(ary.get(0), Some(Value::Nil));
        assert_eq!(ary.get(2), Some(Value::TRUE));
    }
}
