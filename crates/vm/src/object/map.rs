//! Map objects: a Value→Value hash table behind an instance head.

use super::InstanceCore;
use crate::table::LoxTable;

/// A guest hash map.
#[derive(Debug, Default)]
pub struct MapObj {
    pub core: InstanceCore,
    pub table: LoxTable,
}

impl MapObj {
    pub fn new(core: InstanceCore) -> Self {
        Self {
            core,
            table: LoxTable::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
