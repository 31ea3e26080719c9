//! The map collaborator. `test_map.c` (original source) asserts that
//! `keys()`/`values()`/`entries()` iterate in insertion order, so this keeps
//! a parallel `Vec<Value>` of keys alongside the hash index.

use std::cell::RefCell;

use hashbrown::HashMap;

use crate::value::Value;

#[derive(Debug, Default)]
pub struct XMap {
    index: RefCell<HashMap<Value, usize>>,
    keys: RefCell<Vec<Value>>,
    values: RefCell<Vec<Value>>,
}

impl XMap {
    pub fn new() -> Self {
        XMap {
            index: RefCell::new(HashMap::new()),
            keys: RefCell::new(Vec::new()),
            values: RefCell::new(Vec::new()),
        }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        let index = self.index.borrow();
        index
            .get(key)
            .and_then(|&i| self.values.borrow().get(i).cloned())
    }

    pub fn has(&self, key: &Value) -> bool {
        self.index.borrow().contains_key(key)
    }

    pub fn set(&self, key: Value, value: Value) {
        let mut index = self.index.borrow_mut();
        if let Some(&i) = index.get(&key) {
            self.values.borrow_mut()[i] = value;
            return;
        }
        let i = self.keys.borrow().len();
        self.keys.borrow_mut().push(key.clone());
        self.values.borrow_mut().push(value);
        index.insert(key, i);
    }

    /// Removes `key`. The backing vectors keep a tombstone-free compaction:
    /// removal is O(n) because insertion order must be preserved.
    pub fn delete(&self, key: &Value) -> bool {
        let idx = self.index.borrow_mut().remove(key);
        match idx {
            Some(i) => {
                self.keys.borrow_mut().remove(i);
                self.values.borrow_mut().remove(i);
                let mut index = self.index.borrow_mut();
                for v in index.values_mut() {
                    if *v > i {
                        *v -= 1;
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<Value> {
        self.keys.borrow().clone()
    }

    pub fn values(&self) -> Vec<Value> {
        self.values.borrow().clone()
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.keys
            .borrow()
            .iter()
            .cloned()
            .zip(self.values.borrow().iter().cloned())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.keys.borrow().len()
    }
}
