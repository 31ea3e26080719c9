//! The array collaborator. Specified at its interface only; backed here by
//! a `RefCell<Vec<Value>>` so the workspace builds end-to-end.

use std::cell::RefCell;

use crate::value::Value;

#[derive(Debug, Default)]
pub struct XArray {
    items: RefCell<Vec<Value>>,
}

impl XArray {
    pub fn new() -> Self {
        XArray {
            items: RefCell::new(Vec::new()),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        XArray {
            items: RefCell::new(Vec::with_capacity(cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: i64) -> Option<Value> {
        let items = self.items.borrow();
        usize::try_from(index)
            .ok()
            .and_then(|i| items.get(i).cloned())
    }

    pub fn set(&self, index: i64, value: Value) -> Result<(), ()> {
        let mut items = self.items.borrow_mut();
        match usize::try_from(index).ok().filter(|i| *i < items.len()) {
            Some(i) => {
                items[i] = value;
                Ok(())
            }
            None => Err(()),
        }
    }

    pub fn push(&self, value: Value) {
        self.items.borrow_mut().push(value);
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }
}
