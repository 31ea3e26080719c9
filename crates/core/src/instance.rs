use std::cell::RefCell;
use std::rc::Rc;

use crate::class::Class;
use crate::object::ObjHeader;
use crate::value::Value;

#[derive(Debug)]
pub struct Instance {
    pub header: ObjHeader,
    pub class: Rc<Class>,
    pub fields: RefCell<Vec<Value>>,
}

impl Instance {
    pub fn new(header: ObjHeader, class: Rc<Class>) -> Self {
        let field_count = class.field_count();
        Instance {
            header,
            class,
            fields: RefCell::new(vec![Value::Null; field_count]),
        }
    }

    pub fn get_field(&self, index: usize) -> Option<Value> {
        self.fields.borrow().get(index).cloned()
    }

    pub fn set_field(&self, index: usize, value: Value) -> Result<(), ()> {
        let mut fields = self.fields.borrow_mut();
        match fields.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(()),
        }
    }
}
