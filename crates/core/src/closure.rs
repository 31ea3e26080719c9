//! Runtime function values.

use std::rc::Rc;

use crate::object::ObjHeader;
use crate::proto::Proto;
use crate::upvalue::Upvalue;
use crate::value::Value;

#[derive(Debug)]
pub struct Closure {
    pub header: ObjHeader,
    pub proto: Rc<Proto>,
    pub upvalues: Vec<Rc<Upvalue>>,
}

/// A Rust-native builtin, e.g. `print` or an array/map method.
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, String>>;

pub struct Native {
    pub header: ObjHeader,
    pub name: Rc<str>,
    pub arity: Option<usize>,
    pub func: NativeFn,
}

impl std::fmt::Debug for Native {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Native").field("name", &self.name).finish()
    }
}

/// A method value bound to a receiver, produced when a method is referenced
/// without being immediately invoked (e.g. stored in a variable).
#[derive(Debug)]
pub struct BoundMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub method: Rc<crate::class::Method>,
}
