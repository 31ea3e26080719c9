//! The compiled function record. Immutable after compilation; read-only
//! during execution.

use std::rc::Rc;

use crate::opcode::Instruction;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
}

#[derive(Debug)]
pub struct Proto {
    pub name: Option<Rc<str>>,
    pub code: Vec<Instruction>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
    pub children: Vec<Rc<Proto>>,
    pub upvalues: Vec<UpvalueDesc>,
    pub num_params: u8,
    pub is_variadic: bool,
    pub max_stack: u8,
    pub num_globals: u32,
}

impl Proto {
    pub fn line_for(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(0)
    }
}
