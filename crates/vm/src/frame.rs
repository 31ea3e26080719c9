//! One activation record per live call.

use std::rc::Rc;

use xr_core::closure::Closure;

/// A single call's bookkeeping. Registers are not stored here: they live in
/// the VM's shared stack, indexed relative to `base`.
pub struct Frame {
    pub closure: Rc<Closure>,
    /// Absolute index into the VM's register stack of this frame's R(0).
    pub base: usize,
    pub pc: usize,
    /// Absolute stack index the return value gets written to once this
    /// frame completes — always a slot in the *caller's* frame.
    pub return_slot: usize,
}

impl Frame {
    pub fn new(closure: Rc<Closure>, base: usize, return_slot: usize) -> Self {
        Frame {
            closure,
            base,
            pc: 0,
            return_slot,
        }
    }

    pub fn current_line(&self) -> u32 {
        self.closure.proto.line_for(self.pc)
    }
}
