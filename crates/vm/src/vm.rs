//! The interpreter loop: one register stack, a call-frame array, and a
//! straight `match` over [`OpCode`] that decodes and executes one
//! instruction per iteration.
//!
//! Unlike a C `switch` dispatching through `goto *dispatch_table[op]`, there
//! is no separate "fast path" loop to jump back into after a call pushes or
//! pops a frame — the outer `while` just re-reads whatever frame is now on
//! top on its next iteration. Simpler to read, and the match arms are the
//! same handful of instructions either way.

use std::cell::RefCell;
use std::rc::Rc;

use xr_core::class::{Class, FieldDecl, Method, OperatorKind};
use xr_core::closure::{BoundMethod, Closure};
use xr_core::instance::Instance;
use xr_core::intern::Interner;
use xr_core::object::{ObjType, ObjectList};
use xr_core::opcode::{Instruction, OpCode};
use xr_core::proto::Proto;
use xr_core::upvalue::Upvalue;
use xr_core::value::Value;
use xr_core::VmConfig;
use xr_symbol::SymbolTable;

use crate::builtins;
use crate::error::{TraceFrame, VmError, VmResult};
use crate::frame::Frame;

/// The four arithmetic opcodes that share one polymorphic dispatch: numeric
/// fast paths, string concatenation when either side is a string, and an
/// operator-overload trampoline when the left side is an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: Vec<Value>,
    /// Sorted descending by stack index, so closing always pops from the
    /// front and stops at the first cell below the threshold.
    open_upvalues: Vec<Rc<Upvalue>>,
    interner: Rc<Interner>,
    symbols: Rc<RefCell<SymbolTable>>,
    objects: ObjectList,
    config: VmConfig,
    instructions_executed: u64,
    last_value: Value,
}

impl Vm {
    pub fn new(symbols: Rc<RefCell<SymbolTable>>, config: VmConfig) -> Self {
        Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Vec::new(),
            open_upvalues: Vec::new(),
            interner: Rc::new(Interner::new()),
            symbols,
            objects: ObjectList::new(),
            config,
            instructions_executed: 0,
            last_value: Value::Null,
        }
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions_executed
    }

    pub fn object_count(&self) -> usize {
        self.objects.object_count()
    }

    pub fn interner(&self) -> &Rc<Interner> {
        &self.interner
    }

    /// Runs a freshly compiled top-level `Proto` to completion, clearing all
    /// VM state afterward whether it finished or errored.
    pub fn interpret(&mut self, proto: Rc<Proto>) -> Result<(), (VmError, Vec<TraceFrame>)> {
        if self.globals.len() < proto.num_globals as usize {
            self.globals.resize(proto.num_globals as usize, Value::Null);
        }
        let closure = Rc::new(Closure {
            header: self.objects.alloc_header(ObjType::Closure),
            proto: proto.clone(),
            upvalues: Vec::new(),
        });
        self.ensure_stack(proto.max_stack as usize);
        self.frames.push(Frame::new(closure, 0, 0));
        let result = self.run_until(0);
        match result {
            Ok(_) => {
                self.frames.clear();
                self.stack.clear();
                Ok(())
            }
            Err(e) => {
                let trace = self.build_trace();
                self.frames.clear();
                self.stack.clear();
                Err((e, trace))
            }
        }
    }

    fn build_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|f| TraceFrame {
                line: f.current_line(),
                name: f.closure.proto.name.clone(),
            })
            .collect()
    }

    fn ensure_stack(&mut self, len: usize) {
        if self.stack.len() < len {
            self.stack.resize(len, Value::Null);
        }
    }

    /// Executes instructions until the frame stack depth drops back to
    /// `stop_depth`, returning whatever the frame at `stop_depth + 1` last
    /// returned. Re-entrant: operator overloads and `toString` calls recurse
    /// into this with a deeper `stop_depth`.
    fn run_until(&mut self, stop_depth: usize) -> VmResult<Value> {
        loop {
            if self.frames.len() <= stop_depth {
                return Ok(self.last_value.clone());
            }
            let idx = self.frames.len() - 1;
            let pc = self.frames[idx].pc;
            self.frames[idx].pc += 1;
            let closure = self.frames[idx].closure.clone();
            let base = self.frames[idx].base;
            let proto = closure.proto.clone();
            let instr = *proto
                .code
                .get(pc)
                .ok_or(VmError::UnknownOpcode { opcode: 0xFF })?;
            let line = proto.line_for(pc);
            self.instructions_executed += 1;
            if self.config.trace_execution {
                log::trace!(
                    "pc={pc:04} {:?} a={} b={} c={}",
                    instr.opcode(),
                    instr.a(),
                    instr.b(),
                    instr.c()
                );
            }
            self.exec(instr, &proto, base, idx, line)?;
        }
    }

    #[allow(clippy::too_many_lines)]
    fn exec(
        &mut self,
        instr: Instruction,
        proto: &Rc<Proto>,
        base: usize,
        idx: usize,
        line: u32,
    ) -> VmResult<()> {
        match instr.opcode() {
            OpCode::LoadI => {
                let v = Value::int(instr.sbx() as i64);
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::LoadF | OpCode::LoadK => {
                let v = self.load_constant(proto, instr.bx() as usize);
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::LoadNil => self.stack[base + instr.a() as usize] = Value::null(),
            OpCode::LoadTrue => self.stack[base + instr.a() as usize] = Value::bool(true),
            OpCode::LoadFalse => self.stack[base + instr.a() as usize] = Value::bool(false),
            OpCode::Move => {
                let v = self.stack[base + instr.b() as usize].clone();
                self.stack[base + instr.a() as usize] = v;
            }

            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                let op = arith_op(instr.opcode());
                let l = self.stack[base + instr.b() as usize].clone();
                let r = self.stack[base + instr.c() as usize].clone();
                let v = self.arith(op, l, r, line)?;
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::AddI | OpCode::SubI | OpCode::MulI => {
                let op = match instr.opcode() {
                    OpCode::AddI => ArithOp::Add,
                    OpCode::SubI => ArithOp::Sub,
                    OpCode::MulI => ArithOp::Mul,
                    _ => unreachable!(),
                };
                let l = self.stack[base + instr.b() as usize].clone();
                let r = Value::int(instr.c() as i8 as i64);
                let v = self.arith(op, l, r, line)?;
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::AddK | OpCode::SubK | OpCode::MulK => {
                let op = match instr.opcode() {
                    OpCode::AddK => ArithOp::Add,
                    OpCode::SubK => ArithOp::Sub,
                    OpCode::MulK => ArithOp::Mul,
                    _ => unreachable!(),
                };
                let l = self.stack[base + instr.b() as usize].clone();
                let r = self.load_constant(proto, instr.c() as usize);
                let v = self.arith(op, l, r, line)?;
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::Unm => {
                let v = self.stack[base + instr.b() as usize].clone();
                let result = match v {
                    Value::Int(i) => Value::int(i.wrapping_neg()),
                    Value::Float(f) => Value::float(-f),
                    other => {
                        return Err(VmError::TypeMismatch {
                            line,
                            expected: "number",
                            actual: other.type_name(),
                        })
                    }
                };
                self.stack[base + instr.a() as usize] = result;
            }
            OpCode::Not => {
                let v = self.stack[base + instr.b() as usize].is_falsey();
                self.stack[base + instr.a() as usize] = Value::bool(v);
            }

            OpCode::Eq | OpCode::Ne | OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge => {
                let l = self.stack[base + instr.a() as usize].clone();
                let r = self.stack[base + instr.b() as usize].clone();
                let k = instr.c() != 0;
                let cond = self.eval_condition(instr.opcode(), &l, &r, line)?;
                // The comparison opcode's own Jmp executes iff cond is
                // false when k=0 (xr-compiler never emits k=1 here), so we
                // skip the following Jmp exactly when cond != k.
                if cond != k {
                    self.frames[idx].pc += 1;
                }
            }
            OpCode::EqK => {
                let l = self.stack[base + instr.a() as usize].clone();
                let r = self.load_constant(proto, instr.c() as usize);
                let k = instr.b() != 0;
                let cond = self.values_equal(&l, &r, line)?;
                if cond != k {
                    self.frames[idx].pc += 1;
                }
            }
            OpCode::LtI | OpCode::LeI | OpCode::GtI | OpCode::GeI => {
                let cmp = match instr.opcode() {
                    OpCode::LtI => CmpOp::Lt,
                    OpCode::LeI => CmpOp::Le,
                    OpCode::GtI => CmpOp::Gt,
                    OpCode::GeI => CmpOp::Ge,
                    _ => unreachable!(),
                };
                let l = self.stack[base + instr.a() as usize].clone();
                let r = Value::int(instr.c() as i8 as i64);
                let k = instr.b() != 0;
                let cond = self.compare_ordered(cmp, &l, &r, line)?;
                if cond != k {
                    self.frames[idx].pc += 1;
                }
            }

            OpCode::Jmp => {
                let target = (self.frames[idx].pc as i64 + instr.sj() as i64) as usize;
                self.frames[idx].pc = target;
            }
            OpCode::Test => {
                let falsey = self.stack[base + instr.a() as usize].is_falsey();
                let k = instr.c() != 0;
                if falsey == k {
                    self.frames[idx].pc += 1;
                }
            }
            OpCode::TestSet => {
                let val = self.stack[base + instr.b() as usize].clone();
                let k = instr.c() != 0;
                if val.is_truthy() == k {
                    self.stack[base + instr.a() as usize] = val;
                } else {
                    self.frames[idx].pc += 1;
                }
            }

            OpCode::Call | OpCode::CallSelf => {
                self.exec_call(instr, proto, base, idx, line)?;
            }
            OpCode::TailCall => {
                self.exec_tailcall(instr, idx, base, line)?;
            }
            OpCode::Return => {
                let a = instr.a();
                let value = if instr.b() > 0 {
                    self.stack[base + a as usize].clone()
                } else {
                    Value::null()
                };
                self.do_return(value);
            }

            OpCode::NewTable => {
                let hint = instr.b() as usize;
                let v = if instr.c() == 0 {
                    Value::array(Rc::new(xr_core::array::XArray::with_capacity(hint)))
                } else {
                    Value::map(Rc::new(xr_core::map::XMap::new()))
                };
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::GetTable => {
                let obj = self.stack[base + instr.b() as usize].clone();
                let key = self.stack[base + instr.c() as usize].clone();
                let v = self.table_get(&obj, &key, line)?;
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::SetTable => {
                let obj = self.stack[base + instr.a() as usize].clone();
                let key = self.stack[base + instr.b() as usize].clone();
                let val = self.stack[base + instr.c() as usize].clone();
                self.table_set(&obj, key, val, line)?;
            }
            OpCode::GetI => {
                let obj = self.stack[base + instr.b() as usize].clone();
                let key = Value::int(instr.c() as i64);
                let v = self.table_get(&obj, &key, line)?;
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::SetI => {
                let obj = self.stack[base + instr.a() as usize].clone();
                let key = Value::int(instr.b() as i64);
                let val = self.stack[base + instr.c() as usize].clone();
                self.table_set(&obj, key, val, line)?;
            }
            OpCode::GetField => {
                let obj = self.stack[base + instr.b() as usize].clone();
                let name = self.const_string(proto, instr.c() as usize, line)?;
                let v = match &obj {
                    Value::Map(m) => m
                        .get(&Value::string(self.interner.intern(&name)))
                        .unwrap_or(Value::null()),
                    Value::Instance(_) => self.get_instance_field(&obj, &name, line)?,
                    other => {
                        return Err(VmError::TypeMismatch {
                            line,
                            expected: "map or instance",
                            actual: other.type_name(),
                        })
                    }
                };
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::SetField => {
                let obj = self.stack[base + instr.a() as usize].clone();
                let name = self.const_string(proto, instr.b() as usize, line)?;
                let val = self.stack[base + instr.c() as usize].clone();
                match &obj {
                    Value::Map(m) => m.set(Value::string(self.interner.intern(&name)), val),
                    Value::Instance(_) => self.set_instance_field(&obj, &name, val, line)?,
                    other => {
                        return Err(VmError::TypeMismatch {
                            line,
                            expected: "map or instance",
                            actual: other.type_name(),
                        })
                    }
                }
            }
            OpCode::SetList => {
                let arr = self.stack[base + instr.a() as usize]
                    .as_array()
                    .expect("NEWTABLE precedes SETLIST")
                    .clone();
                for i in 1..=instr.b() {
                    let v = self.stack[base + instr.a() as usize + i as usize].clone();
                    arr.push(v);
                }
            }

            OpCode::Closure => {
                let child = proto.children[instr.bx() as usize].clone();
                let upvalues = self.capture_closure_upvalues(&child, base, idx);
                let closure = Rc::new(Closure {
                    header: self.objects.alloc_header(ObjType::Closure),
                    proto: child,
                    upvalues,
                });
                self.stack[base + instr.a() as usize] = Value::Closure(closure);
            }
            OpCode::GetUpval => {
                let closure = self.frames[idx].closure.clone();
                let up = &closure.upvalues[instr.b() as usize];
                let v = self.read_upvalue(up);
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::SetUpval => {
                let closure = self.frames[idx].closure.clone();
                let up = closure.upvalues[instr.b() as usize].clone();
                let v = self.stack[base + instr.a() as usize].clone();
                self.write_upvalue(&up, v);
            }
            OpCode::Close => {
                self.close_upvalues_from(base + instr.a() as usize);
            }

            OpCode::Class => {
                let name = self.const_string(proto, instr.bx() as usize, line)?;
                let class = Rc::new(Class::new(
                    self.objects.alloc_header(ObjType::Class),
                    Rc::from(name.as_str()),
                ));
                self.stack[base + instr.a() as usize] = Value::Class(class);
            }
            OpCode::AddField => {
                let class = self.stack[base + instr.a() as usize]
                    .as_class()
                    .expect("CLASS precedes ADDFIELD")
                    .clone();
                let name = self.const_string(proto, instr.b() as usize, line)?;
                let type_name = if instr.c() == 0 {
                    None
                } else {
                    Some(Rc::from(self.const_string(proto, instr.c() as usize, line)?.as_str()))
                };
                class.add_field(FieldDecl {
                    name: Rc::from(name.as_str()),
                    type_name,
                });
            }
            OpCode::Inherit => {
                let class = self.stack[base + instr.a() as usize]
                    .as_class()
                    .expect("CLASS precedes INHERIT")
                    .clone();
                let superclass = self.stack[base + instr.b() as usize]
                    .as_class()
                    .ok_or(VmError::TypeMismatch {
                        line,
                        expected: "class",
                        actual: self.stack[base + instr.b() as usize].type_name(),
                    })?
                    .clone();
                class.inherit_from(&superclass);
            }
            OpCode::GetProp => {
                let obj = self.stack[base + instr.b() as usize].clone();
                let name = self.const_string(proto, instr.c() as usize, line)?;
                let v = self.get_instance_field(&obj, &name, line)?;
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::SetProp => {
                let obj = self.stack[base + instr.a() as usize].clone();
                let name = self.const_string(proto, instr.b() as usize, line)?;
                let val = self.stack[base + instr.c() as usize].clone();
                self.set_instance_field(&obj, &name, val, line)?;
            }
            OpCode::GetSuper => {
                let superclass = self.stack[base + instr.b() as usize]
                    .as_class()
                    .ok_or(VmError::TypeMismatch {
                        line,
                        expected: "class",
                        actual: self.stack[base + instr.b() as usize].type_name(),
                    })?
                    .clone();
                let name = self.const_string(proto, instr.c() as usize, line)?;
                let symbol = self
                    .symbols
                    .borrow()
                    .lookup(&name)
                    .ok_or_else(|| VmError::MethodNotFound { line, name: name.clone() })?;
                let method = superclass
                    .resolve_method(symbol)
                    .ok_or(VmError::MethodNotFound { line, name })?;
                let this_value = self.stack[base].clone();
                let bound = Rc::new(BoundMethod {
                    header: self.objects.alloc_header(ObjType::BoundMethod),
                    receiver: this_value,
                    method,
                });
                self.stack[base + instr.a() as usize] = Value::BoundMethod(bound);
            }
            OpCode::Invoke => {
                self.exec_invoke(instr, base, line)?;
            }
            OpCode::SuperInvoke => {
                self.exec_super_invoke(instr, base, line)?;
            }
            OpCode::Method => {
                let a = instr.a();
                let symbol = instr.b() as u32;
                let class = self.stack[base + a as usize]
                    .as_class()
                    .expect("CLASS precedes METHOD")
                    .clone();
                let closure = self.stack[base + instr.c() as usize]
                    .as_closure()
                    .expect("CLOSURE precedes METHOD")
                    .clone();
                let name = self
                    .symbols
                    .borrow()
                    .name_of(symbol)
                    .map(Rc::from)
                    .unwrap_or_else(|| Rc::from(""));
                let method = Rc::new(Method {
                    name,
                    proto: closure.proto.clone(),
                    upvalues: closure.upvalues.clone(),
                    symbol,
                    is_static: false,
                    is_private: false,
                    is_constructor: symbol == xr_symbol::SYMBOL_CONSTRUCTOR,
                    is_getter: false,
                    is_setter: false,
                    operator: OperatorKind::from_symbol(symbol),
                });
                class.add_method(method);
            }

            OpCode::GetGlobal => {
                let v = self
                    .globals
                    .get(instr.bx() as usize)
                    .cloned()
                    .unwrap_or(Value::null());
                self.stack[base + instr.a() as usize] = v;
            }
            OpCode::SetGlobal | OpCode::DefGlobal => {
                let idx = instr.bx() as usize;
                if self.globals.len() <= idx {
                    self.globals.resize(idx + 1, Value::Null);
                }
                self.globals[idx] = self.stack[base + instr.a() as usize].clone();
            }

            OpCode::Print => {
                let v = self.stack[base + instr.a() as usize].clone();
                let text = self.stringify(&v, line)?;
                println!("{text}");
            }
            OpCode::Nop => {}
        }
        Ok(())
    }

    fn load_constant(&self, proto: &Rc<Proto>, idx: usize) -> Value {
        let c = &proto.constants[idx];
        match c {
            Value::String(s) => Value::String(self.interner.intern(&s.chars)),
            other => other.clone(),
        }
    }

    fn const_string(&self, proto: &Rc<Proto>, idx: usize, line: u32) -> VmResult<String> {
        proto
            .constants
            .get(idx)
            .and_then(Value::as_string)
            .map(|s| s.chars.clone())
            .ok_or(VmError::TypeMismatch {
                line,
                expected: "string constant",
                actual: "missing",
            })
    }

    // --- calls ---

    fn exec_call(
        &mut self,
        instr: Instruction,
        proto: &Rc<Proto>,
        base: usize,
        idx: usize,
        line: u32,
    ) -> VmResult<()> {
        let a = instr.a();
        let argc = instr.b();
        let new_base = base + a as usize + 1;
        let return_slot = base + a as usize;
        // CALLSELF is reserved for direct self-recursion without reloading
        // the closure into a register; not currently emitted, implemented
        // for completeness alongside GETI/SETI/GETFIELD/SETFIELD.
        let callee = if instr.opcode() == OpCode::CallSelf {
            let _ = proto;
            Value::Closure(self.frames[idx].closure.clone())
        } else {
            self.stack[return_slot].clone()
        };
        match callee {
            Value::Closure(c) => {
                self.push_frame(c, new_base, return_slot, argc as usize, line)?;
            }
            Value::Native(n) => {
                let args = self.stack[new_base..new_base + argc as usize].to_vec();
                let result = (n.func)(&args)
                    .map_err(|message| VmError::NativeError { line, message })?;
                self.stack[return_slot] = result;
            }
            other => {
                return Err(VmError::NotCallable {
                    line,
                    type_name: other.type_name(),
                })
            }
        }
        Ok(())
    }

    fn exec_tailcall(
        &mut self,
        instr: Instruction,
        idx: usize,
        base: usize,
        line: u32,
    ) -> VmResult<()> {
        let a = instr.a();
        let total = instr.b() as usize; // callee + args
        let nargs = total - 1;
        let callee = self.stack[base + a as usize].clone();
        let Value::Closure(c) = callee else {
            return Err(VmError::NotCallable {
                line,
                type_name: callee.type_name(),
            });
        };
        if nargs != c.proto.num_params as usize {
            return Err(VmError::ArityMismatch {
                line,
                expected: c.proto.num_params as usize,
                actual: nargs,
            });
        }
        // Tail calls reuse this frame instead of pushing a new one, so the
        // recursion never grows `self.frames` — the whole point of TAILCALL.
        self.close_upvalues_from(base);
        for i in 0..total {
            self.stack[base + i] = self.stack[base + a as usize + i].clone();
        }
        self.ensure_stack(base + c.proto.max_stack as usize);
        self.frames[idx].closure = c;
        self.frames[idx].pc = 0;
        Ok(())
    }

    fn push_frame(
        &mut self,
        closure: Rc<Closure>,
        new_base: usize,
        return_slot: usize,
        nargs: usize,
        line: u32,
    ) -> VmResult<()> {
        if nargs != closure.proto.num_params as usize {
            return Err(VmError::ArityMismatch {
                line,
                expected: closure.proto.num_params as usize,
                actual: nargs,
            });
        }
        if self.frames.len() >= self.config.frames_max {
            return Err(VmError::StackOverflow {
                max_frames: self.config.frames_max,
            });
        }
        self.ensure_stack(new_base + closure.proto.max_stack as usize);
        self.frames.push(Frame::new(closure, new_base, return_slot));
        Ok(())
    }

    fn do_return(&mut self, value: Value) {
        let frame = self.frames.pop().expect("frame to pop on RETURN");
        self.close_upvalues_from(frame.base);
        self.stack.truncate(frame.base);
        if frame.return_slot < self.stack.len() {
            self.stack[frame.return_slot] = value.clone();
        }
        self.last_value = value;
    }

    /// Runs `proto`/`upvalues` as a nested call (operator overloads,
    /// `toString`), laying the receiver and args on top of the live stack
    /// and restoring the stack to its prior length afterward. The pushed
    /// frame's `return_slot` equals its own `base`, which
    /// [`Vm::do_return`]'s bounds check turns into "write nowhere" — the
    /// caller here gets the value back directly from [`Vm::run_until`].
    fn call_value(
        &mut self,
        method_proto: Rc<Proto>,
        upvalues: Vec<Rc<Upvalue>>,
        receiver: Value,
        args: Vec<Value>,
        line: u32,
    ) -> VmResult<Value> {
        let start = self.stack.len();
        self.stack.push(receiver);
        self.stack.extend(args.iter().cloned());
        let total = 1 + args.len();
        if total != method_proto.num_params as usize {
            self.stack.truncate(start);
            return Err(VmError::ArityMismatch {
                line,
                expected: method_proto.num_params as usize,
                actual: total,
            });
        }
        if self.frames.len() >= self.config.frames_max {
            self.stack.truncate(start);
            return Err(VmError::StackOverflow {
                max_frames: self.config.frames_max,
            });
        }
        self.ensure_stack(start + method_proto.max_stack as usize);
        let closure = Rc::new(Closure {
            header: self.objects.alloc_header(ObjType::Closure),
            proto: method_proto,
            upvalues,
        });
        let depth_before = self.frames.len();
        self.frames.push(Frame::new(closure, start, start));
        let result = self.run_until(depth_before);
        self.stack.truncate(start);
        result
    }

    fn call_method(
        &mut self,
        method: &Rc<Method>,
        receiver: Value,
        args: Vec<Value>,
        line: u32,
    ) -> VmResult<Value> {
        self.call_value(method.proto.clone(), method.upvalues.clone(), receiver, args, line)
    }

    fn shift_for_invoke(&mut self, base: usize, a: u8, argc: u8, receiver: Value) -> (usize, usize) {
        let start = base + a as usize;
        self.ensure_stack(start + 2 + argc as usize);
        for i in (0..argc as usize).rev() {
            self.stack[start + 2 + i] = self.stack[start + 1 + i].clone();
        }
        self.stack[start + 1] = receiver;
        (start + 1, argc as usize + 1)
    }

    fn exec_invoke(&mut self, instr: Instruction, base: usize, line: u32) -> VmResult<()> {
        let a = instr.a();
        let symbol = instr.b() as u32;
        let argc = instr.c();
        let receiver = self.stack[base + a as usize].clone();
        match &receiver {
            Value::Class(class) => {
                let ctor = class.resolve_method(xr_symbol::SYMBOL_CONSTRUCTOR);
                let instance = Rc::new(Instance::new(
                    self.objects.alloc_header(ObjType::Instance),
                    class.clone(),
                ));
                match ctor {
                    Some(method) => {
                        let (new_base, total) =
                            self.shift_for_invoke(base, a, argc, Value::Instance(instance));
                        self.push_method_frame(&method, new_base, base + a as usize, total, line)?;
                    }
                    None => {
                        self.stack[base + a as usize] = Value::Instance(instance);
                    }
                }
            }
            Value::Instance(inst) => {
                let class = inst.class.clone();
                let method = class.resolve_method(symbol).ok_or_else(|| {
                    VmError::MethodNotFound {
                        line,
                        name: self.symbol_name(symbol),
                    }
                })?;
                let (new_base, total) = self.shift_for_invoke(base, a, argc, receiver);
                self.push_method_frame(&method, new_base, base + a as usize, total, line)?;
            }
            Value::Array(array) => {
                let name = self.symbol_name(symbol);
                let args = self.collect_args(base, a, argc);
                let result = builtins::call_array_method(array, &name, &args, line)?;
                self.stack[base + a as usize] = result;
            }
            Value::Map(map) => {
                let name = self.symbol_name(symbol);
                let args = self.collect_args(base, a, argc);
                let result = builtins::call_map_method(map, &name, &args, line)?;
                self.stack[base + a as usize] = result;
            }
            Value::String(s) => {
                let name = self.symbol_name(symbol);
                let args = self.collect_args(base, a, argc);
                let result = builtins::call_string_method(&s.chars, &name, &args, line)?;
                self.stack[base + a as usize] = result;
            }
            other => {
                return Err(VmError::NotCallable {
                    line,
                    type_name: other.type_name(),
                })
            }
        }
        Ok(())
    }

    fn exec_super_invoke(&mut self, instr: Instruction, base: usize, line: u32) -> VmResult<()> {
        let a = instr.a();
        let symbol = instr.b() as u32;
        let argc = instr.c();
        let superclass = self.stack[base + a as usize]
            .as_class()
            .ok_or(VmError::TypeMismatch {
                line,
                expected: "class",
                actual: self.stack[base + a as usize].type_name(),
            })?
            .clone();
        let this_value = self.stack[base].clone();
        let method = superclass
            .resolve_method(symbol)
            .ok_or_else(|| VmError::MethodNotFound {
                line,
                name: self.symbol_name(symbol),
            })?;
        let (new_base, total) = self.shift_for_invoke(base, a, argc, this_value);
        self.push_method_frame(&method, new_base, base + a as usize, total, line)
    }

    fn push_method_frame(
        &mut self,
        method: &Rc<Method>,
        new_base: usize,
        return_slot: usize,
        total_args: usize,
        line: u32,
    ) -> VmResult<()> {
        let closure = Rc::new(Closure {
            header: self.objects.alloc_header(ObjType::Closure),
            proto: method.proto.clone(),
            upvalues: method.upvalues.clone(),
        });
        self.push_frame(closure, new_base, return_slot, total_args, line)
    }

    fn collect_args(&self, base: usize, a: u8, argc: u8) -> Vec<Value> {
        let start = base + a as usize + 1;
        self.stack[start..start + argc as usize].to_vec()
    }

    fn symbol_name(&self, symbol: u32) -> String {
        self.symbols
            .borrow()
            .name_of(symbol)
            .unwrap_or("")
            .to_string()
    }

    // --- fields ---

    fn get_instance_field(&self, obj: &Value, name: &str, line: u32) -> VmResult<Value> {
        let inst = obj.as_instance().ok_or(VmError::TypeMismatch {
            line,
            expected: "instance",
            actual: obj.type_name(),
        })?;
        let idx = inst
            .class
            .field_index(name)
            .ok_or_else(|| VmError::UndeclaredField {
                line,
                name: name.to_string(),
            })?;
        Ok(inst.get_field(idx).unwrap_or(Value::null()))
    }

    fn set_instance_field(&self, obj: &Value, name: &str, value: Value, line: u32) -> VmResult<()> {
        let inst = obj.as_instance().ok_or(VmError::TypeMismatch {
            line,
            expected: "instance",
            actual: obj.type_name(),
        })?;
        let idx = inst
            .class
            .field_index(name)
            .ok_or_else(|| VmError::UndeclaredField {
                line,
                name: name.to_string(),
            })?;
        inst.set_field(idx, value).ok();
        Ok(())
    }

    fn table_get(&mut self, obj: &Value, key: &Value, line: u32) -> VmResult<Value> {
        match obj {
            Value::Array(a) => {
                let idx = key.as_int().ok_or(VmError::TypeMismatch {
                    line,
                    expected: "int",
                    actual: key.type_name(),
                })?;
                a.get(idx).ok_or(VmError::OutOfRange {
                    line,
                    index: idx,
                    len: a.len(),
                })
            }
            Value::Map(m) => Ok(m.get(key).unwrap_or(Value::null())),
            other => Err(VmError::TypeMismatch {
                line,
                expected: "array or map",
                actual: other.type_name(),
            }),
        }
    }

    fn table_set(&mut self, obj: &Value, key: Value, value: Value, line: u32) -> VmResult<()> {
        match obj {
            Value::Array(a) => {
                let idx = key.as_int().ok_or(VmError::TypeMismatch {
                    line,
                    expected: "int",
                    actual: key.type_name(),
                })?;
                if idx == a.len() as i64 {
                    a.push(value);
                    Ok(())
                } else {
                    a.set(idx, value).map_err(|_| VmError::OutOfRange {
                        line,
                        index: idx,
                        len: a.len(),
                    })
                }
            }
            Value::Map(m) => {
                m.set(key, value);
                Ok(())
            }
            other => Err(VmError::TypeMismatch {
                line,
                expected: "array or map",
                actual: other.type_name(),
            }),
        }
    }

    // --- upvalues ---

    fn capture_closure_upvalues(
        &mut self,
        child: &Rc<Proto>,
        base: usize,
        frame_idx: usize,
    ) -> Vec<Rc<Upvalue>> {
        let parent = self.frames[frame_idx].closure.clone();
        child
            .upvalues
            .iter()
            .map(|desc| {
                if desc.is_local {
                    self.capture_upvalue(base + desc.index as usize)
                } else {
                    parent.upvalues[desc.index as usize].clone()
                }
            })
            .collect()
    }

    fn capture_upvalue(&mut self, abs_index: usize) -> Rc<Upvalue> {
        if let Some(existing) = self
            .open_upvalues
            .iter()
            .find(|u| u.is_open_at(abs_index))
        {
            return existing.clone();
        }
        let upv = Rc::new(Upvalue::open(abs_index));
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|u| u.stack_index().map_or(true, |i| i < abs_index))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, upv.clone());
        upv
    }

    fn close_upvalues_from(&mut self, threshold: usize) {
        while let Some(front) = self.open_upvalues.first() {
            match front.stack_index() {
                Some(i) if i >= threshold => {
                    let value = self.stack[i].clone();
                    front.close(value);
                    self.open_upvalues.remove(0);
                }
                _ => break,
            }
        }
    }

    fn read_upvalue(&self, up: &Upvalue) -> Value {
        match up.stack_index() {
            Some(i) => self.stack[i].clone(),
            None => up.get_closed().expect("closed upvalue always holds a value"),
        }
    }

    fn write_upvalue(&mut self, up: &Upvalue, value: Value) {
        match up.stack_index() {
            Some(i) => self.stack[i] = value,
            None => up.close(value),
        }
    }

    // --- arithmetic / comparison / stringification ---

    fn arith(&mut self, op: ArithOp, l: Value, r: Value, line: u32) -> VmResult<Value> {
        if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
            let (a, b) = (*a, *b);
            return match op {
                ArithOp::Add => Ok(Value::int(a.wrapping_add(b))),
                ArithOp::Sub => Ok(Value::int(a.wrapping_sub(b))),
                ArithOp::Mul => Ok(Value::int(a.wrapping_mul(b))),
                ArithOp::Div => {
                    if b == 0 {
                        Err(VmError::DivisionByZero { line })
                    } else {
                        Ok(Value::float(a as f64 / b as f64))
                    }
                }
                ArithOp::Mod => {
                    if b == 0 {
                        Err(VmError::DivisionByZero { line })
                    } else {
                        Ok(Value::int(a.wrapping_rem(b)))
                    }
                }
            };
        }
        if l.is_number() && r.is_number() {
            let a = l.as_float().unwrap();
            let b = r.as_float().unwrap();
            return match op {
                ArithOp::Add => Ok(Value::float(a + b)),
                ArithOp::Sub => Ok(Value::float(a - b)),
                ArithOp::Mul => Ok(Value::float(a * b)),
                ArithOp::Div => {
                    if b == 0.0 {
                        Err(VmError::DivisionByZero { line })
                    } else {
                        Ok(Value::float(a / b))
                    }
                }
                ArithOp::Mod => {
                    if b == 0.0 {
                        Err(VmError::DivisionByZero { line })
                    } else {
                        Ok(Value::float(a % b))
                    }
                }
            };
        }
        if op == ArithOp::Add && (matches!(l, Value::String(_)) || matches!(r, Value::String(_))) {
            let text = format!("{}{}", l.display_default(), r.display_default());
            return Ok(Value::string(self.interner.intern(&text)));
        }
        if let Value::Instance(inst) = &l {
            let symbol = match op {
                ArithOp::Add => xr_symbol::SYMBOL_OP_ADD,
                ArithOp::Sub => xr_symbol::SYMBOL_OP_SUB,
                ArithOp::Mul => xr_symbol::SYMBOL_OP_MUL,
                ArithOp::Div => xr_symbol::SYMBOL_OP_DIV,
                ArithOp::Mod => xr_symbol::SYMBOL_OP_MOD,
            };
            if let Some(method) = inst.class.resolve_method(symbol) {
                return self.call_method(&method, l.clone(), vec![r], line);
            }
        }
        Err(VmError::TypeMismatch {
            line,
            expected: "number",
            actual: l.type_name(),
        })
    }

    /// Dispatches `Eq`/`Ne`/`Lt`/`Le`/`Gt`/`Ge` to the right comparison.
    fn eval_condition(&mut self, op: OpCode, l: &Value, r: &Value, line: u32) -> VmResult<bool> {
        match op {
            OpCode::Eq => self.values_equal(l, r, line),
            OpCode::Ne => self.values_equal(l, r, line).map(|b| !b),
            OpCode::Lt => self.compare_ordered(CmpOp::Lt, l, r, line),
            OpCode::Le => self.compare_ordered(CmpOp::Le, l, r, line),
            OpCode::Gt => self.compare_ordered(CmpOp::Gt, l, r, line),
            OpCode::Ge => self.compare_ordered(CmpOp::Ge, l, r, line),
            _ => unreachable!("eval_condition only called for comparison opcodes"),
        }
    }

    fn values_equal(&mut self, l: &Value, r: &Value, line: u32) -> VmResult<bool> {
        if let Value::Instance(inst) = l {
            if let Some(method) = inst.class.resolve_method(xr_symbol::SYMBOL_OP_EQ) {
                let result = self.call_method(&method, l.clone(), vec![r.clone()], line)?;
                return Ok(result.is_truthy());
            }
        }
        Ok(l == r)
    }

    fn compare_ordered(&mut self, cmp: CmpOp, l: &Value, r: &Value, line: u32) -> VmResult<bool> {
        if let (Some(a), Some(b)) = (l.as_int(), r.as_int()) {
            return Ok(match cmp {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
            });
        }
        if l.is_number() && r.is_number() {
            let a = l.as_float().unwrap();
            let b = r.as_float().unwrap();
            return Ok(match cmp {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
            });
        }
        if let Value::Instance(inst) = l {
            let symbol = match cmp {
                CmpOp::Lt => xr_symbol::SYMBOL_OP_LT,
                CmpOp::Le => xr_symbol::SYMBOL_OP_LE,
                CmpOp::Gt => xr_symbol::SYMBOL_OP_GT,
                CmpOp::Ge => xr_symbol::SYMBOL_OP_GE,
            };
            if let Some(method) = inst.class.resolve_method(symbol) {
                let result = self.call_method(&method, l.clone(), vec![r.clone()], line)?;
                return Ok(result.is_truthy());
            }
        }
        Err(VmError::TypeMismatch {
            line,
            expected: "number",
            actual: l.type_name(),
        })
    }

    /// Converts a value to its `print`-facing text, invoking `toString` when
    /// the value is an instance that declares one.
    fn stringify(&mut self, value: &Value, line: u32) -> VmResult<String> {
        if let Value::Instance(inst) = value {
            if let Some(method) = inst.class.resolve_method(xr_symbol::SYMBOL_TO_STRING) {
                let result = self.call_method(&method, value.clone(), Vec::new(), line)?;
                return Ok(match result {
                    Value::String(s) => s.chars.clone(),
                    other => other.display_default(),
                });
            }
        }
        Ok(value.display_default())
    }
}

fn arith_op(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add => ArithOp::Add,
        OpCode::Sub => ArithOp::Sub,
        OpCode::Mul => ArithOp::Mul,
        OpCode::Div => ArithOp::Div,
        OpCode::Mod => ArithOp::Mod,
        _ => unreachable!("arith_op only called for arithmetic opcodes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_vm() -> Vm {
        Vm::new(Rc::new(RefCell::new(SymbolTable::new())), VmConfig::default())
    }

    fn empty_proto(code: Vec<Instruction>, max_stack: u8) -> Rc<Proto> {
        Rc::new(Proto {
            name: None,
            lines: vec![1; code.len()],
            code,
            constants: Vec::new(),
            children: Vec::new(),
            upvalues: Vec::new(),
            num_params: 0,
            is_variadic: false,
            max_stack,
            num_globals: 0,
        })
    }

    #[test]
    fn arithmetic_add_wraps_on_overflow() {
        let mut vm = new_vm();
        let v = vm
            .arith(ArithOp::Add, Value::int(i64::MAX), Value::int(1), 1)
            .unwrap();
        assert_eq!(v, Value::int(i64::MIN));
    }

    #[test]
    fn division_by_zero_errors() {
        let mut vm = new_vm();
        let err = vm.arith(ArithOp::Div, Value::int(1), Value::int(0), 1);
        assert!(matches!(err, Err(VmError::DivisionByZero { .. })));
    }

    #[test]
    fn string_concatenation_via_add() {
        let mut vm = new_vm();
        let a = Value::string(vm.interner.intern("foo"));
        let b = Value::string(vm.interner.intern("bar"));
        let v = vm.arith(ArithOp::Add, a, b, 1).unwrap();
        assert_eq!(v.as_string().unwrap().chars, "foobar");
    }

    #[test]
    fn numeric_comparison() {
        let mut vm = new_vm();
        assert!(vm
            .compare_ordered(CmpOp::Lt, &Value::int(1), &Value::int(2), 1)
            .unwrap());
        assert!(!vm
            .compare_ordered(CmpOp::Gt, &Value::int(1), &Value::int(2), 1)
            .unwrap());
    }

    #[test]
    fn interpret_runs_an_empty_program() {
        let proto = empty_proto(vec![Instruction::abc(OpCode::Return, 0, 0, 0)], 1);
        let mut vm = new_vm();
        assert!(vm.interpret(proto).is_ok());
        assert!(vm.frames.is_empty());
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn interpret_executes_arithmetic_and_print() {
        let code = vec![
            Instruction::asbx(OpCode::LoadI, 0, 40),
            Instruction::asbx(OpCode::LoadI, 1, 2),
            Instruction::abc(OpCode::Add, 2, 0, 1),
            Instruction::abc(OpCode::Print, 2, 0, 0),
            Instruction::abc(OpCode::Return, 0, 0, 0),
        ];
        let proto = empty_proto(code, 3);
        let mut vm = new_vm();
        assert!(vm.interpret(proto).is_ok());
    }

    #[test]
    fn interpret_reports_division_by_zero_with_a_trace() {
        let code = vec![
            Instruction::asbx(OpCode::LoadI, 0, 1),
            Instruction::asbx(OpCode::LoadI, 1, 0),
            Instruction::abc(OpCode::Div, 2, 0, 1),
            Instruction::abc(OpCode::Return, 0, 0, 0),
        ];
        let proto = empty_proto(code, 3);
        let mut vm = new_vm();
        let (err, trace) = vm.interpret(proto).unwrap_err();
        assert!(matches!(err, VmError::DivisionByZero { .. }));
        assert_eq!(trace.len(), 1);
    }

    /// Mirrors what the compiler+fusion pipeline emits for `if (x < 10)`:
    /// `LTI` skips the following `JMP` exactly when the comparison is true,
    /// landing on the true-branch code; otherwise the `JMP` runs and skips
    /// straight to the false branch.
    fn branch_on_lt_10_proto(subject: i32) -> Rc<Proto> {
        let code = vec![
            Instruction::asbx(OpCode::LoadI, 0, subject), // 0: r0 = subject
            Instruction::abc(OpCode::LtI, 0, 0, 10),      // 1: r0 < 10, k=0
            Instruction::sj_instr(OpCode::Jmp, 2),         // 2: taken iff false
            Instruction::asbx(OpCode::LoadI, 1, 111),     // 3: true branch
            Instruction::abc(OpCode::Return, 1, 1, 0),    // 4
            Instruction::asbx(OpCode::LoadI, 1, 222),     // 5: false branch
            Instruction::abc(OpCode::Return, 1, 1, 0),    // 6
        ];
        empty_proto(code, 2)
    }

    #[test]
    fn comparison_true_skips_the_jmp_into_the_true_branch() {
        let mut vm = new_vm();
        vm.interpret(branch_on_lt_10_proto(5)).unwrap();
        assert_eq!(vm.last_value, Value::int(111));
    }

    #[test]
    fn comparison_false_takes_the_jmp_into_the_false_branch() {
        let mut vm = new_vm();
        vm.interpret(branch_on_lt_10_proto(20)).unwrap();
        assert_eq!(vm.last_value, Value::int(222));
    }
}
