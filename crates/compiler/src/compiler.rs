//! Single-pass AST-to-bytecode lowering.
//!
//! Register allocation is co-located with scope management, matching the
//! style of the register-based Lua-family compilers this design follows:
//! `free_reg` marks the next free slot, `n_active_vars` pins the slots
//! already claimed by named locals, and temporaries above that line are
//! freed stack-discipline (LIFO) as soon as they're consumed.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;
use xr_core::opcode::{Instruction, OpCode};
use xr_core::proto::Proto;
use xr_core::value::Value;
use xr_proto::ProtoBuilder;
use xr_symbol::SymbolTable;

use crate::ast::{BinOp, ClassDecl, FunctionDecl, LogicalOp, Node, NodeKind, UnOp};
use crate::error::{CompileError, CompileResult};
use crate::{fusion, peephole};

struct Local {
    name: String,
    register: u8,
    depth: i32,
    is_captured: bool,
    is_const: bool,
}

struct LoopCtx {
    break_jumps: Vec<usize>,
    continue_target: usize,
    scope_depth: i32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
    Method,
    Constructor,
}

struct FnScope {
    builder: ProtoBuilder,
    locals: Vec<Local>,
    scope_depth: i32,
    free_reg: u8,
    n_active_vars: u8,
    loops: Vec<LoopCtx>,
    kind: FnKind,
}

impl FnScope {
    fn new(kind: FnKind, name: Option<Rc<str>>) -> Self {
        let mut builder = ProtoBuilder::new();
        builder.name = name;
        FnScope {
            builder,
            locals: Vec::new(),
            scope_depth: 0,
            free_reg: 0,
            n_active_vars: 0,
            loops: Vec::new(),
            kind,
        }
    }

    fn allocreg(&mut self, line: u32) -> CompileResult<u8> {
        if self.free_reg == u8::MAX {
            return Err(CompileError::TooManyRegisters { line });
        }
        let r = self.free_reg;
        self.free_reg += 1;
        self.builder.bump_max_stack(self.free_reg);
        Ok(r)
    }

    fn freereg(&mut self, r: u8) {
        if self.free_reg > 0 && r == self.free_reg - 1 && r >= self.n_active_vars {
            self.free_reg -= 1;
        }
    }

    fn reservereg(&mut self) {
        self.n_active_vars = self.free_reg;
    }
}

/// Drives compilation of one whole program (root script plus every nested
/// function/method Proto). One `Compiler` is not reused across programs.
pub struct Compiler {
    stack: Vec<FnScope>,
    globals: HashMap<String, u32>,
    const_globals: std::collections::HashSet<String>,
    symbols: Rc<RefCell<SymbolTable>>,
    errors: Vec<CompileError>,
    panic_mode: bool,
}

impl Compiler {
    pub fn new(symbols: Rc<RefCell<SymbolTable>>) -> Self {
        Compiler {
            stack: Vec::new(),
            globals: HashMap::new(),
            const_globals: std::collections::HashSet::new(),
            symbols,
            errors: Vec::new(),
            panic_mode: false,
        }
    }

    pub fn compile_program(mut self, statements: &[Node]) -> Result<Rc<Proto>, Vec<CompileError>> {
        self.stack.push(FnScope::new(FnKind::Script, None));
        for stmt in statements {
            self.compile_stmt(stmt);
        }
        let line = statements.last().map(|s| s.line).unwrap_or(0);
        self.emit(Instruction::abc(OpCode::Return, 0, 0, 0), line);
        let mut scope = self.stack.pop().expect("script scope present");
        scope.builder.num_globals = self.globals.len() as u32;
        let proto = finish_scope(scope);
        if self.errors.is_empty() {
            Ok(proto)
        } else {
            Err(self.errors)
        }
    }

    // --- scope management ---

    fn cur(&mut self) -> &mut FnScope {
        self.stack.last_mut().expect("active function scope")
    }

    fn emit(&mut self, instr: Instruction, line: u32) -> usize {
        self.cur().builder.emit(instr, line)
    }

    fn begin_scope(&mut self) {
        self.cur().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        let scope = self.cur();
        scope.scope_depth -= 1;
        let depth = scope.scope_depth;
        while let Some(local) = scope.locals.last() {
            if local.depth <= depth {
                break;
            }
            let local = scope.locals.pop().unwrap();
            if local.is_captured {
                self.emit(Instruction::abc(OpCode::Close, local.register, 0, 0), line);
            }
            let scope = self.cur();
            scope.freereg(local.register);
        }
    }

    // --- variable declaration & resolution ---

    fn declare_local(&mut self, name: String, is_const: bool, line: u32) -> CompileResult<u8> {
        let depth = self.cur().scope_depth;
        if self
            .cur()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == depth)
            .any(|l| l.name == name)
        {
            return Err(CompileError::TooManyLocals { line });
        }
        let reg = self.cur().allocreg(line)?;
        self.cur().reservereg();
        if self.cur().locals.len() >= 255 {
            return Err(CompileError::TooManyLocals { line });
        }
        self.cur().locals.push(Local {
            name,
            register: reg,
            depth,
            is_captured: false,
            is_const,
        });
        Ok(reg)
    }

    fn resolve_local(&self, level: usize, name: &str) -> Option<(u8, bool)> {
        self.stack[level]
            .locals
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| (l.register, l.is_const))
    }

    /// Walks outward from `level` looking for `name` as a local, marking it
    /// captured and threading upvalue descriptors down through every
    /// intermediate function scope.
    fn resolve_upvalue(&mut self, level: usize, name: &str) -> CompileResult<Option<u8>> {
        if level == 0 {
            return Ok(None);
        }
        let parent = level - 1;
        if let Some((reg, _)) = self.resolve_local(parent, name) {
            self.stack[parent]
                .locals
                .iter_mut()
                .rev()
                .find(|l| l.register == reg)
                .unwrap()
                .is_captured = true;
            let line = 0;
            let idx = self.stack[level].builder.add_upvalue(reg, true);
            if self.stack[level].builder.num_upvalues() > 255 {
                return Err(CompileError::TooManyUpvalues { line });
            }
            return Ok(Some(idx));
        }
        if let Some(parent_upvalue) = self.resolve_upvalue(parent, name)? {
            let idx = self.stack[level]
                .builder
                .add_upvalue(parent_upvalue, false);
            return Ok(Some(idx));
        }
        Ok(None)
    }

    fn get_or_add_global(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.globals.get(name) {
            return idx;
        }
        let idx = self.globals.len() as u32;
        self.globals.insert(name.to_string(), idx);
        idx
    }

    // --- error reporting ---

    fn error(&mut self, err: CompileError) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(err);
    }

    // --- statements ---

    fn compile_stmt(&mut self, node: &Node) {
        match &node.kind {
            NodeKind::Program(stmts) | NodeKind::Block(stmts) => {
                self.begin_scope();
                for s in stmts {
                    self.compile_stmt(s);
                }
                self.end_scope(node.line);
            }
            NodeKind::ExprStmt(expr) => {
                if let Ok(r) = self.compile_expr(expr) {
                    self.cur().freereg(r);
                }
            }
            NodeKind::Print(expr) => {
                if let Ok(r) = self.compile_expr(expr) {
                    self.emit(Instruction::abc(OpCode::Print, r, 0, 0), node.line);
                    self.cur().freereg(r);
                }
            }
            NodeKind::VarDecl {
                name,
                init,
                is_const,
            } => self.compile_var_decl(name, init.as_deref(), *is_const, node.line),
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.compile_if(cond, then_branch, else_branch.as_deref(), node.line),
            NodeKind::While { cond, body } => self.compile_while(cond, body, node.line),
            NodeKind::For {
                init,
                cond,
                update,
                body,
            } => self.compile_for(
                init.as_deref(),
                cond.as_deref(),
                update.as_deref(),
                body,
                node.line,
            ),
            NodeKind::Break => self.compile_break(node.line),
            NodeKind::Continue => self.compile_continue(node.line),
            NodeKind::Return(value) => self.compile_return(value.as_deref(), node.line),
            NodeKind::FunctionDecl(decl) => self.compile_function_decl(decl),
            NodeKind::ClassDecl(decl) => self.compile_class_decl(decl, node.line),
            _ => self.error(CompileError::UnsupportedExpression {
                line: node.line,
                kind: "statement",
            }),
        }
    }

    fn compile_var_decl(&mut self, name: &str, init: Option<&Node>, is_const: bool, line: u32) {
        let reg = match init {
            Some(expr) => self.compile_expr(expr),
            None => {
                let r = self.cur().allocreg(line);
                if let Ok(r) = r {
                    self.emit(Instruction::abc(OpCode::LoadNil, r, 0, 0), line);
                }
                r
            }
        };
        let value_reg = match reg {
            Ok(r) => r,
            Err(e) => {
                self.error(e);
                return;
            }
        };
        if self.cur().scope_depth == 0 {
            // Top-level declarations are globals.
            let idx = self.get_or_add_global(name);
            if is_const {
                self.const_globals.insert(name.to_string());
            }
            self.emit(
                Instruction::abx(OpCode::DefGlobal, value_reg, idx as u16),
                line,
            );
            self.cur().freereg(value_reg);
        } else {
            // The register already holds the local's value; declare_local
            // pins it in place rather than moving it, matching the
            // allocate-then-reserve discipline.
            if let Err(e) = self.bind_local_to_existing_register(name, value_reg, is_const, line) {
                self.error(e);
            }
        }
    }

    /// Declares a local whose value is already sitting in `reg` (the normal
    /// case when the initializer expression's result register happens to be
    /// the next free one).
    fn bind_local_to_existing_register(
        &mut self,
        name: &str,
        reg: u8,
        is_const: bool,
        line: u32,
    ) -> CompileResult<()> {
        let scope = self.cur();
        if reg != scope.free_reg - 1 {
            // Initializer didn't land in the top-of-stack register (e.g. a
            // bare variable reference); move it there.
            let dst = scope.allocreg(line)?;
            self.emit(Instruction::abc(OpCode::Move, dst, reg, 0), line);
            self.cur().reservereg();
            let depth = self.cur().scope_depth;
            self.cur().locals.push(Local {
                name: name.to_string(),
                register: dst,
                depth,
                is_captured: false,
                is_const,
            });
            return Ok(());
        }
        self.cur().reservereg();
        let depth = self.cur().scope_depth;
        self.cur().locals.push(Local {
            name: name.to_string(),
            register: reg,
            depth,
            is_captured: false,
            is_const,
        });
        Ok(())
    }

    /// Emits a comparison/condition followed by a placeholder jump taken
    /// when the condition is false. Returns the jump's pc for patching.
    /// Every comparison-shaped opcode (`Test`, `Eq`, `Ne`, `Lt`, `Le`, `Gt`,
    /// `Ge`) shares one convention: it computes a boolean `cond`, and the
    /// `Jmp` immediately following it executes iff `cond == (k != 0)` —
    /// otherwise it is skipped and control falls into the next instruction.
    /// Every branch site in this compiler wants "skip the jump (fall into
    /// the then-block/loop-body) when the condition is true, take the jump
    /// (to the else-block/loop-exit) when false", which is `k = 0`; every
    /// caller of this family emits `C = 0` accordingly.
    fn emit_branch_if_false(&mut self, cond: &Node) -> CompileResult<usize> {
        if let Some(pc) = self.try_emit_specialized_condition(cond)? {
            return Ok(pc);
        }
        let r = self.compile_expr(cond)?;
        self.emit(Instruction::abc(OpCode::Test, r, 0, 0), cond.line);
        self.cur().freereg(r);
        let jmp_pc = self.emit(Instruction::sj_instr(OpCode::Jmp, 0), cond.line);
        Ok(jmp_pc)
    }

    /// When `cond` is directly a comparison expression, emits just the
    /// comparison + jump instead of materializing a boolean first.
    fn try_emit_specialized_condition(&mut self, cond: &Node) -> CompileResult<Option<usize>> {
        let NodeKind::Binary { op, left, right } = &cond.kind else {
            return Ok(None);
        };
        let opcode = match op {
            BinOp::Eq => OpCode::Eq,
            BinOp::Ne => OpCode::Ne,
            BinOp::Lt => OpCode::Lt,
            BinOp::Le => OpCode::Le,
            BinOp::Gt => OpCode::Gt,
            BinOp::Ge => OpCode::Ge,
            _ => return Ok(None),
        };
        let lr = self.compile_expr(left)?;
        let rr = self.compile_expr(right)?;
        self.emit(Instruction::abc(opcode, lr, rr, 0), cond.line);
        self.cur().freereg(rr);
        self.cur().freereg(lr);
        let jmp_pc = self.emit(Instruction::sj_instr(OpCode::Jmp, 0), cond.line);
        Ok(Some(jmp_pc))
    }

    fn patch_jump_to_here(&mut self, jmp_pc: usize) {
        let here = self.cur().builder.current_pc();
        let offset = here as i32 - jmp_pc as i32 - 1;
        self.cur()
            .builder
            .patch(jmp_pc, Instruction::sj_instr(OpCode::Jmp, offset));
    }

    fn emit_jump_to(&mut self, target: usize, line: u32) -> usize {
        let here = self.cur().builder.current_pc();
        let offset = target as i32 - here as i32 - 1;
        self.emit(Instruction::sj_instr(OpCode::Jmp, offset), line)
    }

    fn compile_if(&mut self, cond: &Node, then_b: &Node, else_b: Option<&Node>, line: u32) {
        let else_jmp = match self.emit_branch_if_false(cond) {
            Ok(pc) => pc,
            Err(e) => {
                self.error(e);
                return;
            }
        };
        self.compile_stmt(then_b);
        let end_jmp = self.emit_jump_to(usize::MAX, line);
        self.patch_jump_to_here(else_jmp);
        if let Some(else_b) = else_b {
            self.compile_stmt(else_b);
        }
        self.patch_jump_to_here(end_jmp);
    }

    fn compile_while(&mut self, cond: &Node, body: &Node, line: u32) {
        let loop_start = self.cur().builder.current_pc();
        let exit_jmp = match self.emit_branch_if_false(cond) {
            Ok(pc) => pc,
            Err(e) => {
                self.error(e);
                return;
            }
        };
        self.cur().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_target: loop_start,
            scope_depth: self.cur().scope_depth,
        });
        self.compile_stmt(body);
        self.emit_jump_to(loop_start, line);
        self.patch_jump_to_here(exit_jmp);
        let loop_ctx = self.cur().loops.pop().expect("loop ctx pushed above");
        for break_pc in loop_ctx.break_jumps {
            self.patch_jump_to_here(break_pc);
        }
    }

    fn compile_for(
        &mut self,
        init: Option<&Node>,
        cond: Option<&Node>,
        update: Option<&Node>,
        body: &Node,
        line: u32,
    ) {
        self.begin_scope();
        if let Some(init) = init {
            self.compile_stmt(init);
        }
        let loop_start = self.cur().builder.current_pc();
        let exit_jmp = cond.and_then(|c| self.emit_branch_if_false(c).ok());
        self.cur().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_target: loop_start, // overwritten below once known
            scope_depth: self.cur().scope_depth,
        });
        self.compile_stmt(body);
        let continue_target = self.cur().builder.current_pc();
        if let Some(update) = update {
            if let Ok(r) = self.compile_expr(update) {
                self.cur().freereg(r);
            }
        }
        self.emit_jump_to(loop_start, line);
        if let Some(exit_jmp) = exit_jmp {
            self.patch_jump_to_here(exit_jmp);
        }
        let loop_ctx = self.cur().loops.pop().expect("loop ctx pushed above");
        for break_pc in loop_ctx.break_jumps {
            self.patch_jump_to_here(break_pc);
        }
        let _ = continue_target;
        self.end_scope(line);
    }

    fn compile_break(&mut self, line: u32) {
        if self.cur().loops.is_empty() {
            self.error(CompileError::BreakOutsideLoop { line });
            return;
        }
        let pc = self.emit_jump_to(usize::MAX, line);
        self.cur().loops.last_mut().unwrap().break_jumps.push(pc);
    }

    fn compile_continue(&mut self, line: u32) {
        if self.cur().loops.is_empty() {
            self.error(CompileError::ContinueOutsideLoop { line });
            return;
        }
        let target = self.cur().loops.last().unwrap().continue_target;
        self.emit_jump_to(target, line);
    }

    fn compile_return(&mut self, value: Option<&Node>, line: u32) {
        if self.cur().kind == FnKind::Script {
            self.error(CompileError::ReturnFromTopLevel { line });
            return;
        }
        // return f(...) lowers to a tail call.
        if let Some(Node {
            kind: NodeKind::Call { callee, args },
            ..
        }) = value
        {
            if let Ok(Some((base, n))) = self.try_compile_call_args(callee, args, line) {
                self.emit(Instruction::abc(OpCode::TailCall, base, n + 1, 0), line);
                return;
            }
        }
        match value {
            Some(expr) => {
                if let Ok(r) = self.compile_expr(expr) {
                    self.emit(Instruction::abc(OpCode::Return, r, 1, 0), line);
                }
            }
            None => {
                self.emit(Instruction::abc(OpCode::Return, 0, 0, 0), line);
            }
        }
    }

    fn try_compile_call_args(
        &mut self,
        callee: &Node,
        args: &[Node],
        line: u32,
    ) -> CompileResult<Option<(u8, u8)>> {
        let callee_reg = self.compile_to_fresh_reg(callee, line)?;
        for arg in args {
            self.compile_to_fresh_reg(arg, line)?;
        }
        Ok(Some((callee_reg, args.len() as u8)))
    }

    fn compile_function_decl(&mut self, decl: &FunctionDecl) {
        let top_level = self.cur().scope_depth == 0;
        let name = decl.name.clone();
        let proto = match self.compile_function_body(decl, FnKind::Function) {
            Ok(p) => p,
            Err(e) => {
                self.error(e);
                return;
            }
        };
        let line = decl.line;
        let proto_idx = self.cur().builder.add_child(proto);
        let Ok(dst) = self.cur().allocreg(line) else {
            return;
        };
        self.emit(Instruction::abx(OpCode::Closure, dst, proto_idx), line);
        match name {
            Some(name) if top_level => {
                let idx = self.get_or_add_global(&name);
                self.emit(Instruction::abx(OpCode::DefGlobal, dst, idx as u16), line);
                self.cur().freereg(dst);
            }
            Some(name) => {
                if let Err(e) = self.bind_local_to_existing_register(&name, dst, false, line) {
                    self.error(e);
                }
            }
            None => {}
        }
    }

    /// Compiles a nested function body into its own Proto. `self_reg_name`,
    /// when set (methods), reserves register 0 for the implicit receiver.
    fn compile_function_body(
        &mut self,
        decl: &FunctionDecl,
        kind: FnKind,
    ) -> CompileResult<Rc<Proto>> {
        self.stack
            .push(FnScope::new(kind, decl.name.as_deref().map(Rc::from)));
        if matches!(kind, FnKind::Method | FnKind::Constructor) {
            self.declare_local("this".to_string(), true, decl.line)?;
        }
        for param in &decl.params {
            self.declare_local(param.clone(), false, decl.line)?;
        }
        self.begin_scope();
        for stmt in &decl.body {
            self.compile_stmt(stmt);
        }
        self.end_scope(decl.line);
        if kind == FnKind::Constructor {
            // Constructors always return `this` (register 0), regardless of
            // any explicit return already compiled above.
            self.emit(Instruction::abc(OpCode::Return, 0, 1, 0), decl.line);
        } else {
            self.emit(Instruction::abc(OpCode::Return, 0, 0, 0), decl.line);
        }
        let mut scope = self.stack.pop().expect("function scope present");
        scope.builder.num_params = decl.params.len() as u8
            + matches!(kind, FnKind::Method | FnKind::Constructor) as u8;
        Ok(finish_scope(scope))
    }

    fn compile_class_decl(&mut self, decl: &ClassDecl, line: u32) {
        let name_const = self
            .cur()
            .builder
            .add_constant(Value::string(interned(&decl.name)));
        let Ok(class_reg) = self.cur().allocreg(line) else {
            return;
        };
        self.emit(
            Instruction::abx(OpCode::Class, class_reg, name_const),
            line,
        );
        for field in &decl.fields {
            let name_c = self
                .cur()
                .builder
                .add_constant(Value::string(interned(&field.name)));
            let type_c = match &field.type_name {
                Some(t) => self.cur().builder.add_constant(Value::string(interned(t))),
                None => 0,
            };
            self.emit(
                Instruction::abc(OpCode::AddField, class_reg, name_c as u8, type_c as u8),
                line,
            );
        }
        let mut super_scope_opened = false;
        if let Some(super_name) = &decl.superclass {
            let super_idx = self.get_or_add_global(super_name);
            let Ok(super_val_reg) = self.cur().allocreg(line) else {
                return;
            };
            self.emit(
                Instruction::abx(OpCode::GetGlobal, super_val_reg, super_idx as u16),
                line,
            );
            self.emit(
                Instruction::abc(OpCode::Inherit, class_reg, super_val_reg, 0),
                line,
            );
            self.begin_scope();
            if let Err(e) =
                self.bind_local_to_existing_register("super", super_val_reg, true, line)
            {
                self.error(e);
            }
            super_scope_opened = true;
        }
        for method in &decl.methods {
            self.compile_method(class_reg, method);
        }
        if super_scope_opened {
            self.end_scope(line);
        }
        if self.cur().scope_depth == 0 {
            let idx = self.get_or_add_global(&decl.name);
            self.emit(
                Instruction::abx(OpCode::DefGlobal, class_reg, idx as u16),
                line,
            );
            self.cur().freereg(class_reg);
        } else if let Err(e) = self.bind_local_to_existing_register(&decl.name, class_reg, true, line)
        {
            self.error(e);
        }
    }

    fn compile_method(&mut self, class_reg: u8, method: &crate::ast::MethodDecl) {
        let kind = if method.name == "constructor" {
            FnKind::Constructor
        } else {
            FnKind::Method
        };
        let decl = FunctionDecl {
            name: Some(method.name.clone()),
            params: method.params.clone(),
            body: method.body.clone(),
            line: method.line,
        };
        let proto = match self.compile_function_body(&decl, kind) {
            Ok(p) => p,
            Err(e) => {
                self.error(e);
                return;
            }
        };
        let proto_idx = self.cur().builder.add_child(proto);
        let Ok(meth_reg) = self.cur().allocreg(method.line) else {
            return;
        };
        self.emit(
            Instruction::abx(OpCode::Closure, meth_reg, proto_idx),
            method.line,
        );
        let symbol = self.symbols.borrow_mut().get_or_create(&method.name);
        self.emit(
            Instruction::abc(OpCode::Method, class_reg, symbol as u8, meth_reg),
            method.line,
        );
        self.cur().freereg(meth_reg);
    }

    // --- expressions ---

    fn compile_expr(&mut self, node: &Node) -> CompileResult<u8> {
        match &node.kind {
            NodeKind::IntLiteral(i) => self.load_int(*i, node.line),
            NodeKind::FloatLiteral(f) => self.load_float(*f, node.line),
            NodeKind::BoolLiteral(b) => {
                let r = self.cur().allocreg(node.line)?;
                let op = if *b { OpCode::LoadTrue } else { OpCode::LoadFalse };
                self.emit(Instruction::abc(op, r, 0, 0), node.line);
                Ok(r)
            }
            NodeKind::NullLiteral => {
                let r = self.cur().allocreg(node.line)?;
                self.emit(Instruction::abc(OpCode::LoadNil, r, 0, 0), node.line);
                Ok(r)
            }
            NodeKind::StringLiteral(s) => {
                let r = self.cur().allocreg(node.line)?;
                let k = self.cur().builder.add_constant(Value::string(interned(s)));
                self.emit(Instruction::abx(OpCode::LoadK, r, k), node.line);
                Ok(r)
            }
            NodeKind::TemplateString(parts) => self.compile_template_string(parts, node.line),
            NodeKind::Grouping(inner) => self.compile_expr(inner),
            NodeKind::Variable(name) => self.compile_variable_read(name, node.line),
            NodeKind::Assign { name, value } => self.compile_assign(name, value, node.line),
            NodeKind::Unary { op, operand } => self.compile_unary(*op, operand, node.line),
            NodeKind::Binary { op, left, right } => {
                self.compile_binary(*op, left, right, node.line)
            }
            NodeKind::Logical { op, left, right } => {
                self.compile_logical(*op, left, right, node.line)
            }
            NodeKind::Call { callee, args } => self.compile_call(callee, args, node.line),
            NodeKind::ArrayLiteral(items) => self.compile_array_literal(items, node.line),
            NodeKind::MapLiteral(entries) => self.compile_map_literal(entries, node.line),
            NodeKind::IndexGet { object, index } => self.compile_index_get(object, index, node.line),
            NodeKind::IndexSet {
                object,
                index,
                value,
            } => self.compile_index_set(object, index, value, node.line),
            NodeKind::Member { object, name } => self.compile_member_get(object, name, node.line),
            NodeKind::MemberSet {
                object,
                name,
                value,
            } => self.compile_member_set(object, name, value, node.line),
            NodeKind::This => self.compile_variable_read("this", node.line),
            NodeKind::New { class_name, args } => self.compile_new(class_name, args, node.line),
            NodeKind::SuperCall { method, args } => self.compile_super_call(method, args, node.line),
            NodeKind::FunctionExpr(decl) => self.compile_function_expr(decl),
            _ => Err(CompileError::UnsupportedExpression {
                line: node.line,
                kind: "expression",
            }),
        }
    }

    fn load_int(&mut self, i: i64, line: u32) -> CompileResult<u8> {
        let r = self.cur().allocreg(line)?;
        if (-32768..=32767).contains(&i) {
            self.emit(Instruction::asbx(OpCode::LoadI, r, i as i32), line);
        } else {
            let k = self.cur().builder.add_constant(Value::int(i));
            self.emit(Instruction::abx(OpCode::LoadK, r, k), line);
        }
        Ok(r)
    }

    fn load_float(&mut self, f: f64, line: u32) -> CompileResult<u8> {
        let r = self.cur().allocreg(line)?;
        let k = self.cur().builder.add_constant(Value::float(f));
        self.emit(Instruction::abx(OpCode::LoadF, r, k), line);
        Ok(r)
    }

    fn compile_template_string(&mut self, parts: &[Node], line: u32) -> CompileResult<u8> {
        // Lowers to a left fold of string concatenation; there is no
        // dedicated CONCAT opcode, so this reuses ADD on string operands,
        // which the VM treats as concatenation when either side is a
        // string (see xr-vm's arithmetic dispatch).
        let mut acc = self.load_int(0, line)?;
        self.cur().freereg(acc);
        let mut first = true;
        for part in parts {
            let r = self.compile_expr(part)?;
            if first {
                acc = r;
                first = false;
            } else {
                let dst = self.cur().allocreg(line)?;
                self.emit(Instruction::abc(OpCode::Add, dst, acc, r), line);
                self.cur().freereg(r);
                self.cur().freereg(acc);
                acc = dst;
            }
        }
        Ok(acc)
    }

    fn compile_variable_read(&mut self, name: &str, line: u32) -> CompileResult<u8> {
        let level = self.stack.len() - 1;
        if let Some((reg, _)) = self.resolve_local(level, name) {
            return Ok(reg);
        }
        if let Some(up) = self.resolve_upvalue(level, name)? {
            let r = self.cur().allocreg(line)?;
            self.emit(Instruction::abc(OpCode::GetUpval, r, up, 0), line);
            return Ok(r);
        }
        let idx = self.get_or_add_global(name);
        let r = self.cur().allocreg(line)?;
        self.emit(Instruction::abx(OpCode::GetGlobal, r, idx as u16), line);
        Ok(r)
    }

    fn compile_assign(&mut self, name: &str, value: &Node, line: u32) -> CompileResult<u8> {
        let level = self.stack.len() - 1;
        if let Some((reg, is_const)) = self.resolve_local(level, name) {
            if is_const {
                return Err(CompileError::AssignToConst {
                    line,
                    name: name.to_string(),
                });
            }
            let vr = self.compile_expr(value)?;
            self.emit(Instruction::abc(OpCode::Move, reg, vr, 0), line);
            self.cur().freereg(vr);
            return Ok(reg);
        }
        if let Some(up) = self.resolve_upvalue(level, name)? {
            let vr = self.compile_expr(value)?;
            self.emit(Instruction::abc(OpCode::SetUpval, vr, up, 0), line);
            return Ok(vr);
        }
        if self.const_globals.contains(name) {
            return Err(CompileError::AssignToConst {
                line,
                name: name.to_string(),
            });
        }
        let idx = self.get_or_add_global(name);
        let vr = self.compile_expr(value)?;
        self.emit(Instruction::abx(OpCode::SetGlobal, vr, idx as u16), line);
        Ok(vr)
    }

    /// Compiles `node`, guaranteeing the result lands in the next free
    /// register (copying it there with a `Move` if `compile_expr` handed
    /// back some other, already-live register, e.g. a bare local read).
    /// Needed wherever several values must end up contiguous — call/invoke
    /// arguments and array-literal elements.
    fn compile_to_fresh_reg(&mut self, node: &Node, line: u32) -> CompileResult<u8> {
        let expected = self.cur().free_reg;
        let r = self.compile_expr(node)?;
        if r == expected {
            self.cur().reservereg();
            return Ok(r);
        }
        let dst = self.cur().allocreg(line)?;
        self.emit(Instruction::abc(OpCode::Move, dst, r, 0), line);
        self.cur().reservereg();
        Ok(dst)
    }

    fn compile_unary(&mut self, op: UnOp, operand: &Node, line: u32) -> CompileResult<u8> {
        if let UnOp::Neg = op {
            if let NodeKind::IntLiteral(i) = operand.kind {
                return self.load_int(-i, line);
            }
            if let NodeKind::FloatLiteral(f) = operand.kind {
                return self.load_float(-f, line);
            }
        }
        let r = self.compile_expr(operand)?;
        let dst = self.cur().allocreg(line)?;
        let opcode = match op {
            UnOp::Neg => OpCode::Unm,
            UnOp::Not => OpCode::Not,
        };
        self.emit(Instruction::abc(opcode, dst, r, 0), line);
        self.cur().freereg(r);
        Ok(dst)
    }

    fn compile_binary(&mut self, op: BinOp, left: &Node, right: &Node, line: u32) -> CompileResult<u8> {
        // Constant folding: both literal operands fold at compile time.
        if let Some(folded) = fold_constants(op, left, right) {
            return self.emit_constant(folded, line);
        }
        let is_comparison = matches!(
            op,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        );
        if is_comparison {
            return self.compile_comparison_value(op, left, right, line);
        }
        let lr = self.compile_expr(left)?;
        let rr = self.compile_expr(right)?;
        let dst = self.cur().allocreg(line)?;
        let opcode = match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::Mod => OpCode::Mod,
            _ => unreachable!("comparisons handled above"),
        };
        self.emit(Instruction::abc(opcode, dst, lr, rr), line);
        self.cur().freereg(rr);
        self.cur().freereg(lr);
        Ok(dst)
    }

    fn emit_constant(&mut self, value: Value, line: u32) -> CompileResult<u8> {
        match value {
            Value::Int(i) => self.load_int(i, line),
            Value::Float(f) => self.load_float(f, line),
            Value::Bool(b) => {
                let r = self.cur().allocreg(line)?;
                let op = if b { OpCode::LoadTrue } else { OpCode::LoadFalse };
                self.emit(Instruction::abc(op, r, 0, 0), line);
                Ok(r)
            }
            _ => {
                let r = self.cur().allocreg(line)?;
                let k = self.cur().builder.add_constant(value);
                self.emit(Instruction::abx(OpCode::LoadK, r, k), line);
                Ok(r)
            }
        }
    }

    /// Materializes a comparison's boolean result into a register (used
    /// when the comparison appears as a plain expression, not a condition).
    fn compile_comparison_value(
        &mut self,
        op: BinOp,
        left: &Node,
        right: &Node,
        line: u32,
    ) -> CompileResult<u8> {
        let opcode = match op {
            BinOp::Eq => OpCode::Eq,
            BinOp::Ne => OpCode::Ne,
            BinOp::Lt => OpCode::Lt,
            BinOp::Le => OpCode::Le,
            BinOp::Gt => OpCode::Gt,
            BinOp::Ge => OpCode::Ge,
            _ => unreachable!(),
        };
        let lr = self.compile_expr(left)?;
        let rr = self.compile_expr(right)?;
        // C = 0: the following Jmp executes iff the comparison is false,
        // landing on the LoadFalse branch below.
        self.emit(Instruction::abc(opcode, lr, rr, 0), line);
        self.cur().freereg(rr);
        self.cur().freereg(lr);
        let false_jmp = self.emit(Instruction::sj_instr(OpCode::Jmp, 0), line);
        let dst = self.cur().allocreg(line)?;
        self.emit(Instruction::abc(OpCode::LoadTrue, dst, 0, 0), line);
        let end_jmp = self.emit_jump_to(usize::MAX, line);
        self.patch_jump_to_here(false_jmp);
        self.emit(Instruction::abc(OpCode::LoadFalse, dst, 0, 0), line);
        self.patch_jump_to_here(end_jmp);
        Ok(dst)
    }

    fn compile_logical(&mut self, op: LogicalOp, left: &Node, right: &Node, line: u32) -> CompileResult<u8> {
        let r = self.compile_expr(left)?;
        // TestSet A B C: if truthy(R(B)) == (C != 0) then R(A) := R(B) and
        // the following Jmp executes (short-circuit, RHS never runs);
        // otherwise the Jmp is skipped and RHS is computed into R(A).
        // `&&` short-circuits (keeps the left value) when left is falsy;
        // `||` short-circuits when left is truthy.
        let k = match op {
            LogicalOp::And => 0,
            LogicalOp::Or => 1,
        };
        self.emit(Instruction::abc(OpCode::TestSet, r, r, k), line);
        let skip_jmp = self.emit(Instruction::sj_instr(OpCode::Jmp, 0), line);
        let rhs = self.compile_expr(right)?;
        self.emit(Instruction::abc(OpCode::Move, r, rhs, 0), line);
        self.cur().freereg(rhs);
        self.patch_jump_to_here(skip_jmp);
        Ok(r)
    }

    fn compile_call(&mut self, callee: &Node, args: &[Node], line: u32) -> CompileResult<u8> {
        // obj.method(args) compiles to INVOKE rather than a plain CALL.
        if let NodeKind::Member { object, name } = &callee.kind {
            let saved_active = self.cur().n_active_vars;
            let obj_reg = self.compile_to_fresh_reg(object, line)?;
            for arg in args {
                self.compile_to_fresh_reg(arg, line)?;
            }
            let symbol = self.symbols.borrow_mut().get_or_create(name);
            self.emit(
                Instruction::abc(OpCode::Invoke, obj_reg, symbol as u8, args.len() as u8),
                line,
            );
            let scope = self.cur();
            scope.n_active_vars = saved_active;
            scope.free_reg = obj_reg + 1;
            return Ok(obj_reg);
        }
        let saved_active = self.cur().n_active_vars;
        let callee_reg = self.compile_to_fresh_reg(callee, line)?;
        for arg in args {
            self.compile_to_fresh_reg(arg, line)?;
        }
        self.emit(
            Instruction::abc(OpCode::Call, callee_reg, args.len() as u8, 1),
            line,
        );
        let scope = self.cur();
        scope.n_active_vars = saved_active;
        scope.free_reg = callee_reg + 1;
        Ok(callee_reg)
    }

    fn compile_new(&mut self, class_name: &str, args: &[Node], line: u32) -> CompileResult<u8> {
        let saved_active = self.cur().n_active_vars;
        let class_reg = self.cur().allocreg(line)?;
        self.compile_variable_read_into(class_name, class_reg, line)?;
        self.cur().reservereg();
        for arg in args {
            self.compile_to_fresh_reg(arg, line)?;
        }
        let symbol = xr_symbol::SYMBOL_CONSTRUCTOR;
        self.emit(
            Instruction::abc(OpCode::Invoke, class_reg, symbol as u8, args.len() as u8),
            line,
        );
        let scope = self.cur();
        scope.n_active_vars = saved_active;
        scope.free_reg = class_reg + 1;
        Ok(class_reg)
    }

    fn compile_super_call(&mut self, method: &str, args: &[Node], line: u32) -> CompileResult<u8> {
        let saved_active = self.cur().n_active_vars;
        let super_reg = self.cur().allocreg(line)?;
        self.compile_variable_read_into("super", super_reg, line)?;
        self.cur().reservereg();
        for arg in args {
            self.compile_to_fresh_reg(arg, line)?;
        }
        let symbol = self.symbols.borrow_mut().get_or_create(method);
        self.emit(
            Instruction::abc(OpCode::SuperInvoke, super_reg, symbol as u8, args.len() as u8),
            line,
        );
        let scope = self.cur();
        scope.n_active_vars = saved_active;
        scope.free_reg = super_reg + 1;
        Ok(super_reg)
    }

    /// Reads `name` (local/upvalue/global) and copies it into the
    /// already-allocated register `dst`, used when the caller needs the
    /// value at a specific contiguous slot rather than wherever
    /// [`Compiler::compile_variable_read`] would naturally place it.
    fn compile_variable_read_into(&mut self, name: &str, dst: u8, line: u32) -> CompileResult<()> {
        let level = self.stack.len() - 1;
        if let Some((reg, _)) = self.resolve_local(level, name) {
            if reg != dst {
                self.emit(Instruction::abc(OpCode::Move, dst, reg, 0), line);
            }
            return Ok(());
        }
        if let Some(up) = self.resolve_upvalue(level, name)? {
            self.emit(Instruction::abc(OpCode::GetUpval, dst, up, 0), line);
            return Ok(());
        }
        let idx = self.get_or_add_global(name);
        self.emit(Instruction::abx(OpCode::GetGlobal, dst, idx as u16), line);
        Ok(())
    }

    fn compile_function_expr(&mut self, decl: &FunctionDecl) -> CompileResult<u8> {
        let proto = self.compile_function_body(decl, FnKind::Function)?;
        let idx = self.cur().builder.add_child(proto);
        let r = self.cur().allocreg(decl.line)?;
        self.emit(Instruction::abx(OpCode::Closure, r, idx), decl.line);
        Ok(r)
    }

    fn compile_array_literal(&mut self, items: &[Node], line: u32) -> CompileResult<u8> {
        let dst = self.cur().allocreg(line)?;
        self.emit(
            Instruction::abc(OpCode::NewTable, dst, items.len() as u8, 0),
            line,
        );
        let saved_active = self.cur().n_active_vars;
        self.cur().reservereg();
        for item in items {
            self.compile_to_fresh_reg(item, line)?;
        }
        if !items.is_empty() {
            self.emit(
                Instruction::abc(OpCode::SetList, dst, items.len() as u8, 0),
                line,
            );
        }
        let scope = self.cur();
        scope.n_active_vars = saved_active;
        scope.free_reg = dst + 1;
        Ok(dst)
    }

    fn compile_map_literal(&mut self, entries: &[(Node, Node)], line: u32) -> CompileResult<u8> {
        let dst = self.cur().allocreg(line)?;
        // C = 1 marks this NEWTABLE as a map; B carries the entry-count hint.
        // Disambiguates from an empty array literal, which would otherwise
        // also emit `NewTable dst, 0, 0`.
        self.emit(
            Instruction::abc(OpCode::NewTable, dst, entries.len() as u8, 1),
            line,
        );
        for (k, v) in entries {
            let kr = self.compile_expr(k)?;
            let vr = self.compile_expr(v)?;
            self.emit(Instruction::abc(OpCode::SetTable, dst, kr, vr), line);
            self.cur().freereg(vr);
            self.cur().freereg(kr);
        }
        Ok(dst)
    }

    fn compile_index_get(&mut self, object: &Node, index: &Node, line: u32) -> CompileResult<u8> {
        let obj = self.compile_expr(object)?;
        let idx = self.compile_expr(index)?;
        let dst = self.cur().allocreg(line)?;
        self.emit(Instruction::abc(OpCode::GetTable, dst, obj, idx), line);
        self.cur().freereg(idx);
        self.cur().freereg(obj);
        Ok(dst)
    }

    fn compile_index_set(
        &mut self,
        object: &Node,
        index: &Node,
        value: &Node,
        line: u32,
    ) -> CompileResult<u8> {
        let obj = self.compile_expr(object)?;
        let idx = self.compile_expr(index)?;
        let val = self.compile_expr(value)?;
        self.emit(Instruction::abc(OpCode::SetTable, obj, idx, val), line);
        self.cur().freereg(val);
        self.cur().freereg(idx);
        Ok(obj)
    }

    fn compile_member_get(&mut self, object: &Node, name: &str, line: u32) -> CompileResult<u8> {
        let obj = self.compile_expr(object)?;
        let name_c = self.cur().builder.add_constant(Value::string(interned(name)));
        let dst = self.cur().allocreg(line)?;
        self.emit(
            Instruction::abc(OpCode::GetProp, dst, obj, name_c as u8),
            line,
        );
        self.cur().freereg(obj);
        Ok(dst)
    }

    fn compile_member_set(
        &mut self,
        object: &Node,
        name: &str,
        value: &Node,
        line: u32,
    ) -> CompileResult<u8> {
        let obj = self.compile_expr(object)?;
        let val = self.compile_expr(value)?;
        let name_c = self.cur().builder.add_constant(Value::string(interned(name)));
        self.emit(
            Instruction::abc(OpCode::SetProp, obj, name_c as u8, val),
            line,
        );
        self.cur().freereg(val);
        Ok(obj)
    }
}

fn interned(s: &str) -> Rc<xr_core::intern::XString> {
    // Constant-pool strings are not required to share the runtime
    // interner's table (they are re-interned into it on first load by the
    // VM); a fresh `Rc` here only stands in as the constant-pool payload.
    Rc::new(xr_core::intern::XString {
        chars: s.to_string(),
    })
}

fn fold_constants(op: BinOp, left: &Node, right: &Node) -> Option<Value> {
    let l = literal_number(left)?;
    let r = literal_number(right)?;
    match (l, r) {
        (Num::Int(a), Num::Int(b)) => match op {
            BinOp::Add => Some(Value::int(a.wrapping_add(b))),
            BinOp::Sub => Some(Value::int(a.wrapping_sub(b))),
            BinOp::Mul => Some(Value::int(a.wrapping_mul(b))),
            BinOp::Div if b != 0 => Some(Value::float(a as f64 / b as f64)),
            BinOp::Mod if b != 0 => Some(Value::int(a.wrapping_rem(b))),
            _ => None,
        },
        (a, b) => {
            let (af, bf) = (a.as_f64(), b.as_f64());
            match op {
                BinOp::Add => Some(Value::float(af + bf)),
                BinOp::Sub => Some(Value::float(af - bf)),
                BinOp::Mul => Some(Value::float(af * bf)),
                BinOp::Div if bf != 0.0 => Some(Value::float(af / bf)),
                _ => None,
            }
        }
    }
}

enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(&self) -> f64 {
        match self {
            Num::Int(i) => *i as f64,
            Num::Float(f) => *f,
        }
    }
}

fn literal_number(node: &Node) -> Option<Num> {
    match node.kind {
        NodeKind::IntLiteral(i) => Some(Num::Int(i)),
        NodeKind::FloatLiteral(f) => Some(Num::Float(f)),
        _ => None,
    }
}

fn finish_scope(mut scope: FnScope) -> Rc<Proto> {
    peephole::run(scope.builder.code_slice_mut(), scope.builder.lines_mut());
    let constants: Vec<Option<i64>> = scope
        .builder
        .constants_slice()
        .iter()
        .map(Value::as_int)
        .collect();
    fusion::run(scope.builder.code_slice_mut(), &constants);
    scope.builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FieldDecl, MethodDecl};

    fn lit(line: u32, kind: NodeKind) -> Node {
        Node::new(line, kind)
    }

    fn compile(stmts: Vec<Node>) -> Rc<Proto> {
        let symbols = Rc::new(RefCell::new(SymbolTable::new()));
        Compiler::new(symbols)
            .compile_program(&stmts)
            .expect("program compiles")
    }

    #[test]
    fn arithmetic_constant_folds_to_single_load() {
        let expr = lit(
            1,
            NodeKind::Binary {
                op: BinOp::Add,
                left: Box::new(lit(1, NodeKind::IntLiteral(1))),
                right: Box::new(lit(
                    1,
                    NodeKind::Binary {
                        op: BinOp::Mul,
                        left: Box::new(lit(1, NodeKind::IntLiteral(2))),
                        right: Box::new(lit(1, NodeKind::IntLiteral(3))),
                    },
                )),
            },
        );
        let proto = compile(vec![lit(1, NodeKind::Print(Box::new(expr)))]);
        let loads: Vec<_> = proto
            .code
            .iter()
            .filter(|i| matches!(i.opcode(), OpCode::LoadI | OpCode::LoadK))
            .collect();
        assert_eq!(loads.len(), 1);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let symbols = Rc::new(RefCell::new(SymbolTable::new()));
        let result = Compiler::new(symbols).compile_program(&[lit(1, NodeKind::Break)]);
        assert!(matches!(
            result,
            Err(errs) if matches!(errs[0], CompileError::BreakOutsideLoop { .. })
        ));
    }

    #[test]
    fn class_declaration_compiles_constructor_and_method() {
        let decl = ClassDecl {
            name: "Dog".to_string(),
            superclass: None,
            fields: vec![FieldDecl {
                name: "name".to_string(),
                type_name: None,
            }],
            methods: vec![MethodDecl {
                name: "constructor".to_string(),
                params: vec!["name".to_string()],
                body: vec![lit(
                    1,
                    NodeKind::MemberSet {
                        object: Box::new(lit(1, NodeKind::This)),
                        name: "name".to_string(),
                        value: Box::new(lit(1, NodeKind::Variable("name".to_string()))),
                    },
                )],
                is_static: false,
                is_private: false,
                is_getter: false,
                is_setter: false,
                line: 1,
            }],
        };
        let proto = compile(vec![lit(1, NodeKind::ClassDecl(decl))]);
        assert!(proto
            .code
            .iter()
            .any(|i| i.opcode() == OpCode::Class));
    }

    #[test]
    fn tail_call_emitted_for_return_call() {
        let decl = FunctionDecl {
            name: Some("loop".to_string()),
            params: vec!["n".to_string()],
            body: vec![lit(
                1,
                NodeKind::Return(Some(Box::new(lit(
                    1,
                    NodeKind::Call {
                        callee: Box::new(lit(1, NodeKind::Variable("loop".to_string()))),
                        args: vec![lit(1, NodeKind::Variable("n".to_string()))],
                    },
                )))),
            )],
            line: 1,
        };
        let proto = compile(vec![lit(1, NodeKind::FunctionDecl(decl))]);
        let func_proto = proto.children.first().expect("nested function compiled");
        assert!(func_proto
            .code
            .iter()
            .any(|i| i.opcode() == OpCode::TailCall));
    }
}
