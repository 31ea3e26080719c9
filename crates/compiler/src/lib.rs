//! AST-to-bytecode compilation: lexical scope resolution, register
//! allocation, and the peephole/fusion cleanup passes that run over each
//! function's instruction stream before it's frozen into a `Proto`.

pub mod ast;
mod compiler;
pub mod error;
mod fusion;
mod peephole;

use std::cell::RefCell;
use std::rc::Rc;

use xr_core::proto::Proto;
use xr_symbol::SymbolTable;

pub use ast::{BinOp, ClassDecl, FieldDecl, FunctionDecl, LogicalOp, MethodDecl, Node, NodeKind, UnOp};
pub use compiler::Compiler;
pub use error::{CompileError, CompileResult};

/// Compiles a full program into its top-level `Proto`, threading a shared
/// symbol table so every class/method declaration in the program resolves
/// through the same dense symbol space the VM's dispatch relies on.
pub fn compile_program(
    statements: &[Node],
    symbols: Rc<RefCell<SymbolTable>>,
) -> Result<Rc<Proto>, Vec<CompileError>> {
    Compiler::new(symbols).compile_program(statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_program_compiles_to_bare_return() {
        let symbols = Rc::new(RefCell::new(SymbolTable::new()));
        let proto = compile_program(&[], symbols).expect("empty program compiles");
        assert!(!proto.code.is_empty());
        assert_eq!(proto.code.last().unwrap().opcode(), xr_core::opcode::OpCode::Return);
    }

    #[test]
    fn print_statement_compiles() {
        let symbols = Rc::new(RefCell::new(SymbolTable::new()));
        let stmts = vec![Node::new(
            1,
            NodeKind::Print(Box::new(Node::new(1, NodeKind::IntLiteral(42)))),
        )];
        let proto = compile_program(&stmts, symbols).expect("program compiles");
        assert!(proto
            .code
            .iter()
            .any(|i| i.opcode() == xr_core::opcode::OpCode::Print));
    }
}
