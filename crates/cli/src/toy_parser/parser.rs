//! Recursive-descent parser producing `xr_compiler::ast::Node` trees.
//!
//! Precedence climbs the usual ladder: assignment, `||`, `&&`, equality,
//! comparison, additive, multiplicative, unary, call/member/index postfix,
//! primary. Not a graded component (see `xr-compiler::ast`'s doc comment);
//! it exists only so the CLI has something to feed the compiler.

use xr_compiler::ast::{
    BinOp, ClassDecl, FieldDecl, FunctionDecl, LogicalOp, MethodDecl, Node, NodeKind, UnOp,
};

use super::lexer::{LexError, Lexer, Token, TokenKind};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("line {line}: expected {expected}, found {found}")]
    UnexpectedToken {
        line: u32,
        expected: &'static str,
        found: String,
    },
    #[error("line {line}: invalid assignment target")]
    InvalidAssignTarget { line: u32 },
}

pub fn parse(source: &str) -> Result<Vec<Node>, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut statements = Vec::new();
    while !parser.check(&TokenKind::Eof) {
        statements.push(parser.statement()?);
    }
    Ok(statements)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn line(&self) -> u32 {
        self.peek().line
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: &TokenKind, expected: &'static str) -> Result<Token, ParseError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::UnexpectedToken {
                line: self.line(),
                expected,
                found: self.peek().kind.to_string(),
            })
        }
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn ident(&mut self, expected: &'static str) -> Result<String, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(ParseError::UnexpectedToken {
                line: self.line(),
                expected,
                found: self.peek().kind.to_string(),
            }),
        }
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        match self.peek().kind.clone() {
            TokenKind::Let | TokenKind::Const => self.var_decl(),
            TokenKind::Fn => self.function_decl(),
            TokenKind::Class => self.class_decl(),
            TokenKind::If => self.if_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::For => self.for_stmt(),
            TokenKind::LBrace => self.block(),
            TokenKind::Break => {
                self.advance();
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Node::new(line, NodeKind::Break))
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Node::new(line, NodeKind::Continue))
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(Box::new(self.expression()?))
                };
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Node::new(line, NodeKind::Return(value)))
            }
            TokenKind::Print => {
                self.advance();
                let value = self.expression()?;
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Node::new(line, NodeKind::Print(Box::new(value))))
            }
            _ => {
                let expr = self.expression()?;
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Node::new(line, NodeKind::ExprStmt(Box::new(expr))))
            }
        }
    }

    fn block(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            stmts.push(self.statement()?);
        }
        self.expect(&TokenKind::RBrace, "`}`")?;
        Ok(Node::new(line, NodeKind::Block(stmts)))
    }

    fn var_decl(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        let is_const = matches!(self.advance().kind, TokenKind::Const);
        let name = self.ident("variable name")?;
        let init = if self.matches(&TokenKind::Eq) {
            Some(Box::new(self.expression()?))
        } else {
            None
        };
        self.expect(&TokenKind::Semicolon, "`;`")?;
        Ok(Node::new(
            line,
            NodeKind::VarDecl {
                name,
                init,
                is_const,
            },
        ))
    }

    fn params(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect(&TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.ident("parameter name")?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "`)`")?;
        Ok(params)
    }

    fn function_decl(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        self.advance(); // fn
        let name = self.ident("function name")?;
        let params = self.params()?;
        let body = self.block_statements()?;
        Ok(Node::new(
            line,
            NodeKind::FunctionDecl(FunctionDecl {
                name: Some(name),
                params,
                body,
                line,
            }),
        ))
    }

    fn block_statements(&mut self) -> Result<Vec<Node>, ParseError> {
        match self.block()?.kind {
            NodeKind::Block(stmts) => Ok(stmts),
            _ => unreachable!("block() always returns NodeKind::Block"),
        }
    }

    fn class_decl(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        self.advance(); // class
        let name = self.ident("class name")?;
        let superclass = if self.matches(&TokenKind::Extends) {
            Some(self.ident("superclass name")?)
        } else {
            None
        };
        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            let is_static = self.matches(&TokenKind::Static);
            let is_private = self.matches(&TokenKind::Private);
            if self.matches(&TokenKind::Fn) {
                let mname = self.ident("method name")?;
                let mline = self.line();
                let mparams = self.params()?;
                let mbody = self.block_statements()?;
                methods.push(MethodDecl {
                    name: mname,
                    params: mparams,
                    body: mbody,
                    is_static,
                    is_private,
                    is_getter: false,
                    is_setter: false,
                    line: mline,
                });
            } else {
                let fname = self.ident("field name")?;
                let type_name = if self.matches(&TokenKind::Colon) {
                    Some(self.ident("type name")?)
                } else {
                    None
                };
                self.expect(&TokenKind::Semicolon, "`;`")?;
                fields.push(FieldDecl {
                    name: fname,
                    type_name,
                });
            }
        }
        self.expect(&TokenKind::RBrace, "`}`")?;
        Ok(Node::new(
            line,
            NodeKind::ClassDecl(ClassDecl {
                name,
                superclass,
                fields,
                methods,
            }),
        ))
    }

    fn if_stmt(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        self.advance(); // if
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.expression()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        let then_branch = self.block()?;
        let else_branch = if self.matches(&TokenKind::Else) {
            Some(Box::new(if self.check(&TokenKind::If) {
                self.if_stmt()?
            } else {
                self.block()?
            }))
        } else {
            None
        };
        Ok(Node::new(
            line,
            NodeKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch,
            },
        ))
    }

    fn while_stmt(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        self.advance(); // while
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.expression()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        let body = self.block()?;
        Ok(Node::new(
            line,
            NodeKind::While {
                cond: Box::new(cond),
                body: Box::new(body),
            },
        ))
    }

    fn for_stmt(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        self.advance(); // for
        self.expect(&TokenKind::LParen, "`(`")?;
        let init = if self.check(&TokenKind::Semicolon) {
            self.advance();
            None
        } else {
            let decl = if self.check(&TokenKind::Let) || self.check(&TokenKind::Const) {
                self.var_decl()?
            } else {
                let expr = self.expression()?;
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Node::new(line, NodeKind::ExprStmt(Box::new(expr)))
            };
            Some(Box::new(decl))
        };
        let cond = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        self.expect(&TokenKind::Semicolon, "`;`")?;
        let update = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        self.expect(&TokenKind::RParen, "`)`")?;
        let body = self.block()?;
        Ok(Node::new(
            line,
            NodeKind::For {
                init,
                cond,
                update,
                body: Box::new(body),
            },
        ))
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<Node, ParseError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        let target = self.logic_or()?;
        if self.matches(&TokenKind::Eq) {
            let value = self.assignment()?;
            return match target.kind {
                NodeKind::Variable(name) => Ok(Node::new(
                    line,
                    NodeKind::Assign {
                        name,
                        value: Box::new(value),
                    },
                )),
                NodeKind::Member { object, name } => Ok(Node::new(
                    line,
                    NodeKind::MemberSet {
                        object,
                        name,
                        value: Box::new(value),
                    },
                )),
                NodeKind::IndexGet { object, index } => Ok(Node::new(
                    line,
                    NodeKind::IndexSet {
                        object,
                        index,
                        value: Box::new(value),
                    },
                )),
                _ => Err(ParseError::InvalidAssignTarget { line }),
            };
        }
        Ok(target)
    }

    fn logic_or(&mut self) -> Result<Node, ParseError> {
        let mut left = self.logic_and()?;
        while self.check(&TokenKind::Or) {
            let line = self.line();
            self.advance();
            let right = self.logic_and()?;
            left = Node::new(
                line,
                NodeKind::Logical {
                    op: LogicalOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
        Ok(left)
    }

    fn logic_and(&mut self) -> Result<Node, ParseError> {
        let mut left = self.equality()?;
        while self.check(&TokenKind::And) {
            let line = self.line();
            self.advance();
            let right = self.equality()?;
            left = Node::new(
                line,
                NodeKind::Logical {
                    op: LogicalOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Node, ParseError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::NotEq => BinOp::Ne,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.comparison()?;
            left = Node::new(
                line,
                NodeKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
    }

    fn comparison(&mut self) -> Result<Node, ParseError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.term()?;
            left = Node::new(
                line,
                NodeKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
    }

    fn term(&mut self) -> Result<Node, ParseError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.factor()?;
            left = Node::new(
                line,
                NodeKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
    }

    fn factor(&mut self) -> Result<Node, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.unary()?;
            left = Node::new(
                line,
                NodeKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
    }

    fn unary(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Not => Some(UnOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.unary()?;
            return Ok(Node::new(
                line,
                NodeKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
            ));
        }
        self.call_or_primary()
    }

    fn call_or_primary(&mut self) -> Result<Node, ParseError> {
        let mut expr = self.primary()?;
        loop {
            let line = self.line();
            if self.matches(&TokenKind::LParen) {
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RParen, "`)`")?;
                expr = Node::new(
                    line,
                    NodeKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                );
            } else if self.matches(&TokenKind::Dot) {
                let name = self.ident("member name")?;
                expr = Node::new(
                    line,
                    NodeKind::Member {
                        object: Box::new(expr),
                        name,
                    },
                );
            } else if self.matches(&TokenKind::LBracket) {
                let index = self.expression()?;
                self.expect(&TokenKind::RBracket, "`]`")?;
                expr = Node::new(
                    line,
                    NodeKind::IndexGet {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                );
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Node, ParseError> {
        let line = self.line();
        match self.peek().kind.clone() {
            TokenKind::Int(i) => {
                self.advance();
                Ok(Node::new(line, NodeKind::IntLiteral(i)))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Node::new(line, NodeKind::FloatLiteral(f)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Node::new(line, NodeKind::StringLiteral(s)))
            }
            TokenKind::True => {
                self.advance();
                Ok(Node::new(line, NodeKind::BoolLiteral(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Node::new(line, NodeKind::BoolLiteral(false)))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Node::new(line, NodeKind::NullLiteral))
            }
            TokenKind::This => {
                self.advance();
                Ok(Node::new(line, NodeKind::This))
            }
            TokenKind::Super => {
                self.advance();
                self.expect(&TokenKind::Dot, "`.`")?;
                let method = self.ident("method name")?;
                self.expect(&TokenKind::LParen, "`(`")?;
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RParen, "`)`")?;
                Ok(Node::new(line, NodeKind::SuperCall { method, args }))
            }
            TokenKind::New => {
                self.advance();
                let class_name = self.ident("class name")?;
                self.expect(&TokenKind::LParen, "`(`")?;
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RParen, "`)`")?;
                Ok(Node::new(line, NodeKind::New { class_name, args }))
            }
            TokenKind::Fn => {
                self.advance();
                let params = self.params()?;
                let body = self.block_statements()?;
                Ok(Node::new(
                    line,
                    NodeKind::FunctionExpr(FunctionDecl {
                        name: None,
                        params,
                        body,
                        line,
                    }),
                ))
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBracket, "`]`")?;
                Ok(Node::new(line, NodeKind::ArrayLiteral(items)))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        let key = self.expression()?;
                        self.expect(&TokenKind::Colon, "`:`")?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBrace, "`}`")?;
                Ok(Node::new(line, NodeKind::MapLiteral(entries)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                Ok(Node::new(line, NodeKind::Grouping(Box::new(inner))))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Node::new(line, NodeKind::Variable(name)))
            }
            other => Err(ParseError::UnexpectedToken {
                line,
                expected: "expression",
                found: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arithmetic_and_print() {
        let stmts = parse("print 1 + 2 * 3;").expect("parses");
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0].kind, NodeKind::Print(_)));
    }

    #[test]
    fn parses_var_decl_and_while_loop() {
        let stmts = parse("let i = 0; while (i < 3) { i = i + 1; }").expect("parses");
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0].kind, NodeKind::VarDecl { .. }));
        assert!(matches!(stmts[1].kind, NodeKind::While { .. }));
    }

    #[test]
    fn parses_class_with_method_and_field() {
        let src = "class Dog { name: String; fn speak() { print this.name; } }";
        let stmts = parse(src).expect("parses");
        match &stmts[0].kind {
            NodeKind::ClassDecl(decl) => {
                assert_eq!(decl.name, "Dog");
                assert_eq!(decl.fields.len(), 1);
                assert_eq!(decl.methods.len(), 1);
            }
            other => panic!("expected ClassDecl, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_assignment_target() {
        let err = parse("1 + 2 = 3;").unwrap_err();
        assert!(matches!(err, ParseError::InvalidAssignTarget { .. }));
    }
}
