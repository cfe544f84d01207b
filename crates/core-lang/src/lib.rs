//! Frontend for the embedded script dialect.
//!
//! One lexer and one statement parser serve three consumers: the notebook
//! boundary parser (which needs string-literal and comment positions but no
//! tree), the dependency analyzer (which walks the tree without executing
//! it), and the evaluator (which interprets the same tree). Sharing the
//! frontend keeps the three views of a cell's syntax consistent by
//! construction.
//!
//! The dialect is a Python-flavoured subset: indentation-scoped blocks,
//! `#` comments, triple-quoted strings, `def`/`class`/`for`/`while`/`if`,
//! imports, walrus assignments, and list comprehensions. Statement kinds
//! outside the subset (`try`, `with`, `yield`, …) lex fine but fail to
//! parse, which surfaces per-cell as a structured syntax error rather than
//! a file-level failure.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::{Expr, ExprKind, Module, Param, Stmt, StmtKind};
pub use lexer::{LexError, lex};
pub use parser::{ParseError, parse_module};

/// Parse a source fragment end to end. Convenience for the analyzer and
/// evaluator, which never need the raw token stream.
pub fn parse_source(source: &str) -> Result<Module, ParseError> {
    let tokens = lex(source).map_err(ParseError::from_lex)?;
    parse_module(&tokens)
}
