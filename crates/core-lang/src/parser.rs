//! Recursive-descent statement and expression parser.
//!
//! Precedence climbing for expressions, indentation-delimited suites for
//! compound statements. The parser accepts the full dialect surface and
//! rejects recognized-but-unsupported constructs (`try`, `with`, decorators,
//! slices) with a message naming the construct, so cell errors stay
//! actionable.

use thiserror::Error;

use crate::ast::{
    BoolOp, CmpOp, Expr, ExprKind, ImportAlias, Module, Param, Stmt, StmtKind, UnaryOp,
};
use crate::lexer::LexError;
use crate::token::{Kw, Op, TokKind, Token};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (line {line}, column {col})")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            col,
            message: message.into(),
        }
    }

    pub fn from_lex(err: LexError) -> Self {
        Self::new(err.line, err.col, err.message)
    }
}

/// Parse a token stream (as produced by [`crate::lex`]) into a module.
pub fn parse_module(tokens: &[Token]) -> Result<Module, ParseError> {
    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t.kind, TokKind::Comment { .. }))
        .collect();
    let mut parser = Parser {
        tokens: significant,
        pos: 0,
    };
    let mut body = Vec::new();
    loop {
        match &parser.peek().kind {
            TokKind::Eof => break,
            TokKind::Newline => {
                parser.bump();
            }
            TokKind::Indent => {
                let tok = parser.peek();
                return Err(ParseError::new(tok.line, tok.col, "unexpected indent"));
            }
            _ => body.append(&mut parser.parse_statement_line()?),
        }
    }
    Ok(Module { body })
}

struct Parser<'t> {
    tokens: Vec<&'t Token>,
    pos: usize,
}

impl<'t> Parser<'t> {
    // Tokens outlive the parser, so lookahead references never tie up
    // `self` across a `bump`.
    fn peek(&self) -> &'t Token {
        self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &'t Token {
        self.tokens[(self.pos + offset).min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> &'t Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let tok = self.peek();
        ParseError::new(tok.line, tok.col, message)
    }

    fn expect_op(&mut self, op: Op, what: &str) -> Result<(), ParseError> {
        if self.peek().is_op(op) {
            self.bump();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn expect_newline(&mut self) -> Result<(), ParseError> {
        match self.peek().kind {
            TokKind::Newline => {
                self.bump();
                Ok(())
            }
            TokKind::Eof => Ok(()),
            _ => Err(self.error("expected end of statement")),
        }
    }

    fn take_name(&mut self, what: &str) -> Result<String, ParseError> {
        match &self.peek().kind {
            TokKind::Name(name) => {
                let name = name.clone();
                self.bump();
                Ok(name)
            }
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    /// One physical statement line: either a compound statement or a run of
    /// `;`-separated simple statements terminated by a newline.
    fn parse_statement_line(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if self.at_compound_start() {
            return Ok(vec![self.parse_compound()?]);
        }
        let mut stmts = vec![self.parse_simple()?];
        while self.peek().is_op(Op::Semi) {
            self.bump();
            if matches!(self.peek().kind, TokKind::Newline | TokKind::Eof) {
                break;
            }
            stmts.push(self.parse_simple()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn at_compound_start(&self) -> bool {
        matches!(
            self.peek().kind,
            TokKind::Kw(Kw::If | Kw::While | Kw::For | Kw::Def | Kw::Class)
        )
    }

    fn parse_simple(&mut self) -> Result<Stmt, ParseError> {
        let tok = self.peek();
        let line = tok.line;
        match &tok.kind {
            TokKind::Kw(Kw::Pass) => {
                self.bump();
                Ok(Stmt {
                    line,
                    kind: StmtKind::Pass,
                })
            }
            TokKind::Kw(Kw::Break) => {
                self.bump();
                Ok(Stmt {
                    line,
                    kind: StmtKind::Break,
                })
            }
            TokKind::Kw(Kw::Continue) => {
                self.bump();
                Ok(Stmt {
                    line,
                    kind: StmtKind::Continue,
                })
            }
            TokKind::Kw(Kw::Return) => {
                self.bump();
                let value = if matches!(self.peek().kind, TokKind::Newline | TokKind::Eof)
                    || self.peek().is_op(Op::Semi)
                {
                    None
                } else {
                    Some(self.parse_testlist()?)
                };
                Ok(Stmt {
                    line,
                    kind: StmtKind::Return(value),
                })
            }
            TokKind::Kw(Kw::Del) => {
                self.bump();
                let mut targets = vec![self.parse_test()?];
                while self.peek().is_op(Op::Comma) {
                    self.bump();
                    targets.push(self.parse_test()?);
                }
                for target in &targets {
                    if !target.is_assign_target() {
                        return Err(ParseError::new(
                            target.line,
                            target.col,
                            "cannot delete this expression",
                        ));
                    }
                }
                Ok(Stmt {
                    line,
                    kind: StmtKind::Del(targets),
                })
            }
            TokKind::Kw(Kw::Import) => self.parse_import(),
            TokKind::Kw(Kw::From) => self.parse_from_import(),
            TokKind::Kw(
                kw @ (Kw::Try
                | Kw::Except
                | Kw::Finally
                | Kw::With
                | Kw::Raise
                | Kw::Global
                | Kw::Nonlocal
                | Kw::Yield
                | Kw::Async
                | Kw::Await
                | Kw::Assert),
            ) => Err(self.error(format!(
                "`{kw:?}` statements are not supported by the embedded evaluator"
            ).to_lowercase())),
            TokKind::Op(Op::At) => Err(self.error("decorators are not supported")),
            _ => self.parse_expr_statement(),
        }
    }

    fn parse_import(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.bump(); // import
        let mut aliases = vec![self.parse_import_alias()?];
        while self.peek().is_op(Op::Comma) {
            self.bump();
            aliases.push(self.parse_import_alias()?);
        }
        Ok(Stmt {
            line,
            kind: StmtKind::Import(aliases),
        })
    }

    fn parse_import_alias(&mut self) -> Result<ImportAlias, ParseError> {
        let name = self.parse_dotted_name()?;
        let asname = if self.peek().is_kw(Kw::As) {
            self.bump();
            Some(self.take_name("alias name after `as`")?)
        } else {
            None
        };
        Ok(ImportAlias { name, asname })
    }

    fn parse_dotted_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.take_name("module name")?;
        while self.peek().is_op(Op::Dot) {
            self.bump();
            name.push('.');
            name.push_str(&self.take_name("name after `.`")?);
        }
        Ok(name)
    }

    fn parse_from_import(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.bump(); // from
        let module = self.parse_dotted_name()?;
        if !self.peek().is_kw(Kw::Import) {
            return Err(self.error("expected `import`"));
        }
        self.bump();
        if self.peek().is_op(Op::Star) {
            self.bump();
            return Ok(Stmt {
                line,
                kind: StmtKind::ImportFrom {
                    module,
                    names: Vec::new(),
                    star: true,
                },
            });
        }
        let mut names = vec![self.parse_import_alias()?];
        while self.peek().is_op(Op::Comma) {
            self.bump();
            names.push(self.parse_import_alias()?);
        }
        Ok(Stmt {
            line,
            kind: StmtKind::ImportFrom {
                module,
                names,
                star: false,
            },
        })
    }

    fn parse_expr_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        let first = self.parse_testlist()?;

        if let TokKind::Op(op) = self.peek().kind
            && let Some(_base) = op.aug_base()
        {
            self.bump();
            if !matches!(
                first.kind,
                ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. }
            ) {
                return Err(ParseError::new(
                    first.line,
                    first.col,
                    "invalid augmented assignment target",
                ));
            }
            let value = self.parse_testlist()?;
            return Ok(Stmt {
                line,
                kind: StmtKind::AugAssign {
                    target: first,
                    op,
                    value,
                },
            });
        }

        if !self.peek().is_op(Op::Eq) {
            return Ok(Stmt {
                line,
                kind: StmtKind::Expr(first),
            });
        }

        let mut chain = vec![first];
        while self.peek().is_op(Op::Eq) {
            self.bump();
            chain.push(self.parse_testlist()?);
        }
        let value = chain.pop().expect("chain has at least two entries");
        for target in &chain {
            if !target.is_assign_target() {
                return Err(ParseError::new(
                    target.line,
                    target.col,
                    "cannot assign to this expression",
                ));
            }
        }
        Ok(Stmt {
            line,
            kind: StmtKind::Assign {
                targets: chain,
                value,
            },
        })
    }

    fn parse_compound(&mut self) -> Result<Stmt, ParseError> {
        let tok = self.peek();
        let line = tok.line;
        match tok.kind {
            TokKind::Kw(Kw::If) => {
                self.bump();
                let mut branches = vec![(self.parse_test()?, self.parse_suite()?)];
                let mut orelse = Vec::new();
                loop {
                    if self.peek().is_kw(Kw::Elif) {
                        self.bump();
                        branches.push((self.parse_test()?, self.parse_suite()?));
                    } else if self.peek().is_kw(Kw::Else) {
                        self.bump();
                        orelse = self.parse_suite()?;
                        break;
                    } else {
                        break;
                    }
                }
                Ok(Stmt {
                    line,
                    kind: StmtKind::If { branches, orelse },
                })
            }
            TokKind::Kw(Kw::While) => {
                self.bump();
                let test = self.parse_test()?;
                let body = self.parse_suite()?;
                Ok(Stmt {
                    line,
                    kind: StmtKind::While { test, body },
                })
            }
            TokKind::Kw(Kw::For) => {
                self.bump();
                let target = self.parse_target_list()?;
                if !self.peek().is_kw(Kw::In) {
                    return Err(self.error("expected `in`"));
                }
                self.bump();
                let iter = self.parse_testlist()?;
                let body = self.parse_suite()?;
                Ok(Stmt {
                    line,
                    kind: StmtKind::For { target, iter, body },
                })
            }
            TokKind::Kw(Kw::Def) => {
                self.bump();
                let name = self.take_name("function name")?;
                self.expect_op(Op::LParen, "`(`")?;
                let params = self.parse_params(Op::RParen)?;
                self.expect_op(Op::RParen, "`)`")?;
                if self.peek().is_op(Op::Arrow) {
                    // Return annotations are parsed and discarded.
                    self.bump();
                    self.parse_test()?;
                }
                let body = self.parse_suite()?;
                Ok(Stmt {
                    line,
                    kind: StmtKind::FuncDef { name, params, body },
                })
            }
            TokKind::Kw(Kw::Class) => {
                self.bump();
                let name = self.take_name("class name")?;
                let mut bases = Vec::new();
                if self.peek().is_op(Op::LParen) {
                    self.bump();
                    while !self.peek().is_op(Op::RParen) {
                        bases.push(self.parse_test()?);
                        if self.peek().is_op(Op::Comma) {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    self.expect_op(Op::RParen, "`)`")?;
                }
                let body = self.parse_suite()?;
                Ok(Stmt {
                    line,
                    kind: StmtKind::ClassDef { name, bases, body },
                })
            }
            _ => Err(self.error("expected statement")),
        }
    }

    /// `: suite` — either inline simple statements or an indented block.
    fn parse_suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect_op(Op::Colon, "`:`")?;
        if !matches!(self.peek().kind, TokKind::Newline) {
            // Inline suite: `if x: y = 1; z = 2`
            let mut stmts = vec![self.parse_simple()?];
            while self.peek().is_op(Op::Semi) {
                self.bump();
                if matches!(self.peek().kind, TokKind::Newline | TokKind::Eof) {
                    break;
                }
                stmts.push(self.parse_simple()?);
            }
            self.expect_newline()?;
            return Ok(stmts);
        }
        self.bump(); // newline
        if !matches!(self.peek().kind, TokKind::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.bump();
        let mut stmts = Vec::new();
        loop {
            match self.peek().kind {
                TokKind::Dedent => {
                    self.bump();
                    break;
                }
                TokKind::Newline => {
                    self.bump();
                }
                TokKind::Eof => break,
                _ => stmts.append(&mut self.parse_statement_line()?),
            }
        }
        Ok(stmts)
    }

    fn parse_params(&mut self, terminator: Op) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();
        let mut seen_default = false;
        while !self.peek().is_op(terminator) && !matches!(self.peek().kind, TokKind::Op(Op::Colon))
        {
            let name = self.take_name("parameter name")?;
            let default = if self.peek().is_op(Op::Eq) {
                self.bump();
                seen_default = true;
                Some(self.parse_test()?)
            } else {
                if seen_default {
                    return Err(self.error("parameter without default follows one with a default"));
                }
                None
            };
            params.push(Param { name, default });
            if self.peek().is_op(Op::Comma) {
                self.bump();
            } else {
                break;
            }
        }
        Ok(params)
    }

    /// Assignment/loop target list: `a`, `a, b`, `a, *rest`.
    fn parse_target_list(&mut self) -> Result<Expr, ParseError> {
        let tok = self.peek();
        let (line, col) = (tok.line, tok.col);
        let mut items = vec![self.parse_target_item()?];
        let mut tuple = false;
        while self.peek().is_op(Op::Comma) {
            self.bump();
            tuple = true;
            if self.peek().is_kw(Kw::In) || self.peek().is_op(Op::Eq) {
                break;
            }
            items.push(self.parse_target_item()?);
        }
        let expr = if tuple {
            Expr::new(line, col, ExprKind::Tuple(items))
        } else {
            items.pop().expect("one target")
        };
        if !expr.is_assign_target() {
            return Err(ParseError::new(expr.line, expr.col, "invalid assignment target"));
        }
        Ok(expr)
    }

    fn parse_target_item(&mut self) -> Result<Expr, ParseError> {
        if self.peek().is_op(Op::Star) {
            let tok = self.bump();
            let inner = self.parse_postfix()?;
            return Ok(Expr::new(tok.line, tok.col, ExprKind::Starred(Box::new(inner))));
        }
        self.parse_postfix()
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    /// Comma-separated expression list; two or more items form a tuple.
    fn parse_testlist(&mut self) -> Result<Expr, ParseError> {
        let tok = self.peek();
        let (line, col) = (tok.line, tok.col);
        let first = self.parse_test_or_starred()?;
        if !self.peek().is_op(Op::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.peek().is_op(Op::Comma) {
            self.bump();
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_test_or_starred()?);
        }
        Ok(Expr::new(line, col, ExprKind::Tuple(items)))
    }

    fn parse_test_or_starred(&mut self) -> Result<Expr, ParseError> {
        if self.peek().is_op(Op::Star) {
            let tok = self.bump();
            let inner = self.parse_test()?;
            return Ok(Expr::new(tok.line, tok.col, ExprKind::Starred(Box::new(inner))));
        }
        self.parse_test()
    }

    fn starts_expression(&self) -> bool {
        match &self.peek().kind {
            TokKind::Name(_)
            | TokKind::Int(_)
            | TokKind::Float(_)
            | TokKind::Str { .. } => true,
            TokKind::Kw(Kw::None | Kw::True | Kw::False | Kw::Not | Kw::Lambda) => true,
            TokKind::Op(
                Op::LParen | Op::LBracket | Op::LBrace | Op::Minus | Op::Plus | Op::Tilde | Op::Star,
            ) => true,
            _ => false,
        }
    }

    fn parse_test(&mut self) -> Result<Expr, ParseError> {
        // Walrus: NAME := test
        if let TokKind::Name(name) = &self.peek().kind
            && self.peek_at(1).is_op(Op::Walrus)
        {
            let name = name.clone();
            let tok = self.bump();
            let (line, col) = (tok.line, tok.col);
            self.bump(); // :=
            let value = self.parse_test()?;
            return Ok(Expr::new(
                line,
                col,
                ExprKind::Named {
                    name,
                    value: Box::new(value),
                },
            ));
        }

        if self.peek().is_kw(Kw::Lambda) {
            let tok = self.bump();
            let (line, col) = (tok.line, tok.col);
            let params = self.parse_params(Op::Colon)?;
            self.expect_op(Op::Colon, "`:`")?;
            let body = self.parse_test()?;
            return Ok(Expr::new(
                line,
                col,
                ExprKind::Lambda {
                    params,
                    body: Box::new(body),
                },
            ));
        }

        let body = self.parse_or()?;
        if self.peek().is_kw(Kw::If) {
            let (line, col) = (body.line, body.col);
            self.bump();
            let test = self.parse_or()?;
            if !self.peek().is_kw(Kw::Else) {
                return Err(self.error("expected `else` in conditional expression"));
            }
            self.bump();
            let orelse = self.parse_test()?;
            return Ok(Expr::new(
                line,
                col,
                ExprKind::IfElse {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
            ));
        }
        Ok(body)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_and()?;
        if !self.peek().is_kw(Kw::Or) {
            return Ok(first);
        }
        let (line, col) = (first.line, first.col);
        let mut values = vec![first];
        while self.peek().is_kw(Kw::Or) {
            self.bump();
            values.push(self.parse_and()?);
        }
        Ok(Expr::new(
            line,
            col,
            ExprKind::BoolChain {
                op: BoolOp::Or,
                values,
            },
        ))
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_not()?;
        if !self.peek().is_kw(Kw::And) {
            return Ok(first);
        }
        let (line, col) = (first.line, first.col);
        let mut values = vec![first];
        while self.peek().is_kw(Kw::And) {
            self.bump();
            values.push(self.parse_not()?);
        }
        Ok(Expr::new(
            line,
            col,
            ExprKind::BoolChain {
                op: BoolOp::And,
                values,
            },
        ))
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.peek().is_kw(Kw::Not) {
            let tok = self.bump();
            let operand = self.parse_not()?;
            return Ok(Expr::new(
                tok.line,
                tok.col,
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_bitor()?;
        let mut comparisons = Vec::new();
        loop {
            let op = match &self.peek().kind {
                TokKind::Op(Op::Lt) => CmpOp::Lt,
                TokKind::Op(Op::Le) => CmpOp::Le,
                TokKind::Op(Op::Gt) => CmpOp::Gt,
                TokKind::Op(Op::Ge) => CmpOp::Ge,
                TokKind::Op(Op::EqEq) => CmpOp::Eq,
                TokKind::Op(Op::NotEq) => CmpOp::Ne,
                TokKind::Kw(Kw::In) => CmpOp::In,
                TokKind::Kw(Kw::Is) => {
                    self.bump();
                    if self.peek().is_kw(Kw::Not) {
                        self.bump();
                        comparisons.push((CmpOp::IsNot, self.parse_bitor()?));
                    } else {
                        comparisons.push((CmpOp::Is, self.parse_bitor()?));
                    }
                    continue;
                }
                TokKind::Kw(Kw::Not) if self.peek_at(1).is_kw(Kw::In) => {
                    self.bump();
                    self.bump();
                    comparisons.push((CmpOp::NotIn, self.parse_bitor()?));
                    continue;
                }
                _ => break,
            };
            self.bump();
            comparisons.push((op, self.parse_bitor()?));
        }
        if comparisons.is_empty() {
            return Ok(left);
        }
        let (line, col) = (left.line, left.col);
        Ok(Expr::new(
            line,
            col,
            ExprKind::Compare {
                left: Box::new(left),
                comparisons,
            },
        ))
    }

    fn parse_binary_level(
        &mut self,
        ops: &[Op],
        next: fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let mut left = next(self)?;
        loop {
            let matched = match self.peek().kind {
                TokKind::Op(op) if ops.contains(&op) => op,
                _ => break,
            };
            self.bump();
            let right = next(self)?;
            let (line, col) = (left.line, left.col);
            left = Expr::new(
                line,
                col,
                ExprKind::Binary {
                    op: matched,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
        Ok(left)
    }

    fn parse_bitor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[Op::Pipe], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[Op::Caret], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[Op::Amp], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[Op::Shl, Op::Shr], Self::parse_arith)
    }

    fn parse_arith(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[Op::Plus, Op::Minus], Self::parse_term)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            &[Op::Star, Op::Slash, Op::SlashSlash, Op::Percent],
            Self::parse_factor,
        )
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek().kind {
            TokKind::Op(Op::Minus) => Some(UnaryOp::Neg),
            TokKind::Op(Op::Plus) => Some(UnaryOp::Pos),
            TokKind::Op(Op::Tilde) => Some(UnaryOp::Invert),
            _ => None,
        };
        if let Some(op) = op {
            let tok = self.bump();
            let operand = self.parse_factor()?;
            return Ok(Expr::new(
                tok.line,
                tok.col,
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
            ));
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix()?;
        if self.peek().is_op(Op::StarStar) {
            self.bump();
            // Right associative: exponent re-enters at the unary level.
            let exponent = self.parse_factor()?;
            let (line, col) = (base.line, base.col);
            return Ok(Expr::new(
                line,
                col,
                ExprKind::Binary {
                    op: Op::StarStar,
                    left: Box::new(base),
                    right: Box::new(exponent),
                },
            ));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek().kind {
                TokKind::Op(Op::LParen) => {
                    self.bump();
                    let (args, kwargs) = self.parse_call_args()?;
                    self.expect_op(Op::RParen, "`)`")?;
                    let (line, col) = (expr.line, expr.col);
                    expr = Expr::new(
                        line,
                        col,
                        ExprKind::Call {
                            func: Box::new(expr),
                            args,
                            kwargs,
                        },
                    );
                }
                TokKind::Op(Op::Dot) => {
                    self.bump();
                    let attr = self.take_name("attribute name")?;
                    let (line, col) = (expr.line, expr.col);
                    expr = Expr::new(
                        line,
                        col,
                        ExprKind::Attribute {
                            value: Box::new(expr),
                            attr,
                        },
                    );
                }
                TokKind::Op(Op::LBracket) => {
                    self.bump();
                    let index = self.parse_test()?;
                    if self.peek().is_op(Op::Colon) {
                        return Err(self.error("slices are not supported"));
                    }
                    self.expect_op(Op::RBracket, "`]`")?;
                    let (line, col) = (expr.line, expr.col);
                    expr = Expr::new(
                        line,
                        col,
                        ExprKind::Subscript {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.peek().is_op(Op::RParen) {
            if self.peek().is_op(Op::Star) || self.peek().is_op(Op::StarStar) {
                return Err(self.error("argument unpacking is not supported"));
            }
            if let TokKind::Name(name) = &self.peek().kind
                && self.peek_at(1).is_op(Op::Eq)
            {
                let name = name.clone();
                self.bump();
                self.bump();
                kwargs.push((name, self.parse_test()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.parse_test()?);
            }
            if self.peek().is_op(Op::Comma) {
                self.bump();
            } else {
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let tok = self.peek();
        let (line, col) = (tok.line, tok.col);
        match &tok.kind {
            TokKind::Int(value) => {
                let value = *value;
                self.bump();
                Ok(Expr::new(line, col, ExprKind::Int(value)))
            }
            TokKind::Float(value) => {
                let value = *value;
                self.bump();
                Ok(Expr::new(line, col, ExprKind::Float(value)))
            }
            TokKind::Str { value, .. } => {
                let mut text = value.clone();
                self.bump();
                // Adjacent string literals concatenate.
                while let TokKind::Str { value, .. } = &self.peek().kind {
                    text.push_str(value);
                    self.bump();
                }
                Ok(Expr::new(line, col, ExprKind::Str(text)))
            }
            TokKind::Name(name) => {
                let name = name.clone();
                self.bump();
                Ok(Expr::new(line, col, ExprKind::Name(name)))
            }
            TokKind::Kw(Kw::None) => {
                self.bump();
                Ok(Expr::new(line, col, ExprKind::None_))
            }
            TokKind::Kw(Kw::True) => {
                self.bump();
                Ok(Expr::new(line, col, ExprKind::Bool(true)))
            }
            TokKind::Kw(Kw::False) => {
                self.bump();
                Ok(Expr::new(line, col, ExprKind::Bool(false)))
            }
            TokKind::Op(Op::LParen) => {
                self.bump();
                if self.peek().is_op(Op::RParen) {
                    self.bump();
                    return Ok(Expr::new(line, col, ExprKind::Tuple(Vec::new())));
                }
                let inner = self.parse_testlist()?;
                if self.peek().is_kw(Kw::For) {
                    return Err(self.error("generator expressions are not supported"));
                }
                self.expect_op(Op::RParen, "`)`")?;
                Ok(inner)
            }
            TokKind::Op(Op::LBracket) => {
                self.bump();
                if self.peek().is_op(Op::RBracket) {
                    self.bump();
                    return Ok(Expr::new(line, col, ExprKind::List(Vec::new())));
                }
                let first = self.parse_test()?;
                if self.peek().is_kw(Kw::For) {
                    self.bump();
                    let target = self.parse_target_list()?;
                    if !self.peek().is_kw(Kw::In) {
                        return Err(self.error("expected `in`"));
                    }
                    self.bump();
                    let iter = self.parse_or()?;
                    let cond = if self.peek().is_kw(Kw::If) {
                        self.bump();
                        Some(Box::new(self.parse_or()?))
                    } else {
                        None
                    };
                    if self.peek().is_kw(Kw::For) {
                        return Err(self.error("nested comprehensions are not supported"));
                    }
                    self.expect_op(Op::RBracket, "`]`")?;
                    return Ok(Expr::new(
                        line,
                        col,
                        ExprKind::ListComp {
                            element: Box::new(first),
                            target: Box::new(target),
                            iter: Box::new(iter),
                            cond,
                        },
                    ));
                }
                let mut items = vec![first];
                while self.peek().is_op(Op::Comma) {
                    self.bump();
                    if self.peek().is_op(Op::RBracket) {
                        break;
                    }
                    items.push(self.parse_test()?);
                }
                self.expect_op(Op::RBracket, "`]`")?;
                Ok(Expr::new(line, col, ExprKind::List(items)))
            }
            TokKind::Op(Op::LBrace) => {
                self.bump();
                if self.peek().is_op(Op::RBrace) {
                    self.bump();
                    return Ok(Expr::new(line, col, ExprKind::Dict(Vec::new())));
                }
                let key = self.parse_test()?;
                if !self.peek().is_op(Op::Colon) {
                    return Err(self.error("set displays are not supported"));
                }
                self.bump();
                let value = self.parse_test()?;
                let mut pairs = vec![(key, value)];
                while self.peek().is_op(Op::Comma) {
                    self.bump();
                    if self.peek().is_op(Op::RBrace) {
                        break;
                    }
                    let key = self.parse_test()?;
                    self.expect_op(Op::Colon, "`:`")?;
                    let value = self.parse_test()?;
                    pairs.push((key, value));
                }
                self.expect_op(Op::RBrace, "`}`")?;
                Ok(Expr::new(line, col, ExprKind::Dict(pairs)))
            }
            _ => Err(self.error("expected an expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> Module {
        parse_module(&lex(source).unwrap()).unwrap()
    }

    fn parse_err(source: &str) -> ParseError {
        parse_module(&lex(source).unwrap()).unwrap_err()
    }

    #[test]
    fn assignment_and_expression_statements() {
        let module = parse("x = 1\nx + 1\n");
        assert_eq!(module.body.len(), 2);
        assert!(matches!(module.body[0].kind, StmtKind::Assign { .. }));
        assert!(matches!(module.body[1].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn chained_assignment_collects_targets() {
        let module = parse("a = b = 3\n");
        match &module.body[0].kind {
            StmtKind::Assign { targets, .. } => assert_eq!(targets.len(), 2),
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn augmented_assignment_keeps_operator() {
        let module = parse("total += 2\n");
        match &module.body[0].kind {
            StmtKind::AugAssign { op, .. } => assert_eq!(*op, Op::PlusEq),
            other => panic!("expected augmented assign, got {other:?}"),
        }
    }

    #[test]
    fn comparison_chains_parse_flat() {
        let module = parse("ok = 0 < x <= 10\n");
        match &module.body[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Compare { comparisons, .. } => assert_eq!(comparisons.len(), 2),
                other => panic!("expected comparison, got {other:?}"),
            },
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn function_definition_with_defaults() {
        let module = parse("def scale(x, factor=2):\n    return x * factor\n");
        match &module.body[0].kind {
            StmtKind::FuncDef { name, params, body } => {
                assert_eq!(name, "scale");
                assert_eq!(params.len(), 2);
                assert!(params[1].default.is_some());
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected def, got {other:?}"),
        }
    }

    #[test]
    fn for_loop_tuple_target() {
        let module = parse("for i, v in enumerate(xs):\n    print(i, v)\n");
        match &module.body[0].kind {
            StmtKind::For { target, .. } => {
                assert!(matches!(target.kind, ExprKind::Tuple(_)))
            }
            other => panic!("expected for, got {other:?}"),
        }
    }

    #[test]
    fn imports_bind_aliases() {
        let module = parse("import math\nfrom math import sqrt as root\n");
        match &module.body[0].kind {
            StmtKind::Import(aliases) => assert_eq!(aliases[0].binds(), "math"),
            other => panic!("expected import, got {other:?}"),
        }
        match &module.body[1].kind {
            StmtKind::ImportFrom { names, .. } => assert_eq!(names[0].binds(), "root"),
            other => panic!("expected from-import, got {other:?}"),
        }
    }

    #[test]
    fn walrus_and_conditional_expressions() {
        let module = parse("y = (n := 10) if flag else 0\n");
        match &module.body[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::IfElse { .. }))
            }
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn list_comprehension_single_generator() {
        let module = parse("squares = [x * x for x in range(4) if x > 0]\n");
        match &module.body[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::ListComp { .. }))
            }
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_constructs_name_themselves() {
        assert!(parse_err("try:\n    pass\n").message.contains("try"));
        assert!(parse_err("@memo\ndef f():\n    pass\n").message.contains("decorators"));
        assert!(parse_err("xs[1:2]\n").message.contains("slices"));
        assert!(parse_err("{1, 2}\n").message.contains("set displays"));
    }

    #[test]
    fn cannot_assign_to_literal() {
        let err = parse_err("1 = x\n");
        assert!(err.message.contains("cannot assign"));
    }

    #[test]
    fn adjacent_strings_concatenate() {
        let module = parse("s = 'a' 'b'\n");
        match &module.body[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Str(text) => assert_eq!(text, "ab"),
                other => panic!("expected string, got {other:?}"),
            },
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn attribute_and_subscript_postfix() {
        let module = parse("value = table.rows[0]\n");
        match &module.body[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::Subscript { .. }))
            }
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn inline_suite_allows_semicolons() {
        let module = parse("if ready: x = 1; y = 2\n");
        match &module.body[0].kind {
            StmtKind::If { branches, .. } => assert_eq!(branches[0].1.len(), 2),
            other => panic!("expected if, got {other:?}"),
        }
    }
}
