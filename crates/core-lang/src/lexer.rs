//! Indentation-aware lexer for the embedded dialect.
//!
//! Produces a flat token stream with explicit `Newline`/`Indent`/`Dedent`
//! structure tokens, Python style. Comments are kept in the stream (the
//! notebook parser recognizes cell markers from them); blank and
//! comment-only lines produce no structure tokens. Newlines inside brackets
//! and after a trailing backslash join physical lines into one logical line.

use thiserror::Error;

use crate::token::{Op, TokKind, Token, keyword};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (line {line}, column {col})")]
pub struct LexError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl LexError {
    fn new(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            col,
            message: message.into(),
        }
    }
}

/// Tokenize a complete source fragment.
pub fn lex(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).run()
}

const TAB_WIDTH: usize = 8;

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    /// Open bracket depth; newlines are insignificant while positive.
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
    at_line_start: bool,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            depth: 0,
            indents: vec![0],
            tokens: Vec::new(),
            at_line_start: true,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        match c {
            '\n' => {
                self.line += 1;
                self.col = 1;
            }
            '\t' => {
                self.col = ((self.col - 1) / TAB_WIDTH + 1) * TAB_WIDTH + 1;
            }
            _ => self.col += 1,
        }
        Some(c)
    }

    fn push(&mut self, line: usize, col: usize, kind: TokKind) {
        self.tokens.push(Token::new(line, col, kind));
    }

    fn err(&self, message: impl Into<String>) -> LexError {
        LexError::new(self.line, self.col, message)
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        loop {
            if self.at_line_start && self.depth == 0 {
                if !self.handle_line_start()? {
                    break;
                }
                continue;
            }

            // Inter-token whitespace on a continuing logical line.
            while matches!(self.peek(), Some(' ' | '\t' | '\r')) {
                self.advance();
            }

            let (line, col) = (self.line, self.col);
            let Some(c) = self.peek() else {
                break;
            };

            match c {
                '\n' => {
                    self.advance();
                    if self.depth == 0 {
                        self.push(line, col, TokKind::Newline);
                        self.at_line_start = true;
                    }
                }
                '#' => {
                    let text = self.take_comment();
                    self.push(
                        line,
                        col,
                        TokKind::Comment {
                            text,
                            line_start: false,
                        },
                    );
                }
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.advance();
                    self.advance();
                    // Explicit continuation: the next physical line's leading
                    // whitespace is ordinary inter-token whitespace.
                }
                '\\' => return Err(self.err("unexpected character after line continuation")),
                c if c == '_' || c.is_alphabetic() => self.lex_word(line, col)?,
                c if c.is_ascii_digit() => self.lex_number(line, col)?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                    self.lex_number(line, col)?
                }
                '"' | '\'' => self.lex_string(line, col, false)?,
                _ => self.lex_operator(line, col)?,
            }
        }

        // Close the final logical line and rewind the indentation stack.
        if !self.at_line_start {
            self.push(self.line, self.col, TokKind::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(self.line, self.col, TokKind::Dedent);
        }
        self.push(self.line, self.col, TokKind::Eof);
        Ok(self.tokens)
    }

    /// Measure indentation and classify the line. Returns false at EOF.
    fn handle_line_start(&mut self) -> Result<bool, LexError> {
        let mut indent = 0usize;
        loop {
            match self.peek() {
                Some(' ') => {
                    indent += 1;
                    self.advance();
                }
                Some('\t') => {
                    indent = (indent / TAB_WIDTH + 1) * TAB_WIDTH;
                    self.advance();
                }
                Some('\r') => {
                    self.advance();
                }
                _ => break,
            }
        }

        match self.peek() {
            None => Ok(false),
            Some('\n') => {
                self.advance();
                Ok(true)
            }
            Some('#') => {
                let (line, col) = (self.line, self.col);
                let text = self.take_comment();
                self.push(
                    line,
                    col,
                    TokKind::Comment {
                        text,
                        line_start: true,
                    },
                );
                if self.peek() == Some('\n') {
                    self.advance();
                }
                Ok(true)
            }
            Some(_) => {
                let current = *self.indents.last().unwrap_or(&0);
                if indent > current {
                    self.indents.push(indent);
                    self.push(self.line, self.col, TokKind::Indent);
                } else if indent < current {
                    while self.indents.last().is_some_and(|&top| top > indent) {
                        self.indents.pop();
                        self.push(self.line, self.col, TokKind::Dedent);
                    }
                    if self.indents.last() != Some(&indent) {
                        return Err(self
                            .err("unindent does not match any outer indentation level"));
                    }
                }
                self.at_line_start = false;
                Ok(true)
            }
        }
    }

    fn take_comment(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            text.push(c);
            self.advance();
        }
        text
    }

    fn lex_word(&mut self, line: usize, col: usize) -> Result<(), LexError> {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }

        // String prefixes: raw strings are supported, byte/format strings are
        // outside the dialect.
        if matches!(self.peek(), Some('"' | '\'')) && word.len() <= 2 {
            let lowered = word.to_ascii_lowercase();
            if lowered == "r" {
                return self.lex_string(line, col, true);
            }
            if lowered.chars().all(|c| matches!(c, 'r' | 'b' | 'f' | 'u')) {
                return Err(LexError::new(line, col, format!("unsupported string prefix `{word}`")));
            }
        }

        let kind = match keyword(&word) {
            Some(kw) => TokKind::Kw(kw),
            None => TokKind::Name(word),
        };
        self.push(line, col, kind);
        Ok(())
    }

    fn lex_number(&mut self, line: usize, col: usize) -> Result<(), LexError> {
        let mut text = String::new();

        if self.peek() == Some('0')
            && matches!(self.peek_at(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B'))
        {
            self.advance();
            let radix_char = self.advance().unwrap_or('x');
            let radix = match radix_char.to_ascii_lowercase() {
                'x' => 16,
                'o' => 8,
                _ => 2,
            };
            while let Some(c) = self.peek() {
                if c == '_' || c.is_ascii_alphanumeric() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            let cleaned: String = text.chars().filter(|&c| c != '_').collect();
            let value = i64::from_str_radix(&cleaned, radix)
                .map_err(|_| LexError::new(line, col, "invalid numeric literal"))?;
            self.push(line, col, TokKind::Int(value));
            return Ok(());
        }

        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | '_' => {
                    text.push(c);
                    self.advance();
                }
                '.' if !is_float => {
                    is_float = true;
                    text.push(c);
                    self.advance();
                }
                'e' | 'E' => {
                    is_float = true;
                    text.push(c);
                    self.advance();
                    if matches!(self.peek(), Some('+' | '-'))
                        && let Some(sign) = self.advance()
                    {
                        text.push(sign);
                    }
                }
                _ => break,
            }
        }

        let cleaned: String = text.chars().filter(|&c| c != '_').collect();
        if is_float {
            let value: f64 = cleaned
                .parse()
                .map_err(|_| LexError::new(line, col, "invalid numeric literal"))?;
            self.push(line, col, TokKind::Float(value));
        } else {
            let value: i64 = cleaned
                .parse()
                .map_err(|_| LexError::new(line, col, "integer literal out of range"))?;
            self.push(line, col, TokKind::Int(value));
        }
        Ok(())
    }

    fn lex_string(&mut self, line: usize, col: usize, raw: bool) -> Result<(), LexError> {
        let quote = self.advance().ok_or_else(|| self.err("expected string"))?;
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }

        let mut value = String::new();
        let mut raw_body = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(LexError::new(line, col, "unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    self.advance();
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.advance();
                    self.advance();
                    self.advance();
                    break;
                }
                raw_body.push(c);
                value.push(c);
                self.advance();
                continue;
            }
            if c == '\n' && !triple {
                return Err(LexError::new(line, col, "EOL while scanning string literal"));
            }
            if c == '\\' && !raw {
                self.advance();
                let Some(escaped) = self.advance() else {
                    return Err(LexError::new(line, col, "unterminated string literal"));
                };
                raw_body.push('\\');
                raw_body.push(escaped);
                match escaped {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '0' => value.push('\0'),
                    '\\' => value.push('\\'),
                    '\'' => value.push('\''),
                    '"' => value.push('"'),
                    '\n' => {} // escaped newline joins lines
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
                continue;
            }
            raw_body.push(c);
            value.push(c);
            self.advance();
        }

        let end_line = self.line;
        self.push(
            line,
            col,
            TokKind::Str {
                value,
                raw_body,
                triple,
                end_line,
            },
        );
        Ok(())
    }

    fn lex_operator(&mut self, line: usize, col: usize) -> Result<(), LexError> {
        let three: String = (0..3).filter_map(|i| self.peek_at(i)).collect();
        let op3 = match three.as_str() {
            "**=" => Some(Op::StarStarEq),
            "//=" => Some(Op::SlashSlashEq),
            "<<=" => Some(Op::ShlEq),
            ">>=" => Some(Op::ShrEq),
            _ => None,
        };
        if let Some(op) = op3 {
            for _ in 0..3 {
                self.advance();
            }
            self.push(line, col, TokKind::Op(op));
            return Ok(());
        }

        let two: String = (0..2).filter_map(|i| self.peek_at(i)).collect();
        let op2 = match two.as_str() {
            "**" => Some(Op::StarStar),
            "//" => Some(Op::SlashSlash),
            "<<" => Some(Op::Shl),
            ">>" => Some(Op::Shr),
            "<=" => Some(Op::Le),
            ">=" => Some(Op::Ge),
            "==" => Some(Op::EqEq),
            "!=" => Some(Op::NotEq),
            "+=" => Some(Op::PlusEq),
            "-=" => Some(Op::MinusEq),
            "*=" => Some(Op::StarEq),
            "/=" => Some(Op::SlashEq),
            "%=" => Some(Op::PercentEq),
            "&=" => Some(Op::AmpEq),
            "|=" => Some(Op::PipeEq),
            "^=" => Some(Op::CaretEq),
            ":=" => Some(Op::Walrus),
            "->" => Some(Op::Arrow),
            _ => None,
        };
        if let Some(op) = op2 {
            self.advance();
            self.advance();
            self.push(line, col, TokKind::Op(op));
            return Ok(());
        }

        let c = self.peek().unwrap_or('\0');
        let op1 = match c {
            '+' => Op::Plus,
            '-' => Op::Minus,
            '*' => Op::Star,
            '/' => Op::Slash,
            '%' => Op::Percent,
            '&' => Op::Amp,
            '|' => Op::Pipe,
            '^' => Op::Caret,
            '~' => Op::Tilde,
            '<' => Op::Lt,
            '>' => Op::Gt,
            '=' => Op::Eq,
            '(' => Op::LParen,
            ')' => Op::RParen,
            '[' => Op::LBracket,
            ']' => Op::RBracket,
            '{' => Op::LBrace,
            '}' => Op::RBrace,
            ',' => Op::Comma,
            ':' => Op::Colon,
            '.' => Op::Dot,
            ';' => Op::Semi,
            '@' => Op::At,
            _ => return Err(self.err(format!("invalid character `{c}`"))),
        };
        match op1 {
            Op::LParen | Op::LBracket | Op::LBrace => self.depth += 1,
            Op::RParen | Op::RBracket | Op::RBrace => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.advance();
        self.push(line, col, TokKind::Op(op1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Kw;

    fn kinds(source: &str) -> Vec<TokKind> {
        lex(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn simple_assignment_tokens() {
        let toks = kinds("x = 1\n");
        assert_eq!(
            toks,
            vec![
                TokKind::Name("x".into()),
                TokKind::Op(Op::Eq),
                TokKind::Int(1),
                TokKind::Newline,
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn indentation_produces_structure_tokens() {
        let toks = kinds("if x:\n    y = 1\nz = 2\n");
        let indents = toks.iter().filter(|t| matches!(t, TokKind::Indent)).count();
        let dedents = toks.iter().filter(|t| matches!(t, TokKind::Dedent)).count();
        assert_eq!(indents, 1);
        assert_eq!(dedents, 1);
    }

    #[test]
    fn blank_and_comment_lines_do_not_dedent() {
        let toks = kinds("if x:\n    a = 1\n\n    # note\n    b = 2\n");
        let dedents = toks.iter().filter(|t| matches!(t, TokKind::Dedent)).count();
        assert_eq!(dedents, 1, "only the final implicit dedent");
    }

    #[test]
    fn newline_inside_brackets_is_insignificant() {
        let toks = kinds("xs = [1,\n      2]\n");
        let newlines = toks.iter().filter(|t| matches!(t, TokKind::Newline)).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn triple_string_records_end_line() {
        let toks = lex("\"\"\"a\nb\"\"\"\n").unwrap();
        match &toks[0].kind {
            TokKind::Str {
                value,
                triple,
                end_line,
                ..
            } => {
                assert_eq!(value, "a\nb");
                assert!(triple);
                assert_eq!(*end_line, 2);
            }
            other => panic!("expected string token, got {other:?}"),
        }
    }

    #[test]
    fn line_start_comment_flagged() {
        let toks = lex("# %% setup\nx = 1  # trailing\n").unwrap();
        match &toks[0].kind {
            TokKind::Comment { text, line_start } => {
                assert!(line_start);
                assert_eq!(text, "# %% setup");
            }
            other => panic!("expected comment, got {other:?}"),
        }
        assert!(toks.iter().any(|t| matches!(
            &t.kind,
            TokKind::Comment { line_start: false, .. }
        )));
    }

    #[test]
    fn keywords_are_not_names() {
        let toks = kinds("for x in xs:\n    pass\n");
        assert!(matches!(toks[0], TokKind::Kw(Kw::For)));
        assert!(matches!(toks[2], TokKind::Kw(Kw::In)));
    }

    #[test]
    fn escape_processing_and_raw_body_differ() {
        let toks = lex("s = 'a\\nb'\n").unwrap();
        match &toks[2].kind {
            TokKind::Str { value, raw_body, .. } => {
                assert_eq!(value, "a\nb");
                assert_eq!(raw_body, "a\\nb");
            }
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(lex("s = 'oops\n").is_err());
        assert!(lex("s = \"\"\"never closed\n").is_err());
    }

    #[test]
    fn backslash_continuation_joins_lines() {
        let toks = kinds("total = 1 + \\\n    2\n");
        let newlines = toks.iter().filter(|t| matches!(t, TokKind::Newline)).count();
        assert_eq!(newlines, 1);
        assert!(!toks.iter().any(|t| matches!(t, TokKind::Indent)));
    }
}
