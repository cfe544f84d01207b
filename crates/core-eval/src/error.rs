//! Runtime error type and context-excerpt formatting.

use core_cell::{ExecError, ExecErrorKind};
use unicode_width::UnicodeWidthStr;

/// Error raised while executing one cell. Carries the position inside the
/// cell's source; conversion to [`ExecError`] renders the context excerpt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    pub kind: ExecErrorKind,
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl RunError {
    pub fn new(kind: ExecErrorKind, message: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            kind,
            message: message.into(),
            line,
            col,
        }
    }

    pub fn name(message: impl Into<String>, line: usize, col: usize) -> Self {
        Self::new(ExecErrorKind::Name, message, line, col)
    }

    pub fn runtime(message: impl Into<String>, line: usize, col: usize) -> Self {
        Self::new(ExecErrorKind::Runtime, message, line, col)
    }

    pub fn other(message: impl Into<String>, line: usize, col: usize) -> Self {
        Self::new(ExecErrorKind::Other, message, line, col)
    }

    pub fn timeout(line: usize) -> Self {
        Self::new(
            ExecErrorKind::Timeout,
            "execution exceeded the configured time limit",
            line,
            0,
        )
    }

    pub fn into_exec_error(self, source: &str) -> ExecError {
        let context = format_context(source, self.line, self.col);
        ExecError::new(self.kind, self.message, context)
    }
}

/// Render a pointer at `line`/`col` of `source` (both 1-based; a zero column
/// omits the caret). The excerpt is what renderers show verbatim, so it
/// never includes engine frames, only the offending cell line.
pub fn format_context(source: &str, line: usize, col: usize) -> String {
    if line == 0 {
        return String::new();
    }
    let Some(text) = source.split('\n').nth(line - 1) else {
        return format!("  line {line}");
    };
    let mut out = format!("  line {line}\n    {text}");
    if col > 0 && col <= text.chars().count() + 1 {
        let prefix: String = text.chars().take(col - 1).collect();
        let pad = UnicodeWidthStr::width(prefix.as_str());
        out.push_str("\n    ");
        out.push_str(&" ".repeat(pad));
        out.push('^');
    }
    out
}
