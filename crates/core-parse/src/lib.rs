//! Notebook source parser: percent-delimited text to an ordered cell
//! sequence.
//!
//! Two boundary syntaxes exist, following the jupytext percent convention:
//!
//! 1. Marker lines whose first non-whitespace content is `# %%`, carrying an
//!    optional title, `[kind]` selector, and `key=value` metadata.
//! 2. Top-level triple-quoted string literals standing alone as expression
//!    statements. Detection is syntactic, via the dialect lexer, so
//!    `x = """…"""` is never mistaken for a boundary.
//!
//! A marker-opened prose cell consumes the run of comment lines that follows
//! it (leading `#` stripped); the first non-comment line closes it and opens
//! a code cell. Cells whose trimmed content is empty are not emitted. If the
//! source cannot be tokenized at all the whole file becomes one code cell so
//! the evaluator can surface the syntax error with proper context.

pub mod marker;

use core_cell::{Cell, CellKind, CellSequence};
use core_lang::lexer::lex;
use core_lang::token::TokKind;
use tracing::{debug, warn};

pub use marker::{is_marker_line, parse_marker, render_marker};

#[derive(Debug)]
enum Boundary {
    Marker {
        line: usize,
        kind: CellKind,
        metadata: core_cell::Metadata,
    },
    ProseLiteral {
        start_line: usize,
        end_line: usize,
        body: String,
    },
}

impl Boundary {
    fn line(&self) -> usize {
        match self {
            Boundary::Marker { line, .. } => *line,
            Boundary::ProseLiteral { start_line, .. } => *start_line,
        }
    }
}

/// Parse a full source text into its cell sequence.
pub fn parse(source: &str) -> CellSequence {
    if source.trim().is_empty() {
        return Vec::new();
    }

    let tokens = match lex(source) {
        Ok(tokens) => tokens,
        Err(err) => {
            // Degraded mode: one cell carrying the whole file; execution
            // will report the underlying syntax error in context.
            warn!(target: "parse", %err, "source not tokenizable, emitting whole-file cell");
            return vec![Cell::code(source.trim(), 1)];
        }
    };

    let lines: Vec<&str> = source.split('\n').collect();
    let boundaries = find_boundaries(&tokens);
    debug!(target: "parse", boundaries = boundaries.len(), lines = lines.len(), "boundary_scan");

    let mut cells = Vec::new();
    // The implicit initial cell: code, opens at line 1 with no marker.
    let mut open_kind = CellKind::Code;
    let mut open_line = 1usize;
    let mut content_first = 1usize;
    let mut open_meta = core_cell::Metadata::new();
    let mut marker_opened = false;

    for boundary in boundaries {
        let boundary_line = boundary.line();
        close_region(
            &mut cells,
            &lines,
            open_kind,
            open_line,
            content_first,
            boundary_line.saturating_sub(1),
            std::mem::take(&mut open_meta),
            marker_opened,
        );
        match boundary {
            Boundary::Marker {
                line,
                kind,
                metadata,
            } => {
                open_kind = kind;
                open_line = line;
                content_first = line + 1;
                open_meta = metadata;
                marker_opened = true;
            }
            Boundary::ProseLiteral {
                start_line,
                end_line,
                body,
            } => {
                let content = body.trim();
                if !content.is_empty() {
                    cells.push(Cell::prose(content, start_line));
                }
                open_kind = CellKind::Code;
                open_line = end_line + 1;
                content_first = end_line + 1;
                open_meta = core_cell::Metadata::new();
                marker_opened = false;
            }
        }
    }

    close_region(
        &mut cells,
        &lines,
        open_kind,
        open_line,
        content_first,
        lines.len(),
        open_meta,
        marker_opened,
    );
    cells
}

/// Emit the cell(s) for the region spanning `content_first..=content_last`
/// (1-based, inclusive, possibly empty).
#[allow(clippy::too_many_arguments)]
fn close_region(
    cells: &mut Vec<Cell>,
    lines: &[&str],
    kind: CellKind,
    open_line: usize,
    content_first: usize,
    content_last: usize,
    metadata: core_cell::Metadata,
    marker_opened: bool,
) {
    if content_first > content_last {
        return;
    }
    let region = &lines[content_first - 1..content_last.min(lines.len())];

    match kind {
        CellKind::Code => {
            let body = region.join("\n");
            let trimmed = body.trim();
            if !trimmed.is_empty() {
                cells.push(Cell::code(trimmed, open_line).with_metadata(metadata));
            }
        }
        CellKind::Prose => {
            debug_assert!(marker_opened, "prose regions only open via markers");
            // Comment-continuation body: consecutive `#` lines belong to the
            // prose cell; the first other line reopens code.
            let mut body_lines = Vec::new();
            let mut rest_start = None;
            for (offset, line) in region.iter().enumerate() {
                if line.trim_start().starts_with('#') {
                    let stripped = line
                        .trim_start()
                        .strip_prefix('#')
                        .map(|s| s.strip_prefix(' ').unwrap_or(s))
                        .unwrap_or_default();
                    body_lines.push(stripped);
                } else if line.trim().is_empty() && body_lines.is_empty() {
                    // Leading blank lines before the prose body.
                    continue;
                } else {
                    rest_start = Some(content_first + offset);
                    break;
                }
            }
            let body = body_lines.join("\n");
            let trimmed = body.trim();
            if !trimmed.is_empty() {
                cells.push(Cell::prose(trimmed, open_line).with_metadata(metadata));
            }
            if let Some(code_first) = rest_start {
                close_region(
                    cells,
                    lines,
                    CellKind::Code,
                    code_first,
                    code_first,
                    content_last,
                    core_cell::Metadata::new(),
                    false,
                );
            }
        }
    }
}

/// Locate every boundary in the token stream, in line order.
fn find_boundaries(tokens: &[core_lang::token::Token]) -> Vec<Boundary> {
    let mut boundaries = Vec::new();
    let mut indent = 0usize;
    let mut at_stmt_start = true;

    for (i, tok) in tokens.iter().enumerate() {
        match &tok.kind {
            TokKind::Comment { text, line_start } => {
                if *line_start && is_marker_line(text) {
                    let (kind, metadata) = parse_marker(text);
                    boundaries.push(Boundary::Marker {
                        line: tok.line,
                        kind,
                        metadata,
                    });
                }
            }
            TokKind::Newline => at_stmt_start = true,
            TokKind::Indent => {
                indent += 1;
                at_stmt_start = true;
            }
            TokKind::Dedent => {
                indent = indent.saturating_sub(1);
                at_stmt_start = true;
            }
            TokKind::Str {
                triple: true,
                end_line,
                raw_body,
                ..
            } if at_stmt_start && indent == 0 && next_ends_statement(tokens, i) => {
                boundaries.push(Boundary::ProseLiteral {
                    start_line: tok.line,
                    end_line: *end_line,
                    body: raw_body.clone(),
                });
                at_stmt_start = false;
            }
            TokKind::Eof => {}
            _ => at_stmt_start = false,
        }
    }

    boundaries.sort_by_key(Boundary::line);
    boundaries
}

/// True when the token after `i` (ignoring comments) terminates a statement,
/// i.e. the string at `i` stands alone as an expression statement.
fn next_ends_statement(tokens: &[core_lang::token::Token], i: usize) -> bool {
    tokens[i + 1..]
        .iter()
        .find(|t| !matches!(t.kind, TokKind::Comment { .. }))
        .is_none_or(|t| matches!(t.kind, TokKind::Newline | TokKind::Eof))
}

/// Re-emit a cell sequence as source text, re-introducing boundaries.
///
/// Inverse of [`parse`] for canonical sequences (cell bodies already
/// trimmed, prose bodies free of triple quotes). The first cell omits its
/// marker when it is a plain code cell starting at line 1 with no metadata.
pub fn reconstruct(cells: &[Cell]) -> String {
    let mut out = String::new();
    for (index, cell) in cells.iter().enumerate() {
        match cell.kind {
            CellKind::Code => {
                if index > 0 || !cell.metadata.is_empty() {
                    out.push_str(&render_marker(CellKind::Code, &cell.metadata));
                    out.push('\n');
                }
                out.push_str(&cell.source);
                out.push('\n');
            }
            CellKind::Prose => {
                if cell.metadata.is_empty() {
                    out.push_str("\"\"\"\n");
                    out.push_str(&cell.source);
                    out.push_str("\n\"\"\"\n");
                } else {
                    out.push_str(&render_marker(CellKind::Prose, &cell.metadata));
                    out.push('\n');
                    for line in cell.source.lines() {
                        if line.is_empty() {
                            out.push_str("#\n");
                        } else {
                            out.push_str("# ");
                            out.push_str(line);
                            out.push('\n');
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds_and_sources(cells: &[Cell]) -> Vec<(CellKind, &str)> {
        cells.iter().map(|c| (c.kind, c.source.as_str())).collect()
    }

    #[test]
    fn implicit_initial_code_cell() {
        let cells = parse("x = 1\ny = 2\n");
        assert_eq!(kinds_and_sources(&cells), vec![(CellKind::Code, "x = 1\ny = 2")]);
        assert_eq!(cells[0].line_start, 1);
    }

    #[test]
    fn marker_splits_cells_and_carries_title() {
        let cells = parse("# %% A\nx = 1\n# %% B\ny = x + 1\n");
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].title(), Some("A"));
        assert_eq!(cells[0].source, "x = 1");
        assert_eq!(cells[0].line_start, 1);
        assert_eq!(cells[1].title(), Some("B"));
        assert_eq!(cells[1].line_start, 3);
    }

    #[test]
    fn prose_literal_boundary() {
        let cells = parse("\"\"\"Intro\"\"\"\nx = 1\n");
        assert_eq!(
            kinds_and_sources(&cells),
            vec![(CellKind::Prose, "Intro"), (CellKind::Code, "x = 1")]
        );
        assert_eq!(cells[0].line_start, 1);
        assert_eq!(cells[1].line_start, 2);
    }

    #[test]
    fn assignment_string_is_not_a_boundary() {
        let cells = parse("x = \"\"\"hi\"\"\"\n\"\"\"bye\"\"\"\n");
        assert_eq!(
            kinds_and_sources(&cells),
            vec![
                (CellKind::Code, "x = \"\"\"hi\"\"\""),
                (CellKind::Prose, "bye"),
            ]
        );
    }

    #[test]
    fn multiline_prose_literal() {
        let cells = parse("\"\"\"\n# Heading\n\nBody text.\n\"\"\"\nz = 3\n");
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].kind, CellKind::Prose);
        assert_eq!(cells[0].source, "# Heading\n\nBody text.");
        assert_eq!(cells[1].source, "z = 3");
        assert_eq!(cells[1].line_start, 6);
    }

    #[test]
    fn adjacent_prose_literals_stay_distinct() {
        let cells = parse("\"\"\"one\"\"\"\n\"\"\"two\"\"\"\n");
        assert_eq!(
            kinds_and_sources(&cells),
            vec![(CellKind::Prose, "one"), (CellKind::Prose, "two")]
        );
        assert_eq!(cells[0].line_start, 1);
        assert_eq!(cells[1].line_start, 2);
    }

    #[test]
    fn marker_markdown_consumes_comment_lines() {
        let cells = parse("# %% Notes [markdown]\n# First line\n# Second line\nx = 1\n");
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].kind, CellKind::Prose);
        assert_eq!(cells[0].source, "First line\nSecond line");
        assert_eq!(cells[0].title(), Some("Notes"));
        assert_eq!(cells[1].kind, CellKind::Code);
        assert_eq!(cells[1].source, "x = 1");
        assert_eq!(cells[1].line_start, 4);
    }

    #[test]
    fn docstring_inside_function_is_not_a_boundary() {
        let source = "def f():\n    \"\"\"doc\"\"\"\n    return 1\n";
        let cells = parse(source);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].kind, CellKind::Code);
    }

    #[test]
    fn marker_inside_string_is_not_a_boundary() {
        let source = "s = \"\"\"\n# %% not a marker\n\"\"\"\ny = 2\n";
        let cells = parse(source);
        assert_eq!(cells.len(), 1, "string content must not split cells: {cells:?}");
    }

    #[test]
    fn empty_cells_are_not_emitted() {
        let cells = parse("# %% A\n\n\n# %% B\nx = 1\n");
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].title(), Some("B"));
    }

    #[test]
    fn untokenizable_source_falls_back_to_whole_file_cell() {
        let source = "x = 'unterminated\ny = 2\n";
        let cells = parse(source);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].kind, CellKind::Code);
        assert_eq!(cells[0].source, source.trim());
        assert_eq!(cells[0].line_start, 1);
    }

    #[test]
    fn empty_source_yields_no_cells() {
        assert!(parse("").is_empty());
        assert!(parse("\n\n").is_empty());
    }

    #[test]
    fn blank_lines_belong_to_preceding_cell() {
        let cells = parse("# %% A\nx = 1\n\n\n# %% B\ny = 2\n");
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].source, "x = 1", "trailing blanks trimmed");
    }

    #[test]
    fn reconstruct_then_parse_preserves_cells() {
        let source = "# %% Setup\nx = 1\n# %% Notes [markdown]\n# hello\n# %% Compute\ny = x + 1\n";
        let cells = parse(source);
        let rebuilt = reconstruct(&cells);
        let reparsed = parse(&rebuilt);
        assert_eq!(
            kinds_and_sources(&cells),
            kinds_and_sources(&reparsed),
            "round trip must preserve kinds and bodies"
        );
        let metas: Vec<_> = cells.iter().map(|c| c.metadata.clone()).collect();
        let metas2: Vec<_> = reparsed.iter().map(|c| c.metadata.clone()).collect();
        assert_eq!(metas, metas2);
    }
}
