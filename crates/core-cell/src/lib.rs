//! Cell model: the immutable unit of parsing, scheduling, and display.
//!
//! A notebook source file parses into an ordered sequence of [`Cell`]s. A
//! cell is immutable once parsed; execution state is attached afterwards as a
//! [`RunRecord`] (either produced by the evaluator or carried forward from
//! the previous pass). The content hash is computed once at construction and
//! is the sole basis for cell identity across passes — positions may drift
//! without invalidating a cell.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Fixed-seed hasher state so content hashes are stable for the lifetime of
/// the process. The hash is used only for equality between passes, never for
/// anything cryptographic.
static HASH_STATE: LazyLock<ahash::RandomState> =
    LazyLock::new(|| ahash::RandomState::with_seeds(0x6f6c6f66, 0x6c6c6563, 0x68736168, 0x65746174));

/// Stable digest of a cell's source text.
pub fn content_hash(source: &str) -> u64 {
    HASH_STATE.hash_one(source)
}

/// Cell flavor: executable code or documentation prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellKind {
    Code,
    Prose,
}

/// Name-set annotation attached to code cells by the dependency analyzer.
///
/// `provides` holds every name the cell can bind at module scope;
/// `requires` holds every free name the cell reads. Both are ordered sets so
/// snapshots and log lines are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub provides: BTreeSet<String>,
    pub requires: BTreeSet<String>,
}

impl Analysis {
    pub fn new(provides: BTreeSet<String>, requires: BTreeSet<String>) -> Self {
        Self { provides, requires }
    }
}

/// Error kinds surfaced by the evaluator, mirroring the taxonomy the
/// scheduler cares about (a previously errored cell is always re-run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecErrorKind {
    Syntax,
    Name,
    Runtime,
    Timeout,
    Other,
}

/// Structured execution failure attached to a [`RunRecord`].
///
/// `context` is a pre-formatted excerpt pointing at the offending line; it is
/// produced by the evaluator so renderers never need source access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecError {
    pub kind: ExecErrorKind,
    pub message: String,
    pub context: String,
}

impl ExecError {
    pub fn new(kind: ExecErrorKind, message: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: context.into(),
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Closed union of display artifacts a cell value can render as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Renderable {
    Text(String),
    Html(String),
    Markdown(String),
    Png(Vec<u8>),
    Jpeg(Vec<u8>),
    Svg(String),
    Latex(String),
    Json(String),
}

impl Renderable {
    /// Short tag used in log lines and CLI summaries.
    pub fn tag(&self) -> &'static str {
        match self {
            Renderable::Text(_) => "text",
            Renderable::Html(_) => "html",
            Renderable::Markdown(_) => "markdown",
            Renderable::Png(_) => "png",
            Renderable::Jpeg(_) => "jpeg",
            Renderable::Svg(_) => "svg",
            Renderable::Latex(_) => "latex",
            Renderable::Json(_) => "json",
        }
    }
}

/// Outputs of executing one code cell once.
///
/// Invariants (enforced by the constructors):
/// * `error` is `Some` exactly when the run did not complete.
/// * `value` is `None` whenever `error` is `Some`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Monotone execution counter, strictly increasing across the process
    /// lifetime regardless of which cell ran.
    pub counter: u64,
    pub stdout: String,
    pub stderr: String,
    pub value: Option<Renderable>,
    pub error: Option<ExecError>,
}

impl RunRecord {
    pub fn success(counter: u64, stdout: String, stderr: String, value: Option<Renderable>) -> Self {
        Self {
            counter,
            stdout,
            stderr,
            value,
            error: None,
        }
    }

    pub fn failure(counter: u64, stdout: String, stderr: String, error: ExecError) -> Self {
        Self {
            counter,
            stdout,
            stderr,
            value: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Key/value annotations parsed from a cell's boundary marker. Ordered map so
/// reconstruction and snapshots are deterministic.
pub type Metadata = BTreeMap<String, String>;

/// A contiguous span of source treated as an atomic unit of display and, for
/// code, execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub kind: CellKind,
    /// Cell body, never containing the boundary that opened it.
    pub source: String,
    /// 1-based line of the source file where the cell begins.
    pub line_start: usize,
    pub metadata: Metadata,
    /// Stable digest of `source`, computed at construction.
    pub content_hash: u64,
    /// Present on code cells after dependency analysis.
    pub analysis: Option<Analysis>,
    /// Present on code cells after execution or carry-forward.
    pub run: Option<RunRecord>,
}

impl Cell {
    pub fn new(kind: CellKind, source: impl Into<String>, line_start: usize) -> Self {
        let source = source.into();
        let content_hash = content_hash(&source);
        Self {
            kind,
            source,
            line_start,
            metadata: Metadata::new(),
            content_hash,
            analysis: None,
            run: None,
        }
    }

    pub fn code(source: impl Into<String>, line_start: usize) -> Self {
        Self::new(CellKind::Code, source, line_start)
    }

    pub fn prose(source: impl Into<String>, line_start: usize) -> Self {
        Self::new(CellKind::Prose, source, line_start)
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_code(&self) -> bool {
        self.kind == CellKind::Code
    }

    pub fn is_prose(&self) -> bool {
        self.kind == CellKind::Prose
    }

    /// Marker title, when one was present on the boundary line.
    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title").map(String::as_str)
    }

    /// True when the cell is pinned to re-run on every pass via the
    /// `rerun="always"` marker annotation.
    pub fn pinned_always(&self) -> bool {
        self.metadata.get("rerun").is_some_and(|v| v == "always")
    }

    /// Carry the run record over from a previous incarnation of this cell.
    pub fn copy_execution(&mut self, previous: &Cell) {
        self.run = previous.run.clone();
    }
}

/// Ordered cell sequence for one parse of the source file.
pub type CellSequence = Vec<Cell>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn content_hash_is_stable_and_content_only() {
        let a = Cell::code("x = 1", 1);
        let b = Cell::code("x = 1", 40);
        let c = Cell::code("x = 2", 1);
        assert_eq!(a.content_hash, b.content_hash, "position must not affect identity");
        assert_ne!(a.content_hash, c.content_hash);
        assert_eq!(a.content_hash, content_hash("x = 1"));
    }

    #[test]
    fn run_record_constructors_uphold_error_xor_value() {
        let ok = RunRecord::success(1, String::new(), String::new(), Some(Renderable::Text("1".into())));
        assert!(!ok.is_error());
        assert!(ok.value.is_some());

        let err = RunRecord::failure(
            2,
            String::new(),
            String::new(),
            ExecError::new(ExecErrorKind::Name, "name 'x' is not defined", ""),
        );
        assert!(err.is_error());
        assert!(err.value.is_none(), "errored records never carry a value");
    }

    #[test]
    fn pinned_cells_detected_from_metadata() {
        let mut meta = Metadata::new();
        meta.insert("rerun".into(), "always".into());
        let cell = Cell::code("refresh()", 3).with_metadata(meta);
        assert!(cell.pinned_always());
        assert!(!Cell::code("x = 1", 1).pinned_always());
    }

    #[test]
    fn cells_round_trip_through_json() {
        let mut cell = Cell::code("y = x + 1", 4);
        cell.analysis = Some(Analysis::new(
            ["y".to_string()].into_iter().collect(),
            ["x".to_string()].into_iter().collect(),
        ));
        cell.run = Some(RunRecord::success(
            7,
            "out\n".into(),
            String::new(),
            Some(Renderable::Text("2".into())),
        ));
        let json = serde_json::to_string(&cell).unwrap();
        let back: Cell = serde_json::from_str(&json).unwrap();
        assert_eq!(cell, back);
    }
}
