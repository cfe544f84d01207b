//! Evaluator contract and the built-in reference interpreter.
//!
//! The engine talks to the embedded interpreter through [`Evaluator`], a
//! deliberately narrow seam: `run` one source fragment inside the persistent
//! namespace, or `reset` the namespace to pristine. `run` is the engine's
//! only suspension point; evaluators backed by an out-of-process kernel can
//! await freely, while the in-process [`ScriptEvaluator`] completes
//! synchronously.
//!
//! Contract held by every implementation:
//! * The value of a trailing expression statement becomes the record's
//!   `value`; otherwise `value` is `None`.
//! * Everything written to the output streams during the call is captured
//!   into the record; nothing leaks to the process streams.
//! * Errors never propagate across the interface; they arrive as structured
//!   records with a formatted context excerpt.
//! * A failed call may leave partial bindings, matching a sequential
//!   top-to-bottom run.
//! * The execution counter advances by exactly one per call.

pub mod error;
pub mod interp;
pub mod value;

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use core_cell::{ExecError, ExecErrorKind, RunRecord};
use core_display::to_renderable;
use core_lang::parse_source;
use tracing::debug;

pub use error::{RunError, format_context};
pub use interp::CellIo;
pub use value::{Builtin, Value};

/// Per-call wall-clock limit applied when no configuration overrides it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque persistent interpreter handle.
pub trait Evaluator {
    /// Compile and execute one source fragment inside the persistent
    /// namespace.
    fn run(&mut self, source: &str) -> impl Future<Output = RunRecord>;

    /// Discard the namespace and counter, returning to a pristine state.
    fn reset(&mut self);
}

/// The built-in tree-walking evaluator for the embedded dialect.
pub struct ScriptEvaluator {
    globals: HashMap<String, Value>,
    counter: u64,
    timeout: Option<Duration>,
}

impl Default for ScriptEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEvaluator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            globals: HashMap::new(),
            counter: 0,
            timeout: Some(timeout),
        }
    }

    /// No per-call limit; test harness use.
    pub fn unlimited() -> Self {
        Self {
            globals: HashMap::new(),
            counter: 0,
            timeout: None,
        }
    }

    /// Current execution counter (number of `run` calls since reset).
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// True when `name` is currently bound in the namespace.
    pub fn is_bound(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    /// Snapshot of the bound names, for diagnostics and tests.
    pub fn bound_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.globals.keys().cloned().collect();
        names.sort();
        names
    }

    /// Deterministic name → repr view of the namespace. Diagnostics and
    /// order-equivalence tests compare these snapshots.
    pub fn namespace_repr(&self) -> std::collections::BTreeMap<String, String> {
        self.globals
            .iter()
            .map(|(name, value)| (name.clone(), value.repr()))
            .collect()
    }

    /// Synchronous execution path; [`Evaluator::run`] wraps this in an
    /// already-complete future.
    pub fn run_sync(&mut self, source: &str) -> RunRecord {
        self.counter += 1;
        let counter = self.counter;

        let module = match parse_source(source) {
            Ok(module) => module,
            Err(err) => {
                debug!(target: "eval", counter, error = %err, "cell_syntax_error");
                let context = format_context(source, err.line, err.col);
                return RunRecord::failure(
                    counter,
                    String::new(),
                    String::new(),
                    ExecError::new(ExecErrorKind::Syntax, err.message, context),
                );
            }
        };

        let mut io = CellIo::default();
        let deadline = self.timeout.map(|t| Instant::now() + t);
        match interp::execute_module(&mut self.globals, &module, &mut io, deadline) {
            Ok(last_value) => {
                let value = last_value.and_then(|v| match v {
                    // A trailing expression evaluating to None displays
                    // nothing, notebook style.
                    Value::None => None,
                    v => Some(to_renderable(&v)),
                });
                debug!(
                    target: "eval",
                    counter,
                    stdout_bytes = io.stdout.len(),
                    has_value = value.is_some(),
                    "cell_run_ok"
                );
                RunRecord::success(counter, io.stdout, io.stderr, value)
            }
            Err(run_err) => {
                debug!(
                    target: "eval",
                    counter,
                    kind = ?run_err.kind,
                    error = %run_err.message,
                    "cell_run_error"
                );
                RunRecord::failure(counter, io.stdout, io.stderr, run_err.into_exec_error(source))
            }
        }
    }
}

impl Evaluator for ScriptEvaluator {
    fn run(&mut self, source: &str) -> impl Future<Output = RunRecord> {
        // The reference interpreter is synchronous; the future it returns
        // is already complete.
        std::future::ready(self.run_sync(source))
    }

    fn reset(&mut self) {
        debug!(target: "eval", bound = self.globals.len(), "environment_reset");
        self.globals.clear();
        self.counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_cell::Renderable;
    use pretty_assertions::assert_eq;

    fn run(evaluator: &mut ScriptEvaluator, source: &str) -> RunRecord {
        evaluator.run_sync(source)
    }

    #[test]
    fn namespace_persists_across_runs() {
        let mut eval = ScriptEvaluator::unlimited();
        run(&mut eval, "x = 1");
        let record = run(&mut eval, "x + 1");
        assert_eq!(record.value, Some(Renderable::Text("2".into())));
        assert!(record.error.is_none());
    }

    #[test]
    fn trailing_expression_yields_value_statements_do_not() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = run(&mut eval, "y = 5\ny * 2");
        assert_eq!(record.value, Some(Renderable::Text("10".into())));
        let record = run(&mut eval, "z = 1");
        assert_eq!(record.value, None);
    }

    #[test]
    fn trailing_none_displays_nothing() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = run(&mut eval, "None");
        assert_eq!(record.value, None);
        assert!(record.error.is_none());
    }

    #[test]
    fn stdout_is_captured_completely() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = run(&mut eval, "print('a', 'b')\nprint('c', sep='', end='!')");
        assert_eq!(record.stdout, "a b\nc!");
        assert_eq!(record.stderr, "");
    }

    #[test]
    fn counter_advances_once_per_run_including_failures() {
        let mut eval = ScriptEvaluator::unlimited();
        assert_eq!(run(&mut eval, "a = 1").counter, 1);
        assert_eq!(run(&mut eval, "this is no syntax").counter, 2);
        assert_eq!(run(&mut eval, "a").counter, 3);
    }

    #[test]
    fn name_error_has_name_kind_and_no_value() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = run(&mut eval, "print('before')\nmissing + 1");
        let error = record.error.expect("must error");
        assert_eq!(error.kind, ExecErrorKind::Name);
        assert_eq!(error.message, "name 'missing' is not defined");
        assert!(error.context.contains("missing + 1"));
        assert_eq!(record.value, None);
        assert_eq!(record.stdout, "before\n", "partial output is kept");
    }

    #[test]
    fn syntax_error_has_syntax_kind_and_context() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = run(&mut eval, "x = 1\ny = = 2");
        let error = record.error.expect("must error");
        assert_eq!(error.kind, ExecErrorKind::Syntax);
        assert!(error.context.contains("line 2"), "context: {}", error.context);
    }

    #[test]
    fn runtime_error_keeps_partial_bindings() {
        let mut eval = ScriptEvaluator::unlimited();
        run(&mut eval, "a = 1\nb = 1 / 0\nc = 3");
        assert!(eval.is_bound("a"), "bindings before the failure persist");
        assert!(!eval.is_bound("c"), "bindings after the failure do not");
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = run(&mut eval, "1 / 0");
        let error = record.error.expect("must error");
        assert_eq!(error.kind, ExecErrorKind::Runtime);
        assert_eq!(error.message, "division by zero");
    }

    #[test]
    fn timeout_produces_a_timeout_record() {
        let mut eval = ScriptEvaluator::with_timeout(Duration::from_millis(20));
        let record = run(&mut eval, "n = 0\nwhile True:\n    n += 1");
        let error = record.error.expect("must time out");
        assert_eq!(error.kind, ExecErrorKind::Timeout);
    }

    #[test]
    fn reset_discards_namespace_and_counter() {
        let mut eval = ScriptEvaluator::unlimited();
        run(&mut eval, "x = 1");
        eval.reset();
        assert_eq!(eval.counter(), 0);
        let record = run(&mut eval, "x");
        assert_eq!(record.error.expect("x gone").kind, ExecErrorKind::Name);
    }

    #[test]
    fn rich_constructors_map_to_their_renderable() {
        let mut eval = ScriptEvaluator::unlimited();
        assert_eq!(
            run(&mut eval, "Html('<b>x</b>')").value,
            Some(Renderable::Html("<b>x</b>".into()))
        );
        assert_eq!(
            run(&mut eval, "Markdown('## h')").value,
            Some(Renderable::Markdown("## h".into()))
        );
        assert_eq!(
            run(&mut eval, "Json({'k': [1, 2]})").value,
            Some(Renderable::Json(r#"{"k": [1, 2]}"#.into()))
        );
    }

    #[test]
    fn display_wrapper_recurses_to_the_inner_value() {
        let mut eval = ScriptEvaluator::unlimited();
        assert_eq!(
            run(&mut eval, "display(display(41 + 1))").value,
            Some(Renderable::Text("42".into()))
        );
    }

    #[test]
    fn functions_loops_and_methods_work_together() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = run(
            &mut eval,
            "def total(xs):\n    acc = 0\n    for x in xs:\n        acc += x\n    return acc\n\nvalues = [n * n for n in range(4)]\ntotal(values)",
        );
        assert!(record.error.is_none(), "error: {:?}", record.error);
        assert_eq!(record.value, Some(Renderable::Text("14".into())));
    }

    #[test]
    fn math_module_is_importable() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = run(&mut eval, "import math\nmath.floor(math.pi)");
        assert_eq!(record.value, Some(Renderable::Text("3".into())));
        let record = run(&mut eval, "from math import sqrt\nsqrt(16.0)");
        assert_eq!(record.value, Some(Renderable::Text("4.0".into())));
    }

    #[test]
    fn unknown_module_is_an_error() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = run(&mut eval, "import numpy");
        let error = record.error.expect("must error");
        assert_eq!(error.kind, ExecErrorKind::Other);
        assert!(error.message.contains("numpy"));
    }

    #[test]
    fn preloaded_namespace_matches_the_analyzer_builtins_table() {
        for name in core_analyze::BUILTINS {
            assert!(
                Builtin::lookup(name).is_some(),
                "analyzer builtin `{name}` missing from the evaluator"
            );
        }
        // And nothing extra is preloaded: every dialect builtin that
        // resolves by bare name appears in the analyzer table.
        let mut eval = ScriptEvaluator::unlimited();
        for name in core_analyze::BUILTINS {
            let record = eval.run_sync(name);
            assert!(
                record.error.is_none(),
                "`{name}` should resolve without error"
            );
        }
    }

    #[tokio::test]
    async fn trait_run_completes_inline() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = eval.run("1 + 1").await;
        assert_eq!(record.value, Some(Renderable::Text("2".into())));
        eval.reset();
        assert_eq!(eval.counter(), 0);
    }

    #[test]
    fn aliasing_is_observable_through_the_namespace() {
        let mut eval = ScriptEvaluator::unlimited();
        run(&mut eval, "a = [1]\nb = a");
        run(&mut eval, "a.append(2)");
        let record = run(&mut eval, "b");
        assert_eq!(record.value, Some(Renderable::Text("[1, 2]".into())));
    }

    #[test]
    fn class_definitions_report_unsupported() {
        let mut eval = ScriptEvaluator::unlimited();
        let record = run(&mut eval, "class Point:\n    pass");
        let error = record.error.expect("must error");
        assert!(error.message.contains("class definitions"));
    }
}
