//! End-to-end scheduler scenarios over the real parser, analyzer, and
//! reference evaluator.

use core_cell::{Cell, CellSequence, ExecErrorKind};
use core_eval::ScriptEvaluator;
use core_schedule::{ExecStats, Strategy, execute_pass};
use pretty_assertions::assert_eq;

fn annotate(source: &str) -> CellSequence {
    let mut cells = core_parse::parse(source);
    for cell in &mut cells {
        if cell.is_code() {
            cell.analysis = Some(core_analyze::analyze(&cell.source));
        }
    }
    cells
}

async fn pass(
    prev: &[Cell],
    source: &str,
    evaluator: &mut ScriptEvaluator,
) -> (CellSequence, ExecStats) {
    execute_pass(prev, annotate(source), evaluator, Strategy::Dependency)
        .await
        .expect("no cycles in test sources")
}

fn counters(cells: &[Cell]) -> Vec<u64> {
    cells
        .iter()
        .filter_map(|c| c.run.as_ref().map(|r| r.counter))
        .collect()
}

const THREE_CELLS: &str = "# %% A\nx = 1\n# %% B\ny = x + 1\n# %% C\nz = 10\n";

#[tokio::test]
async fn minimum_rerun_after_editing_one_cell() {
    let mut evaluator = ScriptEvaluator::unlimited();
    let (first, stats) = pass(&[], THREE_CELLS, &mut evaluator).await;
    assert_eq!(stats.executed, 3);
    assert_eq!(counters(&first), vec![1, 2, 3]);

    let edited = "# %% A\nx = 1\n# %% B\ny = x + 2\n# %% C\nz = 10\n";
    let (second, stats) = pass(&first, edited, &mut evaluator).await;
    assert_eq!(stats.executed, 1, "only B re-runs");
    assert_eq!(stats.reused, 2);
    assert_eq!(counters(&second), vec![1, 4, 3]);
}

#[tokio::test]
async fn transitive_invalidation_reruns_dependents() {
    let mut evaluator = ScriptEvaluator::unlimited();
    let (first, _) = pass(&[], THREE_CELLS, &mut evaluator).await;

    let edited = "# %% A\nx = 2\n# %% B\ny = x + 1\n# %% C\nz = 10\n";
    let (second, stats) = pass(&first, edited, &mut evaluator).await;
    assert_eq!(stats.executed, 2, "A and its dependent B");
    assert_eq!(counters(&second), vec![4, 5, 3], "C is untouched");
}

#[tokio::test]
async fn errored_cell_is_isolated_and_later_cells_still_run() {
    let mut evaluator = ScriptEvaluator::unlimited();
    let source = "# %% first\na = 1\na\n# %% middle\nb = missing_name\n# %% last\nc = a + 1\nc\n";
    let (cells, stats) = pass(&[], source, &mut evaluator).await;
    assert_eq!(stats.executed, 3, "the pass continues after a failure");

    let first = cells[0].run.as_ref().unwrap();
    assert!(first.error.is_none());
    assert!(first.value.is_some());

    let middle = cells[1].run.as_ref().unwrap();
    let error = middle.error.as_ref().expect("middle cell fails");
    assert_eq!(error.kind, ExecErrorKind::Name);
    assert!(middle.value.is_none());

    let last = cells[2].run.as_ref().unwrap();
    assert!(last.error.is_none(), "independent cell still succeeds");
}

#[tokio::test]
async fn dependent_of_errored_cell_fails_like_a_fresh_run() {
    let mut evaluator = ScriptEvaluator::unlimited();
    let source = "# %% a\nx = unbound\n# %% b\ny = x + 1\n";
    let (cells, _) = pass(&[], source, &mut evaluator).await;
    let second = cells[1].run.as_ref().unwrap();
    let error = second.error.as_ref().expect("reader of a failed provider fails");
    assert_eq!(error.kind, ExecErrorKind::Name, "unresolved name, as top-to-bottom would give");
}

#[tokio::test]
async fn unchanged_source_reuses_every_record() {
    // A second pass over identical source re-invokes the evaluator on
    // nothing and reproduces the records exactly.
    let mut evaluator = ScriptEvaluator::unlimited();
    let (first, _) = pass(&[], THREE_CELLS, &mut evaluator).await;
    let (second, stats) = pass(&first, THREE_CELLS, &mut evaluator).await;
    assert_eq!(stats.executed, 0);
    assert_eq!(stats.reused, 3);
    let first_runs: Vec<_> = first.iter().map(|c| c.run.clone()).collect();
    let second_runs: Vec<_> = second.iter().map(|c| c.run.clone()).collect();
    assert_eq!(first_runs, second_runs);
}

#[tokio::test]
async fn errored_cells_retry_on_the_next_pass() {
    let mut evaluator = ScriptEvaluator::unlimited();
    let source = "# %% a\nvalue = later + 1\n";
    let (first, _) = pass(&[], source, &mut evaluator).await;
    assert!(first[0].run.as_ref().unwrap().is_error());

    // Same content: an errored record never carries forward silently.
    let (second, stats) = pass(&first, source, &mut evaluator).await;
    assert_eq!(stats.executed, 1);
    assert!(second[0].run.as_ref().unwrap().is_error());
}

#[tokio::test]
async fn provider_swap_reruns_new_provider_and_reader() {
    let mut evaluator = ScriptEvaluator::unlimited();
    let source = "# %% A\nx = 1\n# %% B\nx = 2\n# %% C\nprint(x)\n";
    let (first, _) = pass(&[], source, &mut evaluator).await;
    assert_eq!(first[2].run.as_ref().unwrap().stdout, "2\n");

    // After the swap the now-latest provider re-runs (rebuilding `x` in the
    // namespace) along with the reader; the displaced provider is carried.
    let swapped = "# %% B\nx = 2\n# %% A\nx = 1\n# %% C\nprint(x)\n";
    let (second, stats) = pass(&first, swapped, &mut evaluator).await;
    assert_eq!(stats.executed, 2, "new provider and reader: {stats:?}");
    assert_eq!(stats.reused, 1, "the displaced provider carries forward");
    assert_eq!(second[2].run.as_ref().unwrap().stdout, "1\n");
}

#[tokio::test]
async fn independent_reorder_reaches_the_same_namespace() {
    // Independent cells can trade places without affecting the final
    // namespace.
    let n1 = "# %% A\nx = 1\n# %% B\ny = 2\n";
    let n2 = "# %% B\ny = 2\n# %% A\nx = 1\n";

    let mut eval1 = ScriptEvaluator::unlimited();
    let _ = pass(&[], n1, &mut eval1).await;
    let mut eval2 = ScriptEvaluator::unlimited();
    let _ = pass(&[], n2, &mut eval2).await;
    assert_eq!(eval1.namespace_repr(), eval2.namespace_repr());
}

#[tokio::test]
async fn counters_are_strictly_increasing_across_passes() {
    let mut evaluator = ScriptEvaluator::unlimited();
    let sources = [
        "# %% A\nx = 1\n# %% B\ny = x + 1\n",
        "# %% A\nx = 2\n# %% B\ny = x + 1\n",
        "# %% A\nx = 2\n# %% B\ny = x + 3\n# %% C\nz = y\n",
    ];
    let mut prev = Vec::new();
    let mut seen = Vec::new();
    for source in sources {
        let (cells, _) = pass(&prev, source, &mut evaluator).await;
        let mut new_counters: Vec<u64> = counters(&cells)
            .into_iter()
            .filter(|c| !seen.contains(c))
            .collect();
        new_counters.sort_unstable();
        seen.extend(new_counters);
        prev = cells;
    }
    assert!(
        seen.windows(2).all(|w| w[0] < w[1]),
        "counters must be strictly increasing: {seen:?}"
    );
}

#[tokio::test]
async fn inserted_cell_invalidates_downstream_readers_only() {
    let mut evaluator = ScriptEvaluator::unlimited();
    let source = "# %% A\nx = 1\n# %% C\ny = x + 1\n";
    let (first, _) = pass(&[], source, &mut evaluator).await;

    let inserted = "# %% A\nx = 1\n# %% B\nx = 5\n# %% C\ny = x + 1\n";
    let (second, stats) = pass(&first, inserted, &mut evaluator).await;
    assert_eq!(stats.executed, 2, "the insertion and the reader whose provider changed");
    assert!(!second[2].run.as_ref().unwrap().is_error());
    assert_eq!(stats.reused, 1, "A carries forward");
}

#[tokio::test]
async fn deleted_cell_keeps_bindings_for_later_readers() {
    // Deletion does not purge names; the reader still succeeds.
    let mut evaluator = ScriptEvaluator::unlimited();
    let source = "# %% A\nx = 7\n# %% B\ny = x + 1\ny\n";
    let (first, _) = pass(&[], source, &mut evaluator).await;

    let deleted = "# %% B\ny = x + 1\ny\n";
    let (second, stats) = pass(&first, deleted, &mut evaluator).await;
    // B's latest provider of x disappeared, so B re-runs; the stale
    // binding satisfies it, matching a long-lived interpreter session.
    assert_eq!(stats.executed, 1);
    let record = second[0].run.as_ref().unwrap();
    assert!(record.error.is_none(), "stale binding still resolves: {record:?}");
}

#[tokio::test]
async fn linear_strategy_reruns_everything_from_first_difference() {
    let mut evaluator = ScriptEvaluator::unlimited();
    let (first, _) = execute_pass(&[], annotate(THREE_CELLS), &mut evaluator, Strategy::Linear)
        .await
        .unwrap();
    assert_eq!(counters(&first), vec![1, 2, 3]);

    // Editing B re-runs B and everything after it, independent or not.
    let edited = "# %% A\nx = 1\n# %% B\ny = x + 2\n# %% C\nz = 10\n";
    let (second, stats) = execute_pass(&first, annotate(edited), &mut evaluator, Strategy::Linear)
        .await
        .unwrap();
    assert_eq!(stats.executed, 2);
    assert_eq!(counters(&second), vec![1, 4, 5]);
}

#[tokio::test]
async fn prose_cells_pass_through_without_records() {
    let mut evaluator = ScriptEvaluator::unlimited();
    let source = "\"\"\"Notes\"\"\"\nx = 1\n";
    let (cells, stats) = pass(&[], source, &mut evaluator).await;
    assert_eq!(stats.executed, 1);
    assert!(cells[0].is_prose());
    assert!(cells[0].run.is_none());
}
