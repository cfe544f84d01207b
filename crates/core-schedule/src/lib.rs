//! Incremental scheduler: decide the minimum set of code cells to re-execute
//! so visible outputs match a hypothetical fresh top-to-bottom run.
//!
//! A pass over a fresh sequence `N` against the previous sequence `P` runs
//! in four phases:
//!
//! 1. **Change detection** — content-hash matching (position drift alone is
//!    not a change), plus ordering-induced changes (the latest provider of a
//!    required name differs; both the reader and the now-latest provider are
//!    invalidated so the namespace is rebuilt, not just the record), new
//!    cells, previously errored cells, and cells pinned with
//!    `rerun="always"`.
//! 2. **Dependency graph** — for each code cell and each required name, an
//!    edge to the nearest earlier provider of that name.
//! 3. **Invalidation closure** — everything that transitively depends on a
//!    changed cell.
//! 4. **Execution** — file order, re-running exactly the closure and
//!    carrying every other record forward. A failed cell does not stop the
//!    pass; its dependents still run and fail the way a top-to-bottom rerun
//!    would.
//!
//! Edges always point to earlier positions, so cycles are impossible by
//! construction; the executor still asserts this and surfaces a violation
//! as [`ScheduleError::Cycle`] (an internal error, not a user error).

use std::collections::BTreeSet;

use core_cell::{Cell, CellSequence};
use core_eval::Evaluator;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Static dependency tracking with invalidation closure.
    Dependency,
    /// Legacy mode: linear re-execution from the first difference onward.
    Linear,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("internal error: dependency cycle at cell position {0}")]
    Cycle(usize),
}

/// Per-position dependency edges. `deps[i]` holds the positions cell `i`
/// reads from; every entry is `< i` by the latest-provider rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    pub deps: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Build the graph for an analyzed sequence by the latest-provider
    /// rule: a required name with no earlier provider contributes no edge
    /// (the evaluator will surface the unresolved name).
    pub fn build(cells: &[Cell]) -> Self {
        let mut deps = vec![BTreeSet::new(); cells.len()];
        for (i, cell) in cells.iter().enumerate() {
            if !cell.is_code() {
                continue;
            }
            let Some(analysis) = &cell.analysis else {
                continue;
            };
            for name in &analysis.requires {
                if let Some(j) = latest_provider(cells, i, name) {
                    deps[i].insert(j);
                }
            }
        }
        Self { deps }
    }

    /// Reflexive-transitive closure of `seeds` under "is depended on by".
    pub fn invalidation_closure(&self, seeds: &BTreeSet<usize>) -> BTreeSet<usize> {
        let mut rerun = seeds.clone();
        // Dependencies always point backward, so one ascending sweep
        // reaches the fixed point.
        for i in 0..self.deps.len() {
            if rerun.contains(&i) {
                continue;
            }
            if self.deps[i].iter().any(|j| rerun.contains(j)) {
                rerun.insert(i);
            }
        }
        rerun
    }
}

/// The nearest position `< upto` whose cell provides `name`.
pub fn latest_provider(cells: &[Cell], upto: usize, name: &str) -> Option<usize> {
    cells[..upto].iter().enumerate().rev().find_map(|(j, cell)| {
        cell.is_code()
            .then(|| cell.analysis.as_ref())
            .flatten()
            .filter(|a| a.provides.contains(name))
            .map(|_| j)
    })
}

/// Phases 1–3, computed without touching the evaluator.
#[derive(Debug)]
pub struct PassPlan {
    /// For each position in the new sequence, the matched position in the
    /// previous sequence (content-hash identity, injective).
    pub matched: Vec<Option<usize>>,
    pub changed: BTreeSet<usize>,
    pub graph: DependencyGraph,
    pub rerun: BTreeSet<usize>,
}

pub fn plan(prev: &[Cell], next: &[Cell]) -> PassPlan {
    let matched = match_cells(prev, next);
    let changed = detect_changes(prev, next, &matched);
    let graph = DependencyGraph::build(next);
    let rerun = graph.invalidation_closure(&changed);
    if !changed.is_empty() || !rerun.is_empty() {
        info!(
            target: "schedule",
            changed = ?positions_one_based(&changed),
            rerun = ?positions_one_based(&rerun),
            "pass_plan"
        );
    }
    PassPlan {
        matched,
        changed,
        graph,
        rerun,
    }
}

fn positions_one_based(set: &BTreeSet<usize>) -> Vec<usize> {
    set.iter().map(|i| i + 1).collect()
}

/// Content-hash matching with smallest-position-delta tie-breaking, ties to
/// the earliest previous position. Injective: a previous cell carries
/// forward at most once.
fn match_cells(prev: &[Cell], next: &[Cell]) -> Vec<Option<usize>> {
    let mut used = vec![false; prev.len()];
    let mut matched = vec![None; next.len()];
    for (i, cell) in next.iter().enumerate() {
        if !cell.is_code() {
            continue;
        }
        let mut best: Option<usize> = None;
        for (j, previous) in prev.iter().enumerate() {
            if used[j] || !previous.is_code() || previous.content_hash != cell.content_hash {
                continue;
            }
            best = Some(match best {
                None => j,
                // Ascending scan: on equal delta the earlier candidate wins.
                Some(current) if j.abs_diff(i) < current.abs_diff(i) => j,
                Some(current) => current,
            });
        }
        if let Some(j) = best {
            used[j] = true;
            matched[i] = Some(j);
        }
    }
    matched
}

/// Phase 1: the set of positions that must re-execute on their own account.
fn detect_changes(prev: &[Cell], next: &[Cell], matched: &[Option<usize>]) -> BTreeSet<usize> {
    let mut changed = BTreeSet::new();
    for (i, cell) in next.iter().enumerate() {
        if !cell.is_code() {
            continue;
        }
        let Some(j) = matched[i] else {
            // New or edited content.
            changed.insert(i);
            continue;
        };
        let carried = prev[j].run.as_ref();
        if carried.is_none_or(|run| run.is_error()) {
            changed.insert(i);
            continue;
        }
        if cell.pinned_always() {
            changed.insert(i);
            continue;
        }
        let reordered = ordering_invalidations(prev, next, i, j);
        if !reordered.is_empty() {
            debug!(
                target: "schedule",
                position = i + 1,
                invalidated = ?reordered.iter().map(|p| p + 1).collect::<Vec<_>>(),
                "ordering_induced_change"
            );
            changed.extend(reordered);
        }
    }
    changed
}

/// Positions invalidated because some required name's latest provider
/// differs (by content identity) between the cell's previous run and the
/// new sequence: the reader itself plus each differing new provider.
///
/// The provider must re-execute, not just the reader — carry-forward copies
/// run records without touching the namespace, so only a fresh run of the
/// now-latest provider makes the reader observe the binding a top-to-bottom
/// run would produce. The invalidation closure then reaches every other
/// dependent of that provider.
fn ordering_invalidations(prev: &[Cell], next: &[Cell], i: usize, j: usize) -> BTreeSet<usize> {
    let mut invalidated = BTreeSet::new();
    let Some(analysis) = &next[i].analysis else {
        return invalidated;
    };
    for name in &analysis.requires {
        let now = latest_provider(next, i, name);
        let before = latest_provider(prev, j, name);
        let now_hash = now.map(|p| next[p].content_hash);
        let before_hash = before.map(|p| prev[p].content_hash);
        if now_hash != before_hash {
            invalidated.insert(i);
            if let Some(provider) = now {
                invalidated.insert(provider);
            }
        }
    }
    invalidated
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecStats {
    pub executed: usize,
    pub reused: usize,
}

/// Phase 4: produce the populated sequence, invoking the evaluator for
/// exactly the planned cells and carrying every other record forward.
pub async fn execute_pass<E: Evaluator>(
    prev: &[Cell],
    next: CellSequence,
    evaluator: &mut E,
    strategy: Strategy,
) -> Result<(CellSequence, ExecStats), ScheduleError> {
    match strategy {
        Strategy::Dependency => execute_dependency(prev, next, evaluator).await,
        Strategy::Linear => Ok(execute_linear(prev, next, evaluator).await),
    }
}

async fn execute_dependency<E: Evaluator>(
    prev: &[Cell],
    next: CellSequence,
    evaluator: &mut E,
) -> Result<(CellSequence, ExecStats), ScheduleError> {
    let pass = plan(prev, &next);
    for (i, deps) in pass.graph.deps.iter().enumerate() {
        if deps.iter().any(|&j| j >= i) {
            return Err(ScheduleError::Cycle(i + 1));
        }
    }

    let mut stats = ExecStats::default();
    let mut out = next;
    for i in 0..out.len() {
        if !out[i].is_code() {
            continue;
        }
        if pass.rerun.contains(&i) {
            debug!(target: "schedule", position = i + 1, "cell_execute");
            let record = evaluator.run(&out[i].source).await;
            out[i].run = Some(record);
            stats.executed += 1;
        } else {
            let j = pass.matched[i].expect("unmatched cells are always in the rerun set");
            out[i].run = prev[j].run.clone();
            stats.reused += 1;
        }
    }
    Ok((out, stats))
}

/// Legacy strategy kept behind `[schedule] dependency_tracking = false`:
/// pair code cells by order and re-execute everything from the first
/// difference onward.
async fn execute_linear<E: Evaluator>(
    prev: &[Cell],
    next: CellSequence,
    evaluator: &mut E,
) -> (CellSequence, ExecStats) {
    let prev_code: Vec<&Cell> = prev.iter().filter(|c| c.is_code()).collect();
    let mut stats = ExecStats::default();
    let mut out = next;
    let mut off_script = false;
    let mut k = 0usize;
    for cell in out.iter_mut() {
        if !cell.is_code() {
            continue;
        }
        let previous = prev_code.get(k).copied();
        k += 1;
        let unchanged = previous
            .is_some_and(|p| p.content_hash == cell.content_hash && p.run.is_some());
        if off_script || !unchanged || cell.pinned_always() {
            off_script = true;
            debug!(target: "schedule", position = k, "cell_execute_linear");
            let record = evaluator.run(&cell.source).await;
            cell.run = Some(record);
            stats.executed += 1;
        } else {
            cell.copy_execution(previous.expect("unchanged implies a previous cell"));
            stats.reused += 1;
        }
    }
    (out, stats)
}
