//! Property tests for the pass plan: invalidation closure exactness.

use std::collections::BTreeSet;

use core_cell::{Analysis, Cell, RunRecord};
use core_schedule::{DependencyGraph, plan};
use proptest::prelude::*;

/// Build an annotated chain where cell `i` binds `x{i}` and optionally
/// reads `x{dep}` for some `dep < i`.
fn build_cells(deps: &[Option<usize>], edited: Option<usize>) -> Vec<Cell> {
    deps.iter()
        .enumerate()
        .map(|(i, dep)| {
            let marker = if edited == Some(i) { " + 100" } else { "" };
            let source = match dep {
                Some(j) => format!("x{i} = x{j} + 1{marker}"),
                None => format!("x{i} = {i}{marker}"),
            };
            let mut cell = Cell::code(source, i + 1);
            let mut provides = BTreeSet::new();
            provides.insert(format!("x{i}"));
            let mut requires = BTreeSet::new();
            if let Some(j) = dep {
                requires.insert(format!("x{j}"));
            }
            cell.analysis = Some(Analysis::new(provides, requires));
            cell
        })
        .collect()
}

fn with_runs(mut cells: Vec<Cell>) -> Vec<Cell> {
    for (i, cell) in cells.iter_mut().enumerate() {
        cell.run = Some(RunRecord::success(
            i as u64 + 1,
            String::new(),
            String::new(),
            None,
        ));
    }
    cells
}

proptest! {
    // Editing exactly one cell schedules exactly that cell plus its
    // transitive dependents, nothing else.
    #[test]
    fn single_edit_reruns_exactly_the_dependent_closure(
        raw_deps in prop::collection::vec(0usize..100, 2..8),
        edit_seed in 0usize..100,
    ) {
        let deps: Vec<Option<usize>> = raw_deps
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                if i == 0 || raw % 3 == 0 {
                    None
                } else {
                    Some(raw % i)
                }
            })
            .collect();
        let edited = edit_seed % deps.len();

        let prev = with_runs(build_cells(&deps, None));
        let next = build_cells(&deps, Some(edited));

        let pass = plan(&prev, &next);
        let graph = DependencyGraph::build(&next);
        let expected = graph.invalidation_closure(&BTreeSet::from([edited]));

        prop_assert!(pass.changed.contains(&edited));
        // Direct readers of the edited provider may be flagged in phase 1
        // (their latest provider is no longer the carried cell); the final
        // rerun set is exactly the dependent closure either way.
        prop_assert!(pass.changed.is_subset(&expected));
        prop_assert_eq!(&pass.rerun, &expected);
    }

    // An untouched sequence never schedules anything.
    #[test]
    fn no_edit_schedules_nothing(raw_deps in prop::collection::vec(0usize..100, 1..8)) {
        let deps: Vec<Option<usize>> = raw_deps
            .iter()
            .enumerate()
            .map(|(i, raw)| if i == 0 || raw % 3 == 0 { None } else { Some(raw % i) })
            .collect();
        let prev = with_runs(build_cells(&deps, None));
        let next = build_cells(&deps, None);
        let pass = plan(&prev, &next);
        prop_assert!(pass.changed.is_empty());
        prop_assert!(pass.rerun.is_empty());
    }

    // Graph edges always point strictly backward, the structural property
    // that makes cycles impossible.
    #[test]
    fn graph_edges_point_backward(raw_deps in prop::collection::vec(0usize..100, 1..10)) {
        let deps: Vec<Option<usize>> = raw_deps
            .iter()
            .enumerate()
            .map(|(i, raw)| if i == 0 || raw % 4 == 0 { None } else { Some(raw % i) })
            .collect();
        let cells = build_cells(&deps, None);
        let graph = DependencyGraph::build(&cells);
        for (i, edges) in graph.deps.iter().enumerate() {
            prop_assert!(edges.iter().all(|&j| j < i));
        }
    }
}
