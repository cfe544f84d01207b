//! Analyzer soundness against the reference evaluator: for a cell that
//! executes without error in a fresh environment (with its requirements
//! bound to sentinels), every name the run actually bound must appear in
//! the analyzer's `provides` set.

use std::collections::BTreeSet;

use core_eval::ScriptEvaluator;

const SAMPLE_CELLS: &[&str] = &[
    "x = 1",
    "y = x + 1",
    "a, b = 1, 2",
    "a = b = seed",
    "total = 0\nfor n in range(5):\n    total += n",
    "def helper(v):\n    return v * scale\nresult = helper(3)",
    "import math\nradius = math.sqrt(area)",
    "from math import sqrt as root\nedge = root(9.0)",
    "squares = [k * k for k in range(4)]",
    "count = (m := limit) + 1",
    "flag = value > 0 and value < 10",
    "parts = text.split()\njoined = ','.join(parts)",
    "acc = seed\nacc += 1\nacc",
];

#[test]
fn provides_is_a_superset_of_actual_bindings() {
    for source in SAMPLE_CELLS {
        let analysis = core_analyze::analyze(source);
        let mut evaluator = ScriptEvaluator::unlimited();

        // Preload sentinels for every required name so the cell can run in
        // isolation; strings and numbers both work, pick by usage.
        for name in &analysis.requires {
            let sentinel = if name == "text" { "'a b'" } else { "1" };
            let record = evaluator.run_sync(&format!("{name} = {sentinel}"));
            assert!(record.error.is_none(), "sentinel bind failed for {name}");
        }
        let before: BTreeSet<String> = evaluator.bound_names().into_iter().collect();

        let record = evaluator.run_sync(source);
        assert!(
            record.error.is_none(),
            "cell must run clean for the property to apply: {source:?} -> {:?}",
            record.error
        );

        let after: BTreeSet<String> = evaluator.bound_names().into_iter().collect();
        let newly_bound: BTreeSet<&String> = after.difference(&before).collect();
        for name in newly_bound {
            assert!(
                analysis.provides.contains(name),
                "evaluator bound `{name}` but the analyzer missed it for {source:?} (provides: {:?})",
                analysis.provides
            );
        }
    }
}

#[test]
fn requires_covers_every_unresolved_read() {
    // The complementary direction on the same samples: running the cell in
    // a completely empty environment must only ever fail on names the
    // analyzer listed as requirements.
    for source in SAMPLE_CELLS {
        let analysis = core_analyze::analyze(source);
        let mut evaluator = ScriptEvaluator::unlimited();
        let record = evaluator.run_sync(source);
        if let Some(error) = record.error
            && error.kind == core_cell::ExecErrorKind::Name
        {
            let missing = error
                .message
                .strip_prefix("name '")
                .and_then(|rest| rest.split('\'').next())
                .unwrap_or_default()
                .to_string();
            assert!(
                analysis.requires.contains(&missing),
                "run failed on `{missing}` which the analyzer did not require for {source:?}"
            );
        }
    }
}
