//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The dependency resolver
//!
//! Partitions a tier's PENDING children into those eligible to launch,
//! those still waiting and those that must be discarded, based on the
//! terminal results of their `on_done`/`on_pass`/`on_fail` siblings.
//! Sibling edges are checked for cycles once at expansion time, before
//! anything launches.

use std::collections::BTreeMap;

use anyhow::Result;
use itertools::Itertools;
use log::trace;

use crate::spec::spec_error;
use crate::spec::SpecNode;
use crate::tier::children::ChildResult;
use crate::tier::children::ChildState;
use crate::tier::children::ChildTable;

/// Outcome of one resolver pass over the PENDING children
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Partition {
    pub launch_now: Vec<String>,
    pub still_waiting: Vec<String>,
    pub abort: Vec<String>,
}

enum DepStatus {
    Satisfied,
    Violated,
    Waiting,
}

/// Evaluate every PENDING child, in ident order to break ties
pub fn resolve(table: &ChildTable) -> Partition {
    let mut partition = Partition::default();

    for record in table.iter() {
        if record.state() != ChildState::Pending {
            continue;
        }

        let mut violated = false;
        let mut waiting = false;

        let deps = record
            .spec()
            .on_done()
            .iter()
            .map(|d| (DepKind::Done, d))
            .chain(record.spec().on_pass().iter().map(|d| (DepKind::Pass, d)))
            .chain(record.spec().on_fail().iter().map(|d| (DepKind::Fail, d)));

        for (kind, dep) in deps {
            // Dependency names were validated at expansion time.
            let sibling = match table.get(dep) {
                Ok(s) => s,
                Err(_) => continue,
            };

            match kind.status(sibling.state(), sibling.result()) {
                DepStatus::Violated => violated = true,
                DepStatus::Waiting => waiting = true,
                DepStatus::Satisfied => (),
            }
        }

        let ident = record.ident().to_string();
        if violated {
            partition.abort.push(ident);
        } else if waiting {
            partition.still_waiting.push(ident);
        } else {
            partition.launch_now.push(ident);
        }
    }

    trace!("Resolver partition: {partition:?}");
    partition
}

#[derive(Clone, Copy, Debug)]
enum DepKind {
    Done,
    Pass,
    Fail,
}

impl DepKind {
    fn status(self, state: ChildState, result: ChildResult) -> DepStatus {
        if state != ChildState::Complete {
            return DepStatus::Waiting;
        }

        match self {
            // on_done only ever waits; any terminal sibling satisfies it.
            DepKind::Done => DepStatus::Satisfied,

            DepKind::Pass => match result {
                ChildResult::Success => DepStatus::Satisfied,
                ChildResult::Failure | ChildResult::Aborted => DepStatus::Violated,
                ChildResult::Unknown => DepStatus::Waiting,
            },

            DepKind::Fail => match result {
                ChildResult::Failure => DepStatus::Satisfied,
                ChildResult::Success | ChildResult::Aborted => DepStatus::Violated,
                ChildResult::Unknown => DepStatus::Waiting,
            },
        }
    }
}

/// Validate the expanded sibling set before any child launches
///
/// Rejects duplicate idents, dependency names that do not resolve to a
/// sibling and cyclic dependency edges. Cycle detection runs over the
/// union of all three edge kinds.
pub fn validate_siblings(children: &[SpecNode]) -> Result<()> {
    let mut nodes = BTreeMap::new();
    let mut dag = daggy::Dag::<&str, ()>::new();

    for child in children {
        if nodes.contains_key(child.ident()) {
            return spec_error(format!("duplicate child ident: {}", child.ident()));
        }
        nodes.insert(child.ident(), dag.add_node(child.ident()));
    }

    for child in children {
        let child_idx = nodes[child.ident()];
        let deps = child
            .on_done()
            .iter()
            .chain(child.on_pass())
            .chain(child.on_fail())
            .unique();

        for dep in deps {
            let dep_idx = match nodes.get(dep.as_str()) {
                Some(idx) => *idx,
                None => {
                    return spec_error(format!(
                        "child '{}' depends on unknown sibling '{dep}'",
                        child.ident()
                    ))
                }
            };

            if dag.add_edge(dep_idx, child_idx, ()).is_err() {
                return spec_error(format!(
                    "cyclic dependency involving '{}' and '{dep}'",
                    child.ident()
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap as Map;

    use crate::tier::children::tests::job_node;
    use crate::tier::children::tests::job_node_deps;

    fn table(children: Vec<SpecNode>) -> ChildTable {
        validate_siblings(&children).unwrap();
        ChildTable::from_children(children).unwrap()
    }

    fn finish(table: &mut ChildTable, ident: &str, result: ChildResult, code: i32) {
        let record = table.get_mut(ident).unwrap();
        record.mark_launched().unwrap();
        record.register("127.0.0.1:1").unwrap();
        record.complete(result, code, Map::new()).unwrap();
    }

    #[test]
    fn test_initial_partition_launches_dependency_free_children() {
        let table = table(vec![
            job_node("a"),
            job_node_deps("b", &[], &["a"], &[]),
        ]);

        let partition = resolve(&table);
        assert_eq!(partition.launch_now, vec![String::from("a")]);
        assert_eq!(partition.still_waiting, vec![String::from("b")]);
        assert!(partition.abort.is_empty());
    }

    #[test]
    fn test_on_pass_launches_after_success() {
        let mut table = table(vec![
            job_node("a"),
            job_node_deps("b", &[], &["a"], &[]),
        ]);

        finish(&mut table, "a", ChildResult::Success, 0);
        let partition = resolve(&table);
        assert_eq!(partition.launch_now, vec![String::from("b")]);
    }

    #[test]
    fn test_on_pass_aborts_after_failure() {
        let mut table = table(vec![
            job_node("a"),
            job_node_deps("b", &[], &["a"], &[]),
        ]);

        finish(&mut table, "a", ChildResult::Failure, 1);
        let partition = resolve(&table);
        assert!(partition.launch_now.is_empty());
        assert_eq!(partition.abort, vec![String::from("b")]);
    }

    #[test]
    fn test_on_fail_launches_after_failure_aborts_after_success() {
        let mut table = table(vec![
            job_node("a"),
            job_node_deps("b", &[], &[], &["a"]),
            job_node_deps("c", &[], &[], &["a"]),
        ]);

        finish(&mut table, "a", ChildResult::Failure, 1);
        let partition = resolve(&table);
        assert_eq!(
            partition.launch_now,
            vec![String::from("b"), String::from("c")]
        );

        let mut table = table_success();
        finish(&mut table, "a", ChildResult::Success, 0);
        let partition = resolve(&table);
        assert_eq!(partition.abort, vec![String::from("b")]);
    }

    fn table_success() -> ChildTable {
        table(vec![job_node("a"), job_node_deps("b", &[], &[], &["a"])])
    }

    #[test]
    fn test_on_done_is_satisfied_by_any_terminal_state() {
        let mut table = table(vec![
            job_node("a"),
            job_node_deps("b", &["a"], &[], &[]),
        ]);

        table.get_mut("a").unwrap().abort(-1).unwrap();
        let partition = resolve(&table);
        assert_eq!(partition.launch_now, vec![String::from("b")]);
    }

    #[test]
    fn test_aborted_sibling_dooms_on_pass_dependents_transitively() {
        // a fails, b (on_pass a) is aborted, c (on_pass b) must follow on
        // the next pass once b's abort is recorded.
        let mut table = table(vec![
            job_node("a"),
            job_node_deps("b", &[], &["a"], &[]),
            job_node_deps("c", &[], &["b"], &[]),
        ]);

        finish(&mut table, "a", ChildResult::Failure, 1);
        let partition = resolve(&table);
        assert_eq!(partition.abort, vec![String::from("b")]);
        assert_eq!(partition.still_waiting, vec![String::from("c")]);

        table.get_mut("b").unwrap().abort(-1).unwrap();
        let partition = resolve(&table);
        assert_eq!(partition.abort, vec![String::from("c")]);
    }

    #[test]
    fn test_launch_order_is_ident_order() {
        let table = table(vec![job_node("zeta"), job_node("alpha"), job_node("mid")]);
        let partition = resolve(&table);
        assert_eq!(
            partition.launch_now,
            vec![
                String::from("alpha"),
                String::from("mid"),
                String::from("zeta")
            ]
        );
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let children = vec![job_node_deps("a", &[], &["ghost"], &[])];
        let err = validate_siblings(&children).unwrap_err();
        assert!(err.downcast_ref::<crate::spec::SpecError>().is_some());
    }

    #[test]
    fn test_two_cycle_rejected() {
        let children = vec![
            job_node_deps("a", &[], &["b"], &[]),
            job_node_deps("b", &[], &["a"], &[]),
        ];
        let err = validate_siblings(&children).unwrap_err();
        assert!(err.downcast_ref::<crate::spec::SpecError>().is_some());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let children = vec![job_node_deps("a", &["a"], &[], &[])];
        assert!(validate_siblings(&children).is_err());
    }

    #[test]
    fn test_mixed_edge_kinds_participate_in_cycle_detection() {
        let children = vec![
            job_node_deps("a", &["b"], &[], &[]),
            job_node_deps("b", &[], &[], &["c"]),
            job_node_deps("c", &[], &["a"], &[]),
        ];
        assert!(validate_siblings(&children).is_err());
    }
}
