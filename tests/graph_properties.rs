use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use dagbox::dag::{Completion, Scheduler, TaskGraph, TaskIndex, TaskStatus};
use dagbox::errors::DagboxError;
use dagbox::fingerprint::Fingerprint;
use dagbox_test_utils::builders::{TaskBuilder, graph};
use proptest::prelude::*;

// Strategy to generate a valid DAG.
// Acyclicity: task N may only depend on tasks 0..N-1. The declaration order
// is then shuffled so dependencies can also point "forward".
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = TaskGraph> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        let deps = proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..num_tasks),
            num_tasks,
        );
        let order = Just((0..num_tasks).collect::<Vec<_>>()).prop_shuffle();

        (deps, order).prop_map(move |(raw_deps, order)| {
            let mut builders: Vec<Option<TaskBuilder>> = raw_deps
                .into_iter()
                .enumerate()
                .map(|(i, potential)| {
                    let name = format!("task_{i}");
                    let mut builder = TaskBuilder::new(&name, &format!("echo {name}"));
                    let valid: BTreeSet<usize> = if i == 0 {
                        BTreeSet::new()
                    } else {
                        potential.into_iter().map(|d| d % i).collect()
                    };
                    for dep in valid {
                        builder = builder.after(&format!("task_{dep}"));
                    }
                    Some(builder)
                })
                .collect();

            graph(order.into_iter().filter_map(|i| builders[i].take()))
        })
    })
}

proptest! {
    #[test]
    fn topological_order_puts_dependencies_first(g in dag_strategy(12)) {
        let order = g.topological_order().unwrap();
        prop_assert_eq!(order.len(), g.len());

        let position: HashMap<TaskIndex, usize> =
            order.iter().enumerate().map(|(pos, idx)| (*idx, pos)).collect();
        prop_assert_eq!(position.len(), g.len());

        for (idx, _) in g.tasks() {
            for dep in g.dependencies_of(idx) {
                prop_assert!(position[&dep] < position[&idx]);
            }
        }
    }

    #[test]
    fn scheduler_terminates_and_skips_downstream_of_failures(
        g in dag_strategy(10),
        failing in proptest::collection::hash_set(0..10usize, 0..4),
        parallelism in 1..4usize,
    ) {
        let g = Arc::new(g);
        let all: Vec<TaskIndex> = g.tasks().map(|(i, _)| i).collect();
        let mut scheduler = Scheduler::new(Arc::clone(&g), &all, parallelism);

        let mut queue: VecDeque<TaskIndex> = VecDeque::new();
        let step = scheduler.start();
        queue.extend(step.newly_scheduled.iter().map(|t| t.index));

        let mut steps = 0;
        while let Some(idx) = queue.pop_front() {
            prop_assert!(scheduler.running_count() <= parallelism);
            steps += 1;
            prop_assert!(steps <= g.len(), "a task was dispatched twice");

            let n: usize = g.name_of(idx).trim_start_matches("task_").parse().unwrap();
            let completion = if failing.contains(&n) {
                Completion::Failed
            } else {
                Completion::Succeeded {
                    fingerprint: Fingerprint::from_bytes([n as u8; 32]),
                    cached: false,
                }
            };
            let step = scheduler.complete(idx, completion);
            queue.extend(step.newly_scheduled.iter().map(|t| t.index));
        }

        prop_assert!(scheduler.is_finished());

        let failed: HashSet<TaskIndex> = all
            .iter()
            .copied()
            .filter(|i| scheduler.status(*i) == Some(TaskStatus::Failed))
            .collect();
        for &idx in &all {
            let status = scheduler.status(idx).unwrap();
            let upstream_failed = g
                .transitive_dependencies(idx)
                .iter()
                .any(|d| failed.contains(d));
            if upstream_failed {
                prop_assert_eq!(status, TaskStatus::Skipped);
            } else {
                prop_assert!(matches!(status, TaskStatus::Succeeded | TaskStatus::Failed));
            }
        }
    }
}

#[test]
fn unknown_dependency_is_rejected() {
    let err = TaskGraph::from_tasks([TaskBuilder::new("A", "true").after("ghost").build()])
        .unwrap_err();
    assert!(matches!(
        err,
        DagboxError::UnknownDependency { task, dependency } if task == "A" && dependency == "ghost"
    ));
}

#[test]
fn duplicate_task_is_rejected() {
    let err = TaskGraph::from_tasks([
        TaskBuilder::new("A", "true").build(),
        TaskBuilder::new("A", "false").build(),
    ])
    .unwrap_err();
    assert!(matches!(err, DagboxError::DuplicateTask(name) if name == "A"));
}

#[test]
fn two_task_cycle_names_both_members() {
    let err = TaskGraph::from_tasks([
        TaskBuilder::new("A", "true").after("B").build(),
        TaskBuilder::new("B", "true").after("A").build(),
    ])
    .unwrap_err();
    match err {
        DagboxError::CycleDetected { members } => {
            assert!(members.contains(&"A".to_string()));
            assert!(members.contains(&"B".to_string()));
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
}
