use std::time::Duration;

use dagbox::dag::TaskStatus;
use dagbox::engine::FailureKind;
use dagbox_test_utils::builders::{TaskBuilder, graph};
use dagbox_test_utils::fake_runtime::{Event, Script};
use dagbox_test_utils::harness::Harness;
use dagbox_test_utils::{init_tracing, with_timeout};
use tokio::sync::watch;

#[tokio::test]
async fn parallelism_one_runs_strictly_in_declaration_order() {
    init_tracing();
    let mut h = Harness::new();
    h.options.parallelism = 1;
    for cmd in ["one", "two", "three"] {
        h.runtime
            .script(cmd, Script::ok().delay(Duration::from_millis(20)));
    }

    let g = graph([
        TaskBuilder::new("t1", "one"),
        TaskBuilder::new("t2", "two"),
        TaskBuilder::new("t3", "three"),
    ]);
    let outcome = h.run(&g, &[]).await;
    assert!(outcome.success);

    let execs: Vec<String> = h
        .runtime
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::ExecStarted { command, .. } => Some(format!("start {command}")),
            Event::ExecFinished { command, .. } => Some(format!("end {command}")),
            _ => None,
        })
        .collect();
    assert_eq!(
        execs,
        vec![
            "start one", "end one", "start two", "end two", "start three", "end three"
        ]
    );
    assert_eq!(h.runtime.max_concurrency(), 1);
}

#[tokio::test]
async fn running_tasks_never_exceed_parallelism() {
    let mut h = Harness::new();
    h.options.parallelism = 2;
    let names: Vec<String> = (0..6).map(|i| format!("job{i}")).collect();
    for name in &names {
        h.runtime
            .script(name, Script::ok().delay(Duration::from_millis(30)));
    }

    let g = graph(names.iter().map(|n| TaskBuilder::new(n, n)));
    let outcome = h.run(&g, &[]).await;

    assert!(outcome.success);
    assert!(h.runtime.max_concurrency() <= 2);
    assert_eq!(h.runtime.created(), 6);
}

#[tokio::test]
async fn dependents_wait_for_their_dependencies() {
    let h = Harness::new();
    h.runtime
        .script("slow", Script::ok().delay(Duration::from_millis(50)));
    let g = graph([
        TaskBuilder::new("deploy", "ship").after("build"),
        TaskBuilder::new("build", "slow"),
    ]);

    h.run(&g, &[]).await;

    let events = h.runtime.events();
    let build_done = events
        .iter()
        .position(|e| matches!(e, Event::ExecFinished { command, .. } if command == "slow"))
        .unwrap();
    let deploy_start = events
        .iter()
        .position(|e| matches!(e, Event::ExecStarted { command, .. } if command == "ship"))
        .unwrap();
    assert!(build_done < deploy_start);
}

#[tokio::test]
async fn selection_runs_only_the_closure() {
    let h = Harness::new();
    let g = graph([
        TaskBuilder::new("fetch", "fetch"),
        TaskBuilder::new("build", "build").after("fetch"),
        TaskBuilder::new("docs", "docs"),
    ]);

    let outcome = h.run(&g, &["build"]).await;

    let names: Vec<&str> = outcome.reports.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["fetch", "build"]);
    assert_eq!(outcome.status_of("docs"), None);
}

#[tokio::test]
async fn user_and_environment_reach_the_runtime() {
    let h = Harness::new();
    let g = graph([TaskBuilder::new("A", "env")
        .user("builder")
        .env("CI", "1")]);

    h.run(&g, &[]).await;

    assert!(h.runtime.events().iter().any(|e| matches!(
        e,
        Event::ExecStarted { command, user, .. } if command == "env" && user == "builder"
    )));
}

#[tokio::test]
async fn cancellation_skips_pending_work_and_destroys_containers() {
    init_tracing();
    let mut h = Harness::new();
    h.options.parallelism = 1;
    h.runtime
        .script("long", Script::ok().delay(Duration::from_secs(30)));

    let g = graph([
        TaskBuilder::new("A", "long"),
        TaskBuilder::new("B", "other"),
        TaskBuilder::new("C", "after-a").after("A"),
    ]);

    let (tx, rx) = watch::channel(false);
    let session = h.session(&g, &[]).unwrap();
    let handle = tokio::spawn(session.run(rx));

    with_timeout(async {
        while !h.runtime.executed().contains(&"long".to_string()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    tx.send(true).unwrap();

    let outcome = with_timeout(handle).await.unwrap();

    assert!(outcome.cancelled);
    assert!(!outcome.success);
    let a = outcome.report("A").unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.failure, Some(FailureKind::Cancelled));
    assert_eq!(outcome.status_of("B"), Some(TaskStatus::Skipped));
    assert_eq!(outcome.status_of("C"), Some(TaskStatus::Skipped));

    assert_eq!(h.runtime.live_containers(), 0);
    assert_eq!(h.runtime.destroyed(), h.runtime.created());
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let h = Harness::new();
    let g = graph([TaskBuilder::new("A", "true"), TaskBuilder::new("B", "true")]);

    let (_tx, rx) = watch::channel(true);
    let outcome = h.session(&g, &[]).unwrap().run(rx).await;

    assert!(outcome.cancelled);
    assert_eq!(outcome.skipped.len(), 2);
    assert_eq!(h.runtime.created(), 0);
}

#[tokio::test]
async fn cancellation_during_container_creation_still_destroys_it() {
    init_tracing();
    let h = Harness::new();
    h.runtime.create_delay(Duration::from_millis(200));
    let g = graph([TaskBuilder::new("A", "true")]);

    let (tx, rx) = watch::channel(false);
    let session = h.session(&g, &[]).unwrap();
    let handle = tokio::spawn(session.run(rx));

    with_timeout(async {
        while h.runtime.created() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    tx.send(true).unwrap();

    let outcome = with_timeout(handle).await.unwrap();

    assert!(outcome.cancelled);
    let a = outcome.report("A").unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.failure, Some(FailureKind::Cancelled));
    assert!(h.runtime.executed().is_empty());
    assert_eq!(h.runtime.live_containers(), 0);
    assert_eq!(h.runtime.destroyed(), 1);
}
