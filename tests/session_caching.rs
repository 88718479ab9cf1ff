use std::path::PathBuf;
use std::sync::Arc;

use dagbox::cache::CacheStore;
use dagbox::dag::{TaskGraph, TaskStatus};
use dagbox::engine::FailureKind;
use dagbox::types::CacheMode;
use dagbox_test_utils::builders::{TaskBuilder, graph};
use dagbox_test_utils::fake_runtime::Script;
use dagbox_test_utils::harness::Harness;
use dagbox_test_utils::init_tracing;

const WRITE_A: &str = "echo hi > out.txt";
const READ_B: &str = "cat out.txt > copy.txt";

/// A writes `out.txt`; B depends on A, reads `out.txt` and writes `copy.txt`.
fn a_b() -> (Harness, TaskGraph) {
    let h = Harness::new();
    h.runtime
        .script(WRITE_A, Script::ok().writes("out.txt", "hi\n"))
        .script(READ_B, Script::ok().writes("copy.txt", "hi\n"));

    let g = graph([
        TaskBuilder::new("A", WRITE_A).output("out.txt"),
        TaskBuilder::new("B", READ_B)
            .after("A")
            .input("out.txt")
            .output("copy.txt"),
    ]);
    (h, g)
}

#[tokio::test]
async fn second_run_is_served_entirely_from_cache() {
    init_tracing();
    let (h, g) = a_b();

    let first = h.run(&g, &[]).await;
    assert!(first.success);
    assert_eq!(first.status_of("A"), Some(TaskStatus::Succeeded));
    assert_eq!(first.status_of("B"), Some(TaskStatus::Succeeded));
    assert_eq!(h.read("out.txt"), "hi\n");
    assert_eq!(h.read("copy.txt"), "hi\n");
    assert_eq!(h.runtime.created(), 2);

    let second = h.run(&g, &[]).await;
    assert!(second.success);
    assert_eq!(second.status_of("A"), Some(TaskStatus::CachedSucceeded));
    assert_eq!(second.status_of("B"), Some(TaskStatus::CachedSucceeded));
    assert_eq!(h.runtime.created(), 2, "a cache hit must not create a container");

    assert_eq!(
        first.report("B").unwrap().fingerprint,
        second.report("B").unwrap().fingerprint
    );
}

#[tokio::test]
async fn dependent_receives_upstream_outputs() {
    let (h, g) = a_b();
    h.run(&g, &[]).await;

    let inputs = h.runtime.inputs_of(READ_B).unwrap();
    assert_eq!(inputs, vec![PathBuf::from("out.txt")]);
}

#[tokio::test]
async fn every_container_is_destroyed() {
    let (h, g) = a_b();
    h.run(&g, &[]).await;

    assert_eq!(h.runtime.destroyed(), h.runtime.created());
    assert_eq!(h.runtime.live_containers(), 0);
}

#[tokio::test]
async fn deleted_host_output_forces_a_miss() {
    init_tracing();
    let (h, g) = a_b();
    h.run(&g, &[]).await;

    h.remove("out.txt");
    let outcome = h.run(&g, &[]).await;

    assert!(outcome.success);
    assert_eq!(outcome.status_of("A"), Some(TaskStatus::Succeeded));
    // Same content comes back, so B's key is unchanged.
    assert_eq!(outcome.status_of("B"), Some(TaskStatus::CachedSucceeded));
    assert_eq!(h.runtime.created(), 3);
    assert_eq!(h.read("out.txt"), "hi\n");
}

#[tokio::test]
async fn modified_host_output_forces_a_miss() {
    init_tracing();
    let (h, g) = a_b();
    h.run(&g, &[]).await;

    h.write("out.txt", "tampered\n");
    let outcome = h.run(&g, &[]).await;

    assert!(outcome.success);
    assert_eq!(outcome.status_of("A"), Some(TaskStatus::Succeeded));
    assert_eq!(h.read("out.txt"), "hi\n");
    assert_eq!(outcome.status_of("B"), Some(TaskStatus::CachedSucceeded));
    assert_eq!(h.read("copy.txt"), "hi\n");
}

#[tokio::test]
async fn forced_rerun_with_different_outputs_is_corruption() {
    init_tracing();
    let (mut h, g) = a_b();
    let first = h.run(&g, &[]).await;
    let fp = first.report("A").unwrap().fingerprint.unwrap();
    let original = h.cache.lookup(&fp).unwrap().unwrap();

    h.runtime
        .script(WRITE_A, Script::ok().writes("out.txt", "second\n"));
    h.options.force_all = true;
    let outcome = h.run(&g, &[]).await;

    assert!(!outcome.success);
    let report = outcome.report("A").unwrap();
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.failure, Some(FailureKind::Infrastructure));
    assert!(
        report.message.as_deref().unwrap().contains("different content"),
        "unexpected message: {:?}",
        report.message
    );
    assert_eq!(outcome.status_of("B"), Some(TaskStatus::Skipped));

    // The stored entry and its layer are untouched.
    let stored = h.cache.lookup(&fp).unwrap().unwrap();
    assert_eq!(stored.layer, original.layer);
    assert_eq!(stored.output_digest, original.output_digest);
}

#[tokio::test]
async fn every_commit_gets_its_own_layer() {
    let (mut h, g) = a_b();
    let first = h.run(&g, &[]).await;
    let fp = first.report("A").unwrap().fingerprint.unwrap();
    let before = h.cache.lookup(&fp).unwrap().unwrap().layer.unwrap();

    h.options.force.insert("A".to_string());
    assert!(h.run(&g, &[]).await.success);

    let after = h.cache.lookup(&fp).unwrap().unwrap().layer.unwrap();
    assert_ne!(before, after);
    assert_ne!(before.tag(), after.tag());
    assert_eq!(h.runtime.layers().len(), 3);
}

#[tokio::test]
async fn missing_layer_forces_a_miss() {
    let (h, g) = a_b();
    let first = h.run(&g, &[]).await;

    let fp = first.report("A").unwrap().fingerprint.unwrap();
    let layer = h.cache.lookup(&fp).unwrap().unwrap().layer.unwrap();
    assert!(layer.tag().starts_with(&h.options.layer_tag(&fp)));
    assert!(h.runtime.remove_layer(&layer));

    let second = h.run(&g, &[]).await;
    assert_eq!(second.status_of("A"), Some(TaskStatus::Succeeded));
    assert_eq!(second.status_of("B"), Some(TaskStatus::CachedSucceeded));
}

#[tokio::test]
async fn changed_input_invalidates_downstream() {
    let h = Harness::new();
    h.write("src/main.c", "int main() { return 0; }");
    h.runtime
        .script("cc src/main.c", Script::ok().writes("bin/app", "ELF"));

    let g = graph([TaskBuilder::new("build", "cc src/main.c")
        .input("src")
        .output("bin")]);

    h.run(&g, &[]).await;
    assert_eq!(h.run(&g, &[]).await.status_of("build"), Some(TaskStatus::CachedSucceeded));

    h.write("src/main.c", "int main() { return 1; }");
    assert_eq!(h.run(&g, &[]).await.status_of("build"), Some(TaskStatus::Succeeded));
    assert_eq!(h.read("bin/app"), "ELF");
}

#[tokio::test]
async fn forced_task_executes_but_dependents_still_hit() {
    let (mut h, g) = a_b();
    h.run(&g, &[]).await;

    h.options.force.insert("A".to_string());
    let outcome = h.run(&g, &[]).await;

    assert!(outcome.success);
    assert_eq!(outcome.status_of("A"), Some(TaskStatus::Succeeded));
    assert_eq!(outcome.status_of("B"), Some(TaskStatus::CachedSucceeded));
}

#[tokio::test]
async fn force_all_executes_everything() {
    let (mut h, g) = a_b();
    h.run(&g, &[]).await;

    h.options.force_all = true;
    let outcome = h.run(&g, &[]).await;

    assert_eq!(outcome.status_of("A"), Some(TaskStatus::Succeeded));
    assert_eq!(outcome.status_of("B"), Some(TaskStatus::Succeeded));
    assert_eq!(h.runtime.created(), 4);
}

#[tokio::test]
async fn cache_opt_out_poisons_dependents() {
    let h = Harness::new();
    h.runtime
        .script("fetch", Script::ok().writes("dep.tar", "bytes"))
        .script("unpack", Script::ok().writes("dep", "files"));

    let g = graph([
        TaskBuilder::new("fetch", "fetch").output("dep.tar").cache(false),
        TaskBuilder::new("unpack", "unpack")
            .after("fetch")
            .input("dep.tar")
            .output("dep"),
    ]);

    for _ in 0..2 {
        let outcome = h.run(&g, &[]).await;
        assert!(outcome.success);
        assert_eq!(outcome.status_of("fetch"), Some(TaskStatus::Succeeded));
        assert_eq!(outcome.status_of("unpack"), Some(TaskStatus::Succeeded));
    }

    assert_eq!(h.runtime.created(), 4);
    assert!(h.runtime.layers().is_empty(), "no layer is committed without caching");
}

#[tokio::test]
async fn file_cache_survives_a_new_store() {
    let (mut h, g) = a_b();
    let dir = tempfile::tempdir().unwrap();

    h.cache = Arc::new(CacheStore::open(CacheMode::File, dir.path()));
    h.run(&g, &[]).await;

    h.cache = Arc::new(CacheStore::open(CacheMode::File, dir.path()));
    let outcome = h.run(&g, &[]).await;

    assert_eq!(outcome.status_of("A"), Some(TaskStatus::CachedSucceeded));
    assert_eq!(outcome.status_of("B"), Some(TaskStatus::CachedSucceeded));
}

#[tokio::test]
async fn disabled_cache_reads_always_execute() {
    let (mut h, g) = a_b();
    h.run(&g, &[]).await;

    h.cache = Arc::new(CacheStore::in_memory().with_read(false));
    let outcome = h.run(&g, &[]).await;

    assert_eq!(outcome.status_of("A"), Some(TaskStatus::Succeeded));
    assert_eq!(outcome.status_of("B"), Some(TaskStatus::Succeeded));
}

#[tokio::test]
async fn identical_tasks_run_once() {
    let h = Harness::new();
    h.runtime.script(
        "make docs",
        Script::ok()
            .writes("docs/index.html", "<html/>")
            .delay(std::time::Duration::from_millis(100)),
    );

    let g = graph([
        TaskBuilder::new("docs", "make docs").output("docs"),
        TaskBuilder::new("docs-again", "make docs").output("docs"),
    ]);

    let outcome = h.run(&g, &[]).await;
    assert!(outcome.success);
    assert_eq!(h.runtime.created(), 1);

    let mut statuses = vec![
        outcome.status_of("docs").unwrap(),
        outcome.status_of("docs-again").unwrap(),
    ];
    statuses.sort_by_key(|s| s.label());
    assert_eq!(statuses, vec![TaskStatus::CachedSucceeded, TaskStatus::Succeeded]);
}

#[tokio::test]
async fn dependent_without_declared_inputs_still_sees_upstream_file() {
    let h = Harness::new();
    h.runtime
        .script("echo 1 > out.txt", Script::ok().writes("out.txt", "1\n"))
        .script("cat out.txt", Script::ok().stdout("1\n"));

    let g = graph([
        TaskBuilder::new("A", "echo 1 > out.txt").output("out.txt"),
        TaskBuilder::new("B", "cat out.txt").after("A"),
    ]);

    let first = h.run(&g, &[]).await;
    assert!(first.success);
    assert_eq!(first.report("B").unwrap().stdout, "1\n");
    assert_eq!(
        h.runtime.inputs_of("cat out.txt").unwrap(),
        vec![PathBuf::from("out.txt")]
    );

    let second = h.run(&g, &[]).await;
    assert!(second.success);
    assert_eq!(second.status_of("A"), Some(TaskStatus::CachedSucceeded));
    assert_eq!(second.status_of("B"), Some(TaskStatus::CachedSucceeded));
    assert_eq!(h.runtime.created(), 2);
}
