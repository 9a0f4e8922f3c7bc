//! Memoization with the `strace` recorder.
//!
//! These tests return early on hosts where `strace` is missing or ptrace is
//! not permitted.

use convenient_memo::recorder::strace;
use convenient_memo::{CommandRequest, Driver, MemoConfig, Outcome, RecorderChoice, RecorderKind, StaleReason};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn traced_driver(root: &Path) -> Option<Driver> {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    if !strace::is_usable(Path::new("strace")) {
        eprintln!("strace not usable here, skipping");
        return None;
    }
    let config = MemoConfig::new(root).with_recorder(RecorderChoice::Traced);
    Some(Driver::new(config).unwrap())
}

fn workspace() -> TempDir {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a.o"), b"a-object").unwrap();
    fs::write(tmp.path().join("b.o"), b"b-object").unwrap();
    tmp
}

#[test]
fn test_traced_archive_needs_no_candidates() {
    let tmp = workspace();
    let Some(mut d) = traced_driver(tmp.path()) else {
        return;
    };
    assert_eq!(d.recorder_kind(), RecorderKind::Traced);
    let root = d.workspace().root().to_path_buf();
    let archive = CommandRequest::new("sh").args(["-c", "cat a.o b.o > lib.a"]);

    let outcome = d.run(&archive);
    let Outcome::Succeeded(report) = &outcome else {
        panic!("expected a run, got {outcome}");
    };
    assert!(report.inputs.contains(&root.join("a.o")));
    assert!(report.inputs.contains(&root.join("b.o")));
    assert_eq!(report.outputs, vec![root.join("lib.a")]);
    assert!(report.inputs.iter().all(|p| !p.starts_with("/proc")));

    assert!(d.run(&archive).is_skipped());

    fs::write(root.join("a.o"), b"a-object, rebuilt").unwrap();
    let Outcome::Succeeded(report) = d.run(&archive) else {
        panic!("changed input must rerun");
    };
    assert_eq!(report.reason, StaleReason::InputChanged(root.join("a.o")));
}

#[test]
fn test_traced_temporaries_are_not_outputs() {
    let tmp = workspace();
    let Some(mut d) = traced_driver(tmp.path()) else {
        return;
    };
    let root = d.workspace().root().to_path_buf();
    let request = CommandRequest::new("sh").args([
        "-c",
        "cat a.o > scratch.tmp && cat scratch.tmp b.o > lib.a && rm scratch.tmp",
    ]);

    let Outcome::Succeeded(report) = d.run(&request) else {
        panic!("expected a run");
    };
    assert_eq!(report.outputs, vec![root.join("lib.a")]);
    assert!(!report.inputs.contains(&root.join("scratch.tmp")));
}

#[test]
fn test_traced_batch_runs_concurrently_without_mixing() {
    let tmp = workspace();
    let Some(mut d) = traced_driver(tmp.path()) else {
        return;
    };
    let root = d.workspace().root().to_path_buf();
    let batch = vec![
        CommandRequest::new("sh").args(["-c", "sleep 0.2; cat a.o > a.copy"]),
        CommandRequest::new("sh").args(["-c", "sleep 0.2; cat b.o > b.copy"]),
    ];

    let outcomes = d.run_batch(&batch);
    let [Outcome::Succeeded(first), Outcome::Succeeded(second)] = outcomes.as_slice() else {
        panic!("both commands should run: {outcomes:?}");
    };
    assert_eq!(first.outputs, vec![root.join("a.copy")]);
    assert!(!first.inputs.contains(&root.join("b.o")));
    assert_eq!(second.outputs, vec![root.join("b.copy")]);
    assert!(!second.inputs.contains(&root.join("a.o")));
}
