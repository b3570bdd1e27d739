//! End-to-end tests of the local runner and session.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cnat::runner::{REASON_CANNOT_RUN, REASON_COMPLETED, REASON_ERROR};
use cnat::{LocalRunner, RunnerConfig, SessionOptions, parse_manifest, run_session, summarize};
use cnat_reconciler::{
    ExecutionUnit, InMemoryStore, ObjectKey, Phase, ScheduledTask, TaskStore, UnitPhase,
    UnitTemplate, build_unit, format_schedule, set_controller_reference,
};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn start_runner(store: &Arc<InMemoryStore>, max_restarts: u32) -> cnat::RunnerStopper {
    let runner = LocalRunner::new(
        Arc::clone(store),
        store.subscribe(),
        RunnerConfig { max_restarts },
    );
    let stopper = runner.stopper();
    tokio::spawn(runner.run());
    stopper
}

async fn create_unit_for(store: &InMemoryStore, name: &str, command: &str) -> ObjectKey {
    let task = store
        .create_task(ScheduledTask::new("default", name, "2020-01-01T00:00:00Z", command))
        .await
        .unwrap();
    let mut unit = build_unit(&task, &UnitTemplate::default());
    set_controller_reference(&task, &mut unit).unwrap();
    store.create_unit(unit).await.unwrap().key()
}

async fn wait_terminal(store: &InMemoryStore, key: &ObjectKey) -> ExecutionUnit {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let unit = store.get_unit(key).await.unwrap();
            if unit.status.phase.is_terminal() {
                return unit;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("unit never terminated")
}

#[tokio::test]
async fn test_successful_command_succeeds() {
    let store = InMemoryStore::new_arc();
    let stopper = start_runner(&store, 0).await;

    let key = create_unit_for(&store, "ok", "true").await;
    let unit = wait_terminal(&store, &key).await;

    assert_eq!(unit.status.phase, UnitPhase::Succeeded);
    assert_eq!(unit.status.reason.as_deref(), Some(REASON_COMPLETED));
    stopper.stop();
}

#[tokio::test]
async fn test_failing_command_fails_after_restarts() {
    let store = InMemoryStore::new_arc();
    let stopper = start_runner(&store, 2).await;

    let key = create_unit_for(&store, "bad", "false").await;
    let unit = wait_terminal(&store, &key).await;

    assert_eq!(unit.status.phase, UnitPhase::Failed);
    assert_eq!(unit.status.reason.as_deref(), Some(REASON_ERROR));
    assert_eq!(unit.status.message.as_deref(), Some("exit code 1"));
    stopper.stop();
}

#[tokio::test]
async fn test_empty_or_missing_program_cannot_run() {
    let store = InMemoryStore::new_arc();
    let stopper = start_runner(&store, 3).await;

    let empty = create_unit_for(&store, "empty", "").await;
    let missing = create_unit_for(&store, "missing", "/nonexistent/cnat-binary --flag").await;

    for key in [empty, missing] {
        let unit = wait_terminal(&store, &key).await;
        assert_eq!(unit.status.phase, UnitPhase::Failed, "unit {key}");
        assert_eq!(unit.status.reason.as_deref(), Some(REASON_CANNOT_RUN));
    }
    stopper.stop();
}

#[tokio::test]
async fn test_session_runs_due_tasks_to_done() {
    let due = format_schedule(Utc::now() - chrono::Duration::seconds(5));
    let soon = format_schedule(Utc::now() + chrono::Duration::seconds(1));
    let manifest = format!(
        "- {{name: first, schedule: '{due}', command: 'true'}}\n\
         - {{name: second, schedule: '{soon}', command: 'false'}}\n"
    );
    let tasks = parse_manifest(&manifest).unwrap();

    let options = SessionOptions {
        runner: RunnerConfig { max_restarts: 0 },
        exit_when_done: true,
        ..SessionOptions::default()
    };
    let finished = tokio::time::timeout(
        TIMEOUT,
        run_session(tasks, options, std::future::pending::<()>()),
    )
    .await
    .expect("session never finished")
    .unwrap();

    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|task| *task.phase() == Phase::Done));
    assert_eq!(summarize(&finished), "default/first\tDONE\ndefault/second\tDONE");
}

#[tokio::test]
async fn test_session_finishes_when_change_feed_overflows() {
    let due = format_schedule(Utc::now() - chrono::Duration::seconds(5));
    let tasks = (0..8)
        .map(|i| ScheduledTask::new("default", format!("burst-{i}"), due.clone(), "true"))
        .collect::<Vec<_>>();

    let mut options = SessionOptions {
        exit_when_done: true,
        ..SessionOptions::default()
    };
    options.controller.events_capacity = 1;

    let finished = tokio::time::timeout(
        TIMEOUT,
        run_session(tasks, options, std::future::pending::<()>()),
    )
    .await
    .expect("session stalled after the change feed lagged")
    .unwrap();

    assert_eq!(finished.len(), 8);
    assert!(finished.iter().all(|task| *task.phase() == Phase::Done));
}

#[tokio::test]
async fn test_session_stops_on_shutdown() {
    let later = format_schedule(Utc::now() + chrono::Duration::hours(1));
    let tasks = vec![ScheduledTask::new("default", "later", later, "true")];

    let options = SessionOptions {
        exit_when_done: true,
        ..SessionOptions::default()
    };
    let finished = run_session(tasks, options, tokio::time::sleep(Duration::from_millis(200)))
        .await
        .unwrap();

    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].phase().clone().normalized(), Phase::Pending);
}

#[tokio::test]
async fn test_session_rejects_invalid_config() {
    let mut options = SessionOptions::default();
    options.controller.workers = 0;

    let result = run_session(Vec::new(), options, std::future::pending::<()>()).await;
    assert!(result.is_err());
}
