//! A local cnat session: store, controller and runner wired together.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use cnat_reconciler::{
    Controller, ControllerConfig, Error, InMemoryStore, Phase, ReconcilerBuilder, ScheduledTask,
    TracingStore,
};
use itertools::Itertools;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::runner::{LocalRunner, RunnerConfig};

/// Options for [`run_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub controller: ControllerConfig,
    pub runner: RunnerConfig,
    /// Return as soon as every task is DONE.
    pub exit_when_done: bool,
}

/// Run `tasks` until `shutdown` resolves, or until all are DONE when
/// `exit_when_done` is set. Returns the final state of every task.
///
/// # Errors
///
/// Fails on invalid configuration, when a task cannot be created, or when
/// the controller exits with an error.
pub async fn run_session<F>(
    tasks: Vec<ScheduledTask>,
    options: SessionOptions,
    shutdown: F,
) -> Result<Vec<ScheduledTask>>
where
    F: Future<Output = ()>,
{
    options.controller.validate()?;

    let store = Arc::new(InMemoryStore::with_capacity(options.controller.events_capacity));
    let reconciler = ReconcilerBuilder::new()
        .with_store(Arc::new(TracingStore::new(Arc::clone(&store))))
        .with_template(options.controller.unit.clone())
        .build()?;

    let controller = Controller::new(
        Arc::new(reconciler),
        store.clone(),
        store.subscribe(),
        options.controller.clone(),
    );
    let runner = LocalRunner::new(Arc::clone(&store), store.subscribe(), options.runner);
    let controller_stopper = controller.stopper();
    let runner_stopper = runner.stopper();
    let mut progress = store.subscribe();

    let controller_handle = tokio::spawn(controller.run());
    let runner_handle = tokio::spawn(runner.run());

    for task in tasks {
        let created = store
            .create_task(task)
            .await
            .context("Failed to create task")?;
        info!(task = %created.key(), schedule = %created.spec.schedule, "Task created");
    }

    tokio::pin!(shutdown);
    loop {
        if options.exit_when_done && all_done(&store).await {
            info!("All tasks are DONE");
            break;
        }
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            received = progress.recv() => match received {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    controller_stopper.stop();
    runner_stopper.stop();
    let controller_result = controller_handle.await.context("Controller task panicked")?;
    if let Err(e) = runner_handle.await {
        warn!(error = %e, "Runner task failed");
    }
    match controller_result {
        // Stopped before its first poll.
        Ok(()) | Err(Error::ControllerStopped) => {}
        Err(e) => return Err(e.into()),
    }

    Ok(store.list_tasks().await)
}

async fn all_done(store: &InMemoryStore) -> bool {
    store
        .list_tasks()
        .await
        .iter()
        .all(|task| *task.phase() == Phase::Done)
}

/// One line per task: key and phase.
pub fn summarize(tasks: &[ScheduledTask]) -> String {
    tasks
        .iter()
        .map(|task| format!("{}\t{}", task.key(), task.status.phase))
        .join("\n")
}
