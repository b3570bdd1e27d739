//! Local execution-unit runner.
//!
//! Stands in for the cluster's unit scheduler when cnat runs on a single
//! machine: every created unit has its argument vector executed as a child
//! process, and the outcome is written back to the unit's status.

use std::collections::HashSet;
use std::sync::Arc;

use cnat_reconciler::{
    ChangeKind, ExecutionUnit, InMemoryStore, ObjectKey, ResourceKind, TaskStore, UnitPhase,
    UnitStatus, WatchEvent,
};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Reason reported when a container could not be started at all.
pub const REASON_CANNOT_RUN: &str = "ContainerCannotRun";

/// Reason reported when a container exited non-zero.
pub const REASON_ERROR: &str = "Error";

/// Reason reported when a container exited zero.
pub const REASON_COMPLETED: &str = "Completed";

/// Configuration for the local runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Restarts allowed for a failing container before the unit fails.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
        }
    }
}

const fn default_max_restarts() -> u32 {
    3
}

/// How a single container attempt ended.
enum Attempt {
    Exited { success: bool, code: Option<i32> },
    CannotRun(String),
}

/// Runs execution units as local processes.
pub struct LocalRunner {
    store: Arc<InMemoryStore>,
    events: broadcast::Receiver<WatchEvent>,
    config: RunnerConfig,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl LocalRunner {
    /// Create a runner fed by `events`.
    pub fn new(
        store: Arc<InMemoryStore>,
        events: broadcast::Receiver<WatchEvent>,
        config: RunnerConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            store,
            events,
            config,
            stop_rx,
            stop_tx,
        }
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> RunnerStopper {
        RunnerStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Run until stopped. Children still running are killed on stop.
    ///
    /// Each unit is started at most once. When the change feed lags, every
    /// pending unit not yet started is picked up from the store.
    pub async fn run(mut self) {
        info!(max_restarts = self.config.max_restarts, "Local runner started");
        let mut running = JoinSet::new();
        let mut started = HashSet::new();

        loop {
            tokio::select! {
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
                received = self.events.recv() => match received {
                    Ok(event) if is_unit(&event, ChangeKind::Added) => {
                        if started.insert(event.key.clone()) {
                            running.spawn(execute(Arc::clone(&self.store), event.key, self.config));
                        }
                    }
                    Ok(event) if is_unit(&event, ChangeKind::Deleted) => {
                        started.remove(&event.key);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Runner lagged behind the change feed, rescanning units");
                        for key in self.unstarted_units(&started).await {
                            started.insert(key.clone());
                            running.spawn(execute(Arc::clone(&self.store), key, self.config));
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(_) = running.join_next(), if !running.is_empty() => {}
            }
        }

        running.shutdown().await;
        info!("Local runner stopped");
    }

    /// Pending units this runner has not started.
    async fn unstarted_units(&self, started: &HashSet<ObjectKey>) -> Vec<ObjectKey> {
        self.store
            .list_units()
            .await
            .iter()
            .filter(|unit| unit.status.phase == UnitPhase::Pending)
            .map(ExecutionUnit::key)
            .filter(|key| !started.contains(key))
            .collect()
    }
}

fn is_unit(event: &WatchEvent, change: ChangeKind) -> bool {
    event.kind == ResourceKind::ExecutionUnit && event.change == change
}

async fn execute(store: Arc<InMemoryStore>, key: ObjectKey, config: RunnerConfig) {
    let unit = match store.get_unit(&key).await {
        Ok(unit) => unit,
        Err(e) => {
            debug!(unit = %key, error = %e, "Unit vanished before it started");
            return;
        }
    };

    let status = supervise(&store, &unit, config).await;
    info!(unit = %key, phase = %status.phase, reason = status.reason.as_deref().unwrap_or(""), "Unit finished");
    if let Err(e) = store.update_unit_status(&key, status).await {
        debug!(unit = %key, error = %e, "Could not report unit status");
    }
}

/// Run the unit's container until it succeeds or its restart budget runs out.
async fn supervise(store: &InMemoryStore, unit: &ExecutionUnit, config: RunnerConfig) -> UnitStatus {
    let key = unit.key();
    let Some(argv) = unit.spec.containers.first().map(|c| c.command.clone()) else {
        return failed(REASON_CANNOT_RUN, "unit has no containers");
    };
    let Some((program, args)) = argv.split_first() else {
        return failed(REASON_CANNOT_RUN, "container command is empty");
    };

    let running = UnitStatus {
        phase: UnitPhase::Running,
        ..UnitStatus::default()
    };
    if store.update_unit_status(&key, running).await.is_err() {
        return failed(REASON_ERROR, "unit deleted before start");
    }

    let mut restarts = 0u32;
    loop {
        debug!(unit = %key, program = %program, attempt = restarts, "Starting container");
        let attempt = match Command::new(program).args(args).kill_on_drop(true).status().await {
            Ok(exit) => Attempt::Exited {
                success: exit.success(),
                code: exit.code(),
            },
            Err(e) => Attempt::CannotRun(e.to_string()),
        };

        match attempt {
            Attempt::Exited { success: true, .. } => {
                return UnitStatus {
                    phase: UnitPhase::Succeeded,
                    reason: Some(REASON_COMPLETED.to_string()),
                    message: None,
                };
            }
            Attempt::CannotRun(message) => return failed(REASON_CANNOT_RUN, &message),
            Attempt::Exited { success: false, code } => {
                let message = code.map_or_else(
                    || "terminated by signal".to_string(),
                    |code| format!("exit code {code}"),
                );
                if !unit.spec.restart_policy.restarts(false) || restarts >= config.max_restarts {
                    return failed(REASON_ERROR, &message);
                }
                restarts = restarts.saturating_add(1);
                warn!(unit = %key, %message, restarts, "Container failed, restarting");
            }
        }
    }
}

fn failed(reason: &str, message: &str) -> UnitStatus {
    UnitStatus {
        phase: UnitPhase::Failed,
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Handle to stop a running [`LocalRunner`].
#[derive(Clone)]
pub struct RunnerStopper {
    stop_tx: watch::Sender<bool>,
}

impl RunnerStopper {
    /// Stop the runner.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}
