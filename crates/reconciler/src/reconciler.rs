//! Reconciler implementation.

use std::sync::Arc;

use tracing::{debug, info, info_span, Instrument};

use crate::error::{Error, Result};
use crate::factory::{build_unit, set_controller_reference, UnitTemplate};
use crate::schedule::{time_until_schedule, Clock, SystemClock};
use crate::store::TaskStore;
use crate::types::{ObjectKey, Phase, ReconcileAction, ReconcileResult, ScheduledTask};

/// Outcome of handling the current phase.
enum Step {
    /// Stop here without writing anything.
    Finish(ReconcileResult),
    /// Write the new phase, if it differs from the stored one.
    Persist(ReconcileAction),
}

/// Observed state of the unit owned by a running task.
enum UnitState {
    Created(String),
    InFlight(String),
    Terminated,
}

/// K8s-style reconciler for scheduled tasks.
///
/// Each call to [`Reconciler::reconcile`] reads the task and its unit, decides
/// one step of `Pending -> Running -> Done`, and writes the phase back. It keeps
/// no state between calls, so concurrent calls for different keys are safe.
pub struct Reconciler {
    /// Declarative store.
    store: Arc<dyn TaskStore>,
    /// Wall clock used to evaluate schedules.
    clock: Arc<dyn Clock>,
    /// Container settings for created units.
    template: UnitTemplate,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, template: UnitTemplate) -> Self {
        Self {
            store,
            clock,
            template,
        }
    }

    /// Create a reconciler using the system clock and the default template.
    pub fn with_system_clock(store: Arc<dyn TaskStore>) -> Self {
        Self::new(store, Arc::new(SystemClock), UnitTemplate::default())
    }

    /// Reconcile the task identified by `key`.
    ///
    /// A missing task is not an error: it was deleted and there is nothing to do.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed schedules and failed store operations.
    /// The caller should retry with backoff.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileResult> {
        let span = info_span!("reconcile", namespace = %key.namespace, task = %key.name);
        self.reconcile_task(key).instrument(span).await
    }

    async fn reconcile_task(&self, key: &ObjectKey) -> Result<ReconcileResult> {
        debug!("Reconciling task");

        let mut task = match self.store.get_task(key).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                debug!("Task not found, assuming it was deleted");
                return Ok(ReconcileResult::done(ReconcileAction::Nothing));
            }
            Err(e) => return Err(Error::store("get_task", e)),
        };

        let stored_phase = task.status.phase.clone();
        task.status.phase = stored_phase.clone().normalized();

        let step = match task.status.phase.clone() {
            Phase::Unset | Phase::Pending => self.pending(&mut task)?,
            Phase::Running => self.running(&mut task).await?,
            Phase::Done => {
                debug!("Phase: DONE");
                Step::Finish(ReconcileResult::done(ReconcileAction::Nothing))
            }
            unknown @ Phase::Unknown(_) => {
                info!(phase = %unknown, "Unknown phase, nothing to do");
                Step::Finish(ReconcileResult::done(ReconcileAction::Skipped {
                    phase: unknown,
                }))
            }
        };

        match step {
            Step::Finish(result) => Ok(result),
            Step::Persist(action) => self.persist(&task, stored_phase, action).await,
        }
    }

    /// Waiting for the schedule: requeue until it elapses, then start running.
    fn pending(&self, task: &mut ScheduledTask) -> Result<Step> {
        debug!(schedule = %task.spec.schedule, "Phase: PENDING");

        let remaining = time_until_schedule(&task.spec.schedule, self.clock.as_ref())
            .inspect_err(|e| info!(error = %e, "Schedule parsing failure"))?;

        if let Ok(delay) = remaining.to_std() {
            if !delay.is_zero() {
                debug!(delay_ms = remaining.num_milliseconds(), "Not yet time");
                return Ok(Step::Finish(ReconcileResult::requeue_after(
                    ReconcileAction::WaitForSchedule,
                    delay,
                )));
            }
        }

        info!(command = %task.spec.command, "It's time, ready to execute");
        task.status.phase = Phase::Running;
        Ok(Step::Persist(ReconcileAction::Nothing))
    }

    /// Running: make sure the unit exists and watch for it to terminate.
    async fn running(&self, task: &mut ScheduledTask) -> Result<Step> {
        debug!("Phase: RUNNING");

        match self.ensure_unit(task).await? {
            UnitState::Created(name) => Ok(Step::Persist(ReconcileAction::UnitCreated { name })),
            // The unit's own status changes wake us up again.
            UnitState::InFlight(name) => Ok(Step::Finish(ReconcileResult::done(
                ReconcileAction::WaitForUnit { name },
            ))),
            UnitState::Terminated => {
                task.status.phase = Phase::Done;
                Ok(Step::Persist(ReconcileAction::Nothing))
            }
        }
    }

    async fn ensure_unit(&self, task: &ScheduledTask) -> Result<UnitState> {
        let mut unit = build_unit(task, &self.template);
        set_controller_reference(task, &mut unit)?;
        let name = unit.metadata.name.clone();

        match self.store.get_unit(&unit.key()).await {
            Ok(found) if found.status.phase.is_terminal() => {
                info!(
                    unit = %name,
                    unit_phase = %found.status.phase,
                    reason = found.status.reason.as_deref().unwrap_or(""),
                    message = found.status.message.as_deref().unwrap_or(""),
                    "Container terminated"
                );
                Ok(UnitState::Terminated)
            }
            Ok(found) => {
                debug!(unit = %name, unit_phase = %found.status.phase, "Unit still in flight");
                Ok(UnitState::InFlight(name))
            }
            Err(e) if e.is_not_found() => match self.store.create_unit(unit).await {
                Ok(_) => {
                    info!(unit = %name, "Unit launched");
                    Ok(UnitState::Created(name))
                }
                Err(e) if e.is_already_exists() => {
                    debug!(unit = %name, "Unit appeared concurrently");
                    Ok(UnitState::InFlight(name))
                }
                Err(e) => Err(Error::unit_create(name, e)),
            },
            Err(e) => Err(Error::store("get_unit", e)),
        }
    }

    /// Write the phase back when it changed during this pass.
    async fn persist(
        &self,
        task: &ScheduledTask,
        stored_phase: Phase,
        action: ReconcileAction,
    ) -> Result<ReconcileResult> {
        if task.status.phase == stored_phase {
            return Ok(ReconcileResult::done(action));
        }

        match self.store.update_task_status(task).await {
            Ok(_) => {
                let from = stored_phase.normalized();
                info!(from = %from, to = %task.status.phase, "Phase advanced");
                let action = match action {
                    ReconcileAction::Nothing => ReconcileAction::PhaseAdvanced {
                        from,
                        to: task.status.phase.clone(),
                    },
                    other => other,
                };
                Ok(ReconcileResult::done(action))
            }
            Err(e) if e.is_not_found() => {
                debug!("Task deleted before its status was written");
                Ok(ReconcileResult::done(ReconcileAction::Nothing))
            }
            Err(e) => Err(Error::store("update_task_status", e)),
        }
    }

    /// Get the unit template.
    pub const fn template(&self) -> &UnitTemplate {
        &self.template
    }
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    template: UnitTemplate,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            store: None,
            clock: None,
            template: UnitTemplate::default(),
        }
    }

    /// Set the store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set a custom clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the unit template.
    #[must_use]
    pub fn with_template(mut self, template: UnitTemplate) -> Self {
        self.template = template;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when no store was given.
    pub fn build(self) -> Result<Reconciler> {
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("Store is required"))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        Ok(Reconciler::new(store, clock, self.template))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
