//! K8s-style reconciliation loop that runs a command at a scheduled time.
//!
//! A [`ScheduledTask`] declares "run this command at this instant". The
//! [`Reconciler`] drives it through three phases:
//!
//! - **Pending**: wait until the schedule elapses, asking to be re-invoked
//!   after the remaining time
//! - **Running**: create the task's [`ExecutionUnit`] once, then wait for it
//!   to terminate
//! - **Done**: nothing more to do, forever
//!
//! # Key Concepts
//!
//! ## Reconciliation
//!
//! Each reconcile pass is level-triggered and stateless:
//! 1. Fetch the task (a missing task was deleted; nothing to do)
//! 2. Decide one step from its phase, the schedule, and the unit's status
//! 3. Write the phase back if it moved
//!
//! ## Collaborators
//!
//! - [`TaskStore`] - the declarative store holding tasks and units
//! - [`Clock`] - wall-clock time used to evaluate schedules
//! - [`Controller`] - work queue, requeue timers and retry backoff
//!
//! # Example
//!
//! ```ignore
//! use cnat_reconciler::{
//!     Controller, ControllerConfig, InMemoryStore, Reconciler, ScheduledTask,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = InMemoryStore::new_arc();
//!     let reconciler = Arc::new(Reconciler::with_system_clock(store.clone()));
//!     let controller = Controller::new(
//!         reconciler,
//!         store.clone(),
//!         store.subscribe(),
//!         ControllerConfig::default(),
//!     );
//!
//!     store
//!         .create_task(ScheduledTask::new(
//!             "default",
//!             "example-at",
//!             "2030-01-01T00:00:00Z",
//!             "echo YAY",
//!         ))
//!         .await
//!         .unwrap();
//!
//!     // Run until stopped
//!     // controller.run().await;
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod config;
pub mod controller;
pub mod error;
pub mod factory;
pub mod reconciler;
pub mod schedule;
pub mod store;
pub mod types;

// Re-export main types
pub use config::ControllerConfig;
pub use controller::{Backoff, Controller, ControllerStopper, WorkQueue};
pub use error::{Error, Result, StoreError};
pub use factory::{build_unit, set_controller_reference, split_command, unit_key, unit_name, UnitTemplate};
pub use reconciler::{Reconciler, ReconcilerBuilder};
pub use schedule::{
    format_schedule, parse_schedule, time_until, time_until_schedule, Clock, ManualClock,
    SystemClock,
};
pub use store::{ChangeKind, InMemoryStore, StoreResult, TaskStore, TracingStore, WatchEvent};
pub use types::{
    Container, ExecutionUnit, ObjectKey, ObjectMeta, OwnerReference, Phase, ReconcileAction,
    ReconcileResult, ResourceKind, RestartPolicy, ScheduledTask, TaskSpec, TaskStatus, Uid,
    UnitPhase, UnitSpec, UnitStatus,
};
