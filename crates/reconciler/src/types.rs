//! Core types for the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Kind of object held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A user-declared scheduled task.
    ScheduledTask,
    /// The ephemeral unit that runs a task's command.
    ExecutionUnit,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScheduledTask => write!(f, "ScheduledTask"),
            Self::ExecutionUnit => write!(f, "ExecutionUnit"),
        }
    }
}

/// Identity of an object: namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Unique identifier assigned by the store when an object is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(Ulid);

impl Uid {
    /// Create a new random uid.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Create from a ULID.
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Get the inner ULID.
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Back-reference from a dependent object to the object that owns it.
///
/// The store's garbage collector deletes dependents whose owner is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: ResourceKind,
    pub name: String,
    pub uid: Uid,
    /// Whether the owner is the managing controller of the dependent.
    #[serde(default)]
    pub controller: bool,
}

/// Metadata shared by every stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Assigned by the store on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Create metadata for a new object.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Key of the described object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// The owner reference flagged as controller, if any.
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

/// Progress marker of a [`ScheduledTask`].
///
/// Serialized as a plain string. The empty string is the unset value and is
/// treated as [`Phase::Pending`]. Unrecognized strings are kept verbatim so
/// the reconciler can skip them without rewriting the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    /// No phase written yet.
    #[default]
    Unset,
    /// Waiting for the schedule to elapse.
    Pending,
    /// The execution unit has been (or is being) created.
    Running,
    /// The execution unit terminated. Absorbing.
    Done,
    /// A value this controller does not know.
    Unknown(String),
}

impl Phase {
    /// Wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unset => "",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Unknown(raw) => raw,
        }
    }

    /// Map the unset value to [`Phase::Pending`].
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Unset => Self::Pending,
            other => other,
        }
    }

    /// Position in the `Pending -> Running -> Done` order, `None` for unknown values.
    pub const fn rank(&self) -> Option<u8> {
        match self {
            Self::Unset | Self::Pending => Some(0),
            Self::Running => Some(1),
            Self::Done => Some(2),
            Self::Unknown(_) => None,
        }
    }
}

impl From<String> for Phase {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "" => Self::Unset,
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "DONE" => Self::Done,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<&str> for Phase {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.as_str().to_string()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "<unset>"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// What the user asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Target instant, `YYYY-MM-DDTHH:MM:SSZ`.
    pub schedule: String,
    /// Command line to run, split on spaces.
    pub command: String,
}

/// Observed progress, written only by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub phase: Phase,
}

/// Desired-state record: run `command` once at `schedule`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub metadata: ObjectMeta,
    pub spec: TaskSpec,
    #[serde(default)]
    pub status: TaskStatus,
}

impl ScheduledTask {
    /// Create a task with an unset phase.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        schedule: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: TaskSpec {
                schedule: schedule.into(),
                command: command.into(),
            },
            status: TaskStatus::default(),
        }
    }

    /// Key of this task.
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Current phase.
    pub const fn phase(&self) -> &Phase {
        &self.status.phase
    }
}

/// Restart behaviour of an execution unit's container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestartPolicy {
    Always,
    #[default]
    OnFailure,
    Never,
}

impl RestartPolicy {
    /// Whether a container that exited with the given outcome is restarted.
    pub const fn restarts(self, succeeded: bool) -> bool {
        match self {
            Self::Always => true,
            Self::OnFailure => !succeeded,
            Self::Never => false,
        }
    }
}

/// A single container of an execution unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    /// Argument vector, no shell interpretation.
    pub command: Vec<String>,
}

/// Desired shape of an execution unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub containers: Vec<Container>,
    pub restart_policy: RestartPolicy,
}

/// Lifecycle phase reported by the unit's own scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl UnitPhase {
    /// Whether the unit has finished, successfully or not.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        write!(f, "{name}")
    }
}

/// Observed state of an execution unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    #[serde(default)]
    pub phase: UnitPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Ephemeral workload that runs a task's command once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    pub metadata: ObjectMeta,
    pub spec: UnitSpec,
    #[serde(default)]
    pub status: UnitStatus,
}

impl ExecutionUnit {
    /// Key of this unit.
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Key of the task that controls this unit, if set.
    pub fn owner_key(&self) -> Option<ObjectKey> {
        self.metadata
            .controller_owner()
            .map(|owner| ObjectKey::new(self.metadata.namespace.clone(), owner.name.clone()))
    }
}

/// What a single reconcile pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The task no longer exists, or nothing needed doing.
    Nothing,
    /// The schedule has not elapsed yet.
    WaitForSchedule,
    /// The phase moved forward and was persisted.
    PhaseAdvanced { from: Phase, to: Phase },
    /// The execution unit was created.
    UnitCreated { name: String },
    /// The execution unit exists and has not terminated.
    WaitForUnit { name: String },
    /// The phase is not one this controller handles.
    Skipped { phase: Phase },
}

impl ReconcileAction {
    /// Get a description of the action.
    pub fn description(&self) -> String {
        match self {
            Self::Nothing => "nothing to do".to_string(),
            Self::WaitForSchedule => "waiting for schedule".to_string(),
            Self::PhaseAdvanced { from, to } => format!("phase {from} -> {to}"),
            Self::UnitCreated { name } => format!("created unit {name}"),
            Self::WaitForUnit { name } => format!("waiting for unit {name}"),
            Self::Skipped { phase } => format!("skipped unknown phase {phase}"),
        }
    }
}

/// Result of reconciling one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    /// What was done.
    pub action: ReconcileAction,
    /// Re-run the reconcile after this delay.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// A result with no requeue.
    pub const fn done(action: ReconcileAction) -> Self {
        Self {
            action,
            requeue_after: None,
        }
    }

    /// A result asking to be re-run after `delay`.
    pub const fn requeue_after(action: ReconcileAction, delay: Duration) -> Self {
        Self {
            action,
            requeue_after: Some(delay),
        }
    }
}
