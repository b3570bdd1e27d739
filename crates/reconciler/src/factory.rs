//! Derives the execution unit for a scheduled task.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{
    Container, ExecutionUnit, ObjectKey, ObjectMeta, OwnerReference, ResourceKind, RestartPolicy,
    ScheduledTask, UnitSpec, UnitStatus,
};

/// Suffix appended to the task name to form the unit name.
pub const UNIT_NAME_SUFFIX: &str = "-pod";

/// Label carrying the owning task's name.
pub const APP_LABEL: &str = "app";

/// Container settings shared by every unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTemplate {
    /// Image the container runs.
    #[serde(default = "default_image")]
    pub image: String,
    /// Name of the single container.
    #[serde(default = "default_container_name")]
    pub container_name: String,
}

impl Default for UnitTemplate {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_name: default_container_name(),
        }
    }
}

fn default_image() -> String {
    "busybox".to_string()
}

fn default_container_name() -> String {
    "busybox".to_string()
}

/// Name of the unit owned by the task called `task_name`.
pub fn unit_name(task_name: &str) -> String {
    format!("{task_name}{UNIT_NAME_SUFFIX}")
}

/// Key of the unit owned by `task`.
pub fn unit_key(task: &ScheduledTask) -> ObjectKey {
    ObjectKey::new(
        task.metadata.namespace.clone(),
        unit_name(&task.metadata.name),
    )
}

/// Split a command line into an argument vector.
///
/// Splits on single spaces only. Quotes and backslashes are ordinary
/// characters. Runs of spaces do not produce empty arguments, so an empty or
/// all-space command yields no arguments at all.
pub fn split_command(command: &str) -> Vec<String> {
    command
        .split(' ')
        .filter(|part| !part.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Build the execution unit for `task`.
pub fn build_unit(task: &ScheduledTask, template: &UnitTemplate) -> ExecutionUnit {
    let labels = BTreeMap::from([(APP_LABEL.to_string(), task.metadata.name.clone())]);

    ExecutionUnit {
        metadata: ObjectMeta {
            labels,
            ..ObjectMeta::new(
                task.metadata.namespace.clone(),
                unit_name(&task.metadata.name),
            )
        },
        spec: UnitSpec {
            containers: vec![Container {
                name: template.container_name.clone(),
                image: template.image.clone(),
                command: split_command(&task.spec.command),
            }],
            restart_policy: RestartPolicy::OnFailure,
        },
        status: UnitStatus::default(),
    }
}

/// Mark `task` as the controlling owner of `unit`.
///
/// # Errors
///
/// Fails when the task has no uid yet, or when the unit is already
/// controlled by a different owner.
pub fn set_controller_reference(task: &ScheduledTask, unit: &mut ExecutionUnit) -> Result<()> {
    let uid = task.metadata.uid.ok_or_else(|| {
        Error::owner_reference(format!("task '{}' has no uid", task.key()))
    })?;

    if let Some(existing) = unit.metadata.controller_owner() {
        if existing.uid != uid {
            return Err(Error::owner_reference(format!(
                "unit '{}' is already controlled by {} '{}'",
                unit.key(),
                existing.kind,
                existing.name
            )));
        }
        return Ok(());
    }

    unit.metadata.owner_references.push(OwnerReference {
        kind: ResourceKind::ScheduledTask,
        name: task.metadata.name.clone(),
        uid,
        controller: true,
    });
    Ok(())
}
