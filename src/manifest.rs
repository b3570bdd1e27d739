//! Task manifests.
//!
//! A manifest is a YAML list of tasks:
//!
//! ```yaml
//! - name: example-at
//!   schedule: "2030-01-01T00:00:00Z"
//!   command: echo YAY
//! - name: cleanup
//!   namespace: ops
//!   schedule: "2030-01-01T01:00:00Z"
//!   command: rm -rf /tmp/scratch
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use cnat_reconciler::ScheduledTask;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Namespace used when a manifest entry names none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskManifest {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub schedule: String,
    pub command: String,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl From<TaskManifest> for ScheduledTask {
    fn from(entry: TaskManifest) -> Self {
        Self::new(entry.namespace, entry.name, entry.schedule, entry.command)
    }
}

/// Parse manifest text into tasks.
///
/// Schedules are not checked here: a malformed schedule is reported by the
/// reconciler, like any other task.
///
/// # Errors
///
/// Fails on invalid YAML, empty names, or duplicate task keys.
pub fn parse_manifest(raw: &str) -> Result<Vec<ScheduledTask>> {
    let entries: Vec<TaskManifest> =
        serde_yaml::from_str(raw).context("Manifest is not a YAML list of tasks")?;

    if let Some(unnamed) = entries.iter().position(|e| e.name.trim().is_empty()) {
        bail!("Manifest entry {unnamed} has an empty name");
    }

    let tasks = entries.into_iter().map(ScheduledTask::from).collect_vec();
    if let Some(duplicate) = tasks.iter().map(ScheduledTask::key).duplicates().next() {
        bail!("Task '{duplicate}' is declared more than once");
    }

    Ok(tasks)
}

/// Load a manifest file.
///
/// # Errors
///
/// Fails when the file cannot be read or does not parse.
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Vec<ScheduledTask>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest '{}'", path.display()))?;
    parse_manifest(&raw).with_context(|| format!("Invalid manifest '{}'", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cnat_reconciler::{ObjectKey, Phase};

    #[test]
    fn test_parse_manifest() {
        let tasks = parse_manifest(
            r#"
- name: example-at
  schedule: "2030-01-01T00:00:00Z"
  command: echo YAY
- name: cleanup
  namespace: ops
  schedule: "2030-01-01T01:00:00Z"
  command: "true"
"#,
        )
        .unwrap();

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].key(), ObjectKey::new("default", "example-at"));
        assert_eq!(tasks[0].spec.command, "echo YAY");
        assert_eq!(tasks[0].status.phase, Phase::Unset);
        assert_eq!(tasks[1].key(), ObjectKey::new("ops", "cleanup"));
    }

    #[test]
    fn test_rejects_duplicates_and_unknown_fields() {
        let duplicate = "- {name: a, schedule: x, command: y}\n- {name: a, schedule: x, command: y}";
        assert!(parse_manifest(duplicate).is_err());

        let unknown = "- {name: a, schedule: x, command: y, cron: '* * * * *'}";
        assert!(parse_manifest(unknown).is_err());

        let unnamed = "- {name: '', schedule: x, command: y}";
        assert!(parse_manifest(unnamed).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_manifest("/nonexistent/tasks.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tasks.yaml"));
    }
}
