//! Declarative store trait and implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use tokio::sync::{broadcast, RwLock};

use crate::error::StoreError;
use crate::types::{
    ExecutionUnit, ObjectKey, ResourceKind, ScheduledTask, Uid, UnitStatus,
};

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Default capacity of the change feed.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Kind of change carried by a [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// A change notification from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ResourceKind,
    pub change: ChangeKind,
    pub key: ObjectKey,
    /// Controlling owner of the changed object, for dependents.
    pub owner: Option<ObjectKey>,
}

impl WatchEvent {
    fn task(change: ChangeKind, key: ObjectKey) -> Self {
        Self {
            kind: ResourceKind::ScheduledTask,
            change,
            key,
            owner: None,
        }
    }

    fn unit(change: ChangeKind, unit: &ExecutionUnit) -> Self {
        Self {
            kind: ResourceKind::ExecutionUnit,
            change,
            key: unit.key(),
            owner: unit.owner_key(),
        }
    }

    /// The task this event should wake, if any.
    pub fn task_key(&self) -> Option<ObjectKey> {
        match self.kind {
            ResourceKind::ScheduledTask => Some(self.key.clone()),
            ResourceKind::ExecutionUnit => self.owner.clone(),
        }
    }
}

/// Operations the reconciler needs from the declarative store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fetch a task.
    async fn get_task(&self, key: &ObjectKey) -> StoreResult<ScheduledTask>;

    /// Write a task's status. Fails with `Conflict` if the task changed since
    /// it was read.
    async fn update_task_status(&self, task: &ScheduledTask) -> StoreResult<ScheduledTask>;

    /// Fetch an execution unit.
    async fn get_unit(&self, key: &ObjectKey) -> StoreResult<ExecutionUnit>;

    /// Create an execution unit.
    async fn create_unit(&self, unit: ExecutionUnit) -> StoreResult<ExecutionUnit>;

    /// Keys of all tasks, for full resyncs.
    async fn list_task_keys(&self) -> StoreResult<Vec<ObjectKey>>;
}

#[derive(Default)]
struct Objects {
    tasks: HashMap<ObjectKey, ScheduledTask>,
    units: HashMap<ObjectKey, ExecutionUnit>,
    next_version: u64,
}

impl Objects {
    fn bump(&mut self) -> u64 {
        self.next_version = self.next_version.saturating_add(1);
        self.next_version
    }
}

/// In-memory store with a broadcast change feed.
///
/// Deleting a task garbage-collects the units it controls, matching on the
/// owner uid.
pub struct InMemoryStore {
    objects: RwLock<Objects>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENTS_CAPACITY)
    }

    /// Create a store whose change feed buffers `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            objects: RwLock::new(Objects::default()),
            events,
        }
    }

    /// Create a new in-memory store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Subscribe to changes made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Create a task, assigning its uid and resource version.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a task with the same key exists.
    pub async fn create_task(&self, mut task: ScheduledTask) -> StoreResult<ScheduledTask> {
        let key = task.key();
        let mut objects = self.objects.write().await;
        if objects.tasks.contains_key(&key) {
            return Err(StoreError::already_exists(ResourceKind::ScheduledTask, &key));
        }

        task.metadata.uid = Some(Uid::new());
        task.metadata.resource_version = objects.bump();
        objects.tasks.insert(key.clone(), task.clone());
        drop(objects);

        self.notify(WatchEvent::task(ChangeKind::Added, key));
        Ok(task)
    }

    /// Delete a task and every unit it controls.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the task does not exist.
    pub async fn delete_task(&self, key: &ObjectKey) -> StoreResult<ScheduledTask> {
        let mut objects = self.objects.write().await;
        let task = objects
            .tasks
            .remove(key)
            .ok_or_else(|| StoreError::not_found(ResourceKind::ScheduledTask, key))?;

        let orphans = objects
            .units
            .values()
            .filter(|unit| {
                unit.metadata.namespace == task.metadata.namespace
                    && unit
                        .metadata
                        .owner_references
                        .iter()
                        .any(|owner| Some(owner.uid) == task.metadata.uid)
            })
            .map(ExecutionUnit::key)
            .collect_vec();
        let collected = orphans
            .iter()
            .filter_map(|unit_key| objects.units.remove(unit_key))
            .collect_vec();
        objects.bump();
        drop(objects);

        self.notify(WatchEvent::task(ChangeKind::Deleted, key.clone()));
        for unit in &collected {
            tracing::debug!(unit = %unit.key(), owner = %key, "Garbage-collected unit");
            self.notify(WatchEvent::unit(ChangeKind::Deleted, unit));
        }
        Ok(task)
    }

    /// Replace a unit's status, as its scheduler would.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the unit does not exist.
    pub async fn update_unit_status(
        &self,
        key: &ObjectKey,
        status: UnitStatus,
    ) -> StoreResult<ExecutionUnit> {
        let mut guard = self.objects.write().await;
        let objects = &mut *guard;
        let unit = objects
            .units
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(ResourceKind::ExecutionUnit, key))?;
        objects.next_version = objects.next_version.saturating_add(1);
        unit.status = status;
        unit.metadata.resource_version = objects.next_version;
        let unit = unit.clone();
        drop(guard);

        self.notify(WatchEvent::unit(ChangeKind::Modified, &unit));
        Ok(unit)
    }

    /// All units, ordered by key.
    pub async fn list_units(&self) -> Vec<ExecutionUnit> {
        let objects = self.objects.read().await;
        objects
            .units
            .values()
            .cloned()
            .sorted_by(|a, b| a.key().cmp(&b.key()))
            .collect_vec()
    }

    /// All tasks, ordered by key.
    pub async fn list_tasks(&self) -> Vec<ScheduledTask> {
        let objects = self.objects.read().await;
        objects
            .tasks
            .values()
            .cloned()
            .sorted_by(|a, b| a.key().cmp(&b.key()))
            .collect_vec()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn get_task(&self, key: &ObjectKey) -> StoreResult<ScheduledTask> {
        let objects = self.objects.read().await;
        objects
            .tasks
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ResourceKind::ScheduledTask, key))
    }

    async fn update_task_status(&self, task: &ScheduledTask) -> StoreResult<ScheduledTask> {
        let key = task.key();
        let mut objects = self.objects.write().await;
        let stored_version = objects
            .tasks
            .get(&key)
            .map(|stored| stored.metadata.resource_version)
            .ok_or_else(|| StoreError::not_found(ResourceKind::ScheduledTask, &key))?;

        if stored_version != task.metadata.resource_version {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: task.metadata.resource_version,
                actual: stored_version,
            });
        }

        let version = objects.bump();
        let updated = objects
            .tasks
            .get_mut(&key)
            .map(|stored| {
                stored.status = task.status.clone();
                stored.metadata.resource_version = version;
                stored.clone()
            })
            .ok_or_else(|| StoreError::not_found(ResourceKind::ScheduledTask, &key))?;
        drop(objects);

        self.notify(WatchEvent::task(ChangeKind::Modified, key));
        Ok(updated)
    }

    async fn get_unit(&self, key: &ObjectKey) -> StoreResult<ExecutionUnit> {
        let objects = self.objects.read().await;
        objects
            .units
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ResourceKind::ExecutionUnit, key))
    }

    async fn create_unit(&self, mut unit: ExecutionUnit) -> StoreResult<ExecutionUnit> {
        let key = unit.key();
        let mut objects = self.objects.write().await;
        if objects.units.contains_key(&key) {
            return Err(StoreError::already_exists(ResourceKind::ExecutionUnit, &key));
        }

        unit.metadata.uid = Some(Uid::new());
        unit.metadata.resource_version = objects.bump();
        objects.units.insert(key, unit.clone());
        drop(objects);

        self.notify(WatchEvent::unit(ChangeKind::Added, &unit));
        Ok(unit)
    }

    async fn list_task_keys(&self) -> StoreResult<Vec<ObjectKey>> {
        let objects = self.objects.read().await;
        Ok(objects.tasks.keys().cloned().sorted().collect_vec())
    }
}

#[async_trait]
impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    async fn get_task(&self, key: &ObjectKey) -> StoreResult<ScheduledTask> {
        (**self).get_task(key).await
    }

    async fn update_task_status(&self, task: &ScheduledTask) -> StoreResult<ScheduledTask> {
        (**self).update_task_status(task).await
    }

    async fn get_unit(&self, key: &ObjectKey) -> StoreResult<ExecutionUnit> {
        (**self).get_unit(key).await
    }

    async fn create_unit(&self, unit: ExecutionUnit) -> StoreResult<ExecutionUnit> {
        (**self).create_unit(unit).await
    }

    async fn list_task_keys(&self) -> StoreResult<Vec<ObjectKey>> {
        (**self).list_task_keys().await
    }
}

/// A wrapper that adds tracing to a task store.
pub struct TracingStore<S: TaskStore> {
    inner: S,
}

impl<S: TaskStore> TracingStore<S> {
    /// Create a new tracing store.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Get the wrapped store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: TaskStore> TaskStore for TracingStore<S> {
    async fn get_task(&self, key: &ObjectKey) -> StoreResult<ScheduledTask> {
        tracing::trace!(key = %key, "Getting task");
        self.inner.get_task(key).await
    }

    async fn update_task_status(&self, task: &ScheduledTask) -> StoreResult<ScheduledTask> {
        tracing::debug!(
            key = %task.key(),
            phase = %task.status.phase,
            resource_version = task.metadata.resource_version,
            "Updating task status"
        );
        let result = self.inner.update_task_status(task).await;
        if let Err(ref e) = result {
            tracing::debug!(key = %task.key(), error = %e, "Status update rejected");
        }
        result
    }

    async fn get_unit(&self, key: &ObjectKey) -> StoreResult<ExecutionUnit> {
        tracing::trace!(key = %key, "Getting unit");
        self.inner.get_unit(key).await
    }

    async fn create_unit(&self, unit: ExecutionUnit) -> StoreResult<ExecutionUnit> {
        tracing::debug!(key = %unit.key(), "Creating unit");
        let result = self.inner.create_unit(unit).await;
        if let Ok(ref created) = result {
            tracing::trace!(key = %created.key(), "Unit created");
        }
        result
    }

    async fn list_task_keys(&self) -> StoreResult<Vec<ObjectKey>> {
        self.inner.list_task_keys().await
    }
}
