//! Controller driving the reconciler from store events.
//!
//! The controller owns everything the reconciler deliberately does not: the
//! work queue, the requeue timers, retry backoff, and the worker tasks.
//!
//! - Task events enqueue the task; unit events enqueue the owning task.
//! - A key is handed to at most one worker at a time. Adding a key that is
//!   being processed defers it until the worker calls `done`.
//! - `requeue_after` and failures schedule a delayed re-add.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::reconciler::Reconciler;
use crate::store::{TaskStore, WatchEvent};
use crate::types::ObjectKey;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    shutdown: bool,
}

/// Deduplicating work queue of task keys.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a key unless it is already waiting.
    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.shutdown || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key after `delay`.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a key as processed, re-queueing it if it was added meanwhile.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutdown {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub async fn shutdown(&self) {
        self.state.lock().await.shutdown = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting to be processed.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Whether no key is waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Per-key exponential backoff for failed reconciles.
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    /// Create a backoff growing from `base` up to `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub async fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.failures.lock().await;
        let count = failures.entry(key.clone()).or_insert(0);
        let factor = 2u32.saturating_pow((*count).min(31));
        *count = count.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Forget the failure history of a key.
    pub async fn forget(&self, key: &ObjectKey) {
        self.failures.lock().await.remove(key);
    }
}

/// Drives a [`Reconciler`] from a store's change feed.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn TaskStore>,
    events: broadcast::Receiver<WatchEvent>,
    config: ControllerConfig,
    queue: Arc<WorkQueue>,
    backoff: Arc<Backoff>,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl Controller {
    /// Create a controller.
    ///
    /// `events` should be subscribed before any task is created that the
    /// controller is expected to see; the initial resync covers the rest.
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn TaskStore>,
        events: broadcast::Receiver<WatchEvent>,
        config: ControllerConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let backoff = Arc::new(Backoff::new(config.backoff_base, config.backoff_max));
        Self {
            reconciler,
            store,
            events,
            config,
            queue: Arc::new(WorkQueue::new()),
            backoff,
            stop_rx,
            stop_tx,
        }
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> ControllerStopper {
        ControllerStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// The controller's work queue.
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Run until stopped.
    ///
    /// In-flight reconciles finish before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is invalid, and
    /// [`Error::ControllerStopped`] if it was stopped before it started.
    pub async fn run(mut self) -> Result<()> {
        self.config.validate()?;
        if *self.stop_rx.borrow() {
            return Err(Error::ControllerStopped);
        }
        info!(
            workers = self.config.workers,
            resync_secs = self.config.resync_interval.map(|d| d.as_secs()),
            "Starting controller"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            workers.spawn(worker(
                id,
                Arc::clone(&self.reconciler),
                Arc::clone(&self.queue),
                Arc::clone(&self.backoff),
            ));
        }

        self.resync().await;

        let mut ticker = self
            .config
            .resync_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));
        let mut feed_open = true;

        loop {
            tokio::select! {
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
                received = self.events.recv(), if feed_open => match received {
                    Ok(event) => self.handle_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Change feed lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Change feed closed");
                        feed_open = false;
                    }
                },
                () = tick(&mut ticker) => {
                    debug!("Periodic resync");
                    self.resync().await;
                }
            }
        }

        info!("Stopping controller");
        self.queue.shutdown().await;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Controller stopped");
        Ok(())
    }

    async fn handle_event(&self, event: &WatchEvent) {
        match event.task_key() {
            Some(key) => {
                debug!(kind = %event.kind, change = ?event.change, key = %event.key, task = %key, "Change observed");
                self.queue.add(key).await;
            }
            None => debug!(kind = %event.kind, key = %event.key, "Ignoring unowned object"),
        }
    }

    async fn resync(&self) {
        match self.store.list_task_keys().await {
            Ok(keys) => {
                debug!(tasks = keys.len(), "Enqueueing all tasks");
                for key in keys {
                    self.queue.add(key).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to list tasks for resync"),
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

async fn worker(
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    backoff: Arc<Backoff>,
) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key).await {
            Ok(result) => {
                backoff.forget(&key).await;
                debug!(worker = id, task = %key, action = %result.action.description(), "Reconciled");
                if let Some(delay) = result.requeue_after {
                    debug!(task = %key, delay_ms = delay.as_millis(), "Requeue requested");
                    queue.add_after(key.clone(), delay);
                }
            }
            Err(e) => {
                let delay = backoff.next_delay(&key).await;
                warn!(
                    worker = id,
                    task = %key,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Reconcile failed, retrying"
                );
                queue.add_after(key.clone(), delay);
            }
        }
        queue.done(&key).await;
    }
    debug!(worker = id, "Worker stopped");
}

/// Handle to stop a running controller.
#[derive(Clone)]
pub struct ControllerStopper {
    stop_tx: watch::Sender<bool>,
}

impl ControllerStopper {
    /// Stop the controller.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::factory::UnitTemplate;
    use crate::schedule::{format_schedule, SystemClock};
    use crate::store::InMemoryStore;
    use crate::types::{Phase, ScheduledTask, UnitPhase, UnitStatus};
    use chrono::Utc;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    /// Given a key already waiting in the queue
    /// When it is added again
    /// Then it is handed out only once
    #[tokio::test]
    async fn queue_deduplicates_waiting_keys() {
        let queue = WorkQueue::new();
        queue.add(key("a")).await;
        queue.add(key("a")).await;
        queue.add(key("b")).await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(queue.is_empty().await);
    }

    /// Given a key being processed
    /// When it is added again
    /// Then it is not handed to another worker until done
    #[tokio::test]
    async fn queue_defers_keys_in_processing() {
        let queue = WorkQueue::new();
        queue.add(key("a")).await;
        let taken = queue.get().await.unwrap();

        queue.add(key("a")).await;
        assert!(queue.is_empty().await);

        queue.done(&taken).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get().await, Some(key("a")));
    }

    /// Given workers waiting on an empty queue
    /// When the queue shuts down
    /// Then every waiter gets None
    #[tokio::test]
    async fn queue_shutdown_releases_waiters() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shutdown().await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);

        queue.add(key("late")).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_add_after_waits_for_delay() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after(key("a"), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(queue.is_empty().await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn backoff_doubles_up_to_max() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let k = key("a");

        assert_eq!(backoff.next_delay(&k).await, Duration::from_millis(100));
        assert_eq!(backoff.next_delay(&k).await, Duration::from_millis(200));
        assert_eq!(backoff.next_delay(&k).await, Duration::from_millis(400));
        assert_eq!(backoff.next_delay(&k).await, Duration::from_millis(500));

        backoff.forget(&k).await;
        assert_eq!(backoff.next_delay(&k).await, Duration::from_millis(100));
        assert_eq!(backoff.next_delay(&key("b")).await, Duration::from_millis(100));
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let polled = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "condition not met in time");
    }

    /// Given a running controller
    /// When a due task is created and its unit later succeeds
    /// Then the task reaches DONE with exactly one unit
    #[tokio::test]
    async fn controller_drives_task_to_done() {
        let store = InMemoryStore::new_arc();
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            Arc::new(SystemClock),
            UnitTemplate::default(),
        ));
        let controller = Controller::new(
            reconciler,
            store.clone(),
            store.subscribe(),
            ControllerConfig::default().workers(2),
        );
        let stopper = controller.stopper();
        let handle = tokio::spawn(controller.run());

        let schedule = format_schedule(Utc::now() - chrono::Duration::seconds(1));
        let task = store
            .create_task(ScheduledTask::new("default", "at", schedule, "true"))
            .await
            .unwrap();

        wait_for(|| {
            let store = store.clone();
            async move { !store.list_units().await.is_empty() }
        })
        .await;

        let unit_key = ObjectKey::new("default", "at-pod");
        store
            .update_unit_status(
                &unit_key,
                UnitStatus {
                    phase: UnitPhase::Succeeded,
                    ..UnitStatus::default()
                },
            )
            .await
            .unwrap();

        wait_for(|| {
            let store = store.clone();
            let key = task.key();
            async move { store.get_task(&key).await.map(|t| t.status.phase) == Ok(Phase::Done) }
        })
        .await;

        stopper.stop();
        let stopped = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(stopped, Ok(Ok(Ok(())))));
        assert_eq!(store.list_units().await.len(), 1);
    }

    #[tokio::test]
    async fn controller_rejects_invalid_config() {
        let store = InMemoryStore::new_arc();
        let reconciler = Arc::new(Reconciler::with_system_clock(store.clone()));
        let controller = Controller::new(
            reconciler,
            store.clone(),
            store.subscribe(),
            ControllerConfig::default().workers(0),
        );
        assert!(controller.run().await.is_err());
    }

    #[tokio::test]
    async fn controller_stopped_before_start_does_not_run() {
        let store = InMemoryStore::new_arc();
        let reconciler = Arc::new(Reconciler::with_system_clock(store.clone()));
        let controller = Controller::new(
            reconciler,
            store.clone(),
            store.subscribe(),
            ControllerConfig::default(),
        );
        controller.stopper().stop();

        let result = controller.run().await;
        assert!(matches!(result, Err(Error::ControllerStopped)));
    }
}
