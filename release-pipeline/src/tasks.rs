// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Queued execution of mutating tasks.

Mutating operations (a release, a channel move) run asynchronously as
tasks: the request handler enqueues a closure and returns the task id
immediately; a single worker executes tasks one at a time under a
per-task deadline.

Task state is persisted so a crash cannot leave a phantom "running" task:
on the first action after process start the manager sweeps every persisted
queued/running record to `failed` with an invalidation reason and clears
the current-running marker. A task can also be canceled externally with
[TaskManager::cancel_task]: a queued task is canceled before the worker
picks it up, a running task is signalled and its closure is dropped at the
next suspension point. The storage layout mirrors the lifecycle:

- `queued_task/<uuid>`: accepted, not yet picked by the worker
- `running_task/<uuid>`: currently executing (at most one)
- `task/<uuid>`: terminal record
- `current_running_task`: uuid of the running task iff one exists
*/

use {
    crate::{
        config::{PipelineConfig, DEFAULT_TASK_TIMEOUT_SECONDS},
        error::{PipelineError, Result},
        storage::Storage,
    },
    chrono::{DateTime, Utc},
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{future::Future, pin::Pin, sync::Arc, time::Duration},
    tokio::sync::{mpsc, oneshot, Mutex},
    uuid::Uuid,
};

const STORAGE_KEY_PREFIX_TASK: &str = "task/";
const STORAGE_KEY_PREFIX_QUEUED_TASK: &str = "queued_task/";
const STORAGE_KEY_PREFIX_RUNNING_TASK: &str = "running_task/";
const STORAGE_KEY_CURRENT_RUNNING_TASK: &str = "current_running_task";

/// Reason recorded on tasks swept by restart invalidation.
pub const TASK_REASON_INVALIDATED: &str = "task invalidated on plugin restart";

/// Reason recorded on externally canceled tasks.
pub const TASK_REASON_CANCELED: &str = "task canceled by user request";

/// Default bound on the in-memory task queue.
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 128;

/// Task lifecycle states.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

/// A persisted task record.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Task {
    pub uuid: String,
    pub status: TaskStatus,
    /// Failure or cancellation reason; empty otherwise.
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Task {
    fn new_queued() -> Self {
        let now = Utc::now();

        Self {
            uuid: Uuid::new_v4().to_string(),
            status: TaskStatus::Queued,
            reason: String::new(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// The future a task closure produces.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A task closure. Receives the storage handle the manager was bound to.
pub type TaskFn = Box<dyn FnOnce(Arc<dyn Storage>) -> TaskFuture + Send>;

/// Box an async closure into a [TaskFn].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: FnOnce(Arc<dyn Storage>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |storage| Box::pin(f(storage)))
}

struct QueuedTask {
    uuid: String,
    timeout: Duration,
    action: TaskFn,
}

/// Cancellation handle for the task the worker is currently executing.
struct RunningCancel {
    uuid: String,
    cancel_tx: oneshot::Sender<()>,
}

struct ManagerInner {
    /// Bound on first action; also serializes busy-check + enqueue and the
    /// queued-to-running transition against cancellation.
    storage: Mutex<Option<Arc<dyn Storage>>>,
    queue_tx: mpsc::Sender<QueuedTask>,
    running_cancel: Mutex<Option<RunningCancel>>,
}

/// The process-wide task manager.
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    /// Create a manager and spawn its worker on the current runtime.
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_TASK_QUEUE_CAPACITY)
    }

    /// Like [Self::new] with an explicit queue bound.
    pub fn with_queue_capacity(capacity: usize) -> Self {
        let (manager, rx) = Self::detached(capacity);

        let inner = manager.inner.clone();
        tokio::spawn(worker_loop(inner, rx));

        manager
    }

    /// Create a manager without a worker. Used by tests that inspect the
    /// queue directly.
    fn detached(capacity: usize) -> (Self, mpsc::Receiver<QueuedTask>) {
        let (queue_tx, rx) = mpsc::channel(capacity);

        (
            Self {
                inner: Arc::new(ManagerInner {
                    storage: Mutex::new(None),
                    queue_tx,
                    running_cancel: Mutex::new(None),
                }),
            },
            rx,
        )
    }

    /// Enqueue `action` unless a task is already queued or running.
    ///
    /// Returns the new task id, or [PipelineError::Busy].
    pub async fn run_task(&self, storage: Arc<dyn Storage>, action: TaskFn) -> Result<String> {
        self.submit(storage, action, true).await
    }

    /// Enqueue `action` unconditionally (FIFO). Returns the new task id.
    pub async fn add_task(&self, storage: Arc<dyn Storage>, action: TaskFn) -> Result<String> {
        self.submit(storage, action, false).await
    }

    /// Like [Self::run_task], but a busy manager is a non-event:
    /// `(None, false)` instead of an error.
    pub async fn add_optional_task(
        &self,
        storage: Arc<dyn Storage>,
        action: TaskFn,
    ) -> Result<(Option<String>, bool)> {
        match self.run_task(storage, action).await {
            Ok(uuid) => Ok((Some(uuid), true)),
            Err(PipelineError::Busy) => Ok((None, false)),
            Err(e) => Err(e),
        }
    }

    /// Cancel a queued or running task.
    ///
    /// A queued task is moved straight to its terminal record; the worker
    /// skips it on pickup. A running task is signalled and its closure is
    /// dropped at the next suspension point; it is never force-killed.
    /// Returns whether a live task with this id was found.
    pub async fn cancel_task(&self, storage: Arc<dyn Storage>, uuid: &str) -> Result<bool> {
        let mut bound = self.inner.storage.lock().await;

        if bound.is_none() {
            invalidate_storage(&*storage).await?;
            *bound = Some(storage.clone());
        }

        // The guard stays held so the worker cannot move the task from
        // queued to running underneath the checks below.
        let queued_key = format!("{}{}", STORAGE_KEY_PREFIX_QUEUED_TASK, uuid);
        if let Some(data) = storage.get(&queued_key).await? {
            let mut task = serde_json::from_slice::<Task>(&data)?;

            task.status = TaskStatus::Canceled;
            task.reason = TASK_REASON_CANCELED.to_string();
            task.modified_at = Utc::now();

            storage
                .put(
                    &format!("{}{}", STORAGE_KEY_PREFIX_TASK, uuid),
                    &serde_json::to_vec(&task)?,
                )
                .await?;
            storage.delete(&queued_key).await?;

            info!("canceled queued task {}", uuid);

            return Ok(true);
        }

        let mut slot = self.inner.running_cancel.lock().await;
        if slot.as_ref().map(|c| c.uuid == uuid).unwrap_or(false) {
            let cancel = slot.take().expect("slot occupancy checked above");

            // A failed send means the task finished in the meantime.
            return Ok(cancel.cancel_tx.send(()).is_ok());
        }

        Ok(false)
    }

    async fn submit(
        &self,
        storage: Arc<dyn Storage>,
        action: TaskFn,
        only_if_idle: bool,
    ) -> Result<String> {
        let mut bound = self.inner.storage.lock().await;

        // First action after process start: bind the storage and restore
        // the single-running invariant.
        if bound.is_none() {
            invalidate_storage(&*storage).await?;
            *bound = Some(storage.clone());
        }

        let timeout = match PipelineConfig::load(&*storage).await? {
            Some(config) => config.task_timeout(),
            None => Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECONDS),
        };

        if only_if_idle && is_busy(&*storage).await? {
            return Err(PipelineError::Busy);
        }

        let task = Task::new_queued();
        let uuid = task.uuid.clone();
        let queued_key = format!("{}{}", STORAGE_KEY_PREFIX_QUEUED_TASK, uuid);

        storage.put(&queued_key, &serde_json::to_vec(&task)?).await?;

        let send_result = self.inner.queue_tx.try_send(QueuedTask {
            uuid: uuid.clone(),
            timeout,
            action,
        });

        if send_result.is_err() {
            // The record must not outlive the rejected handoff, or busy
            // detection wedges on a task no worker will ever see.
            storage.delete(&queued_key).await?;

            return Err(PipelineError::TaskQueueFull);
        }

        debug!("queued task {}", uuid);

        Ok(uuid)
    }
}

/// Fetch a task record in any lifecycle state.
pub async fn get_task(storage: &dyn Storage, uuid: &str) -> Result<Option<Task>> {
    for prefix in [
        STORAGE_KEY_PREFIX_TASK,
        STORAGE_KEY_PREFIX_RUNNING_TASK,
        STORAGE_KEY_PREFIX_QUEUED_TASK,
    ] {
        if let Some(data) = storage.get(&format!("{}{}", prefix, uuid)).await? {
            return Ok(Some(serde_json::from_slice(&data)?));
        }
    }

    Ok(None)
}

async fn is_busy(storage: &dyn Storage) -> Result<bool> {
    if storage.get(STORAGE_KEY_CURRENT_RUNNING_TASK).await?.is_some() {
        return Ok(true);
    }

    for prefix in [
        STORAGE_KEY_PREFIX_RUNNING_TASK,
        STORAGE_KEY_PREFIX_QUEUED_TASK,
    ] {
        if !storage.list(prefix).await?.is_empty() {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Sweep queued/running ghosts left by a previous process into `failed`.
///
/// Deterministic and idempotent: a second sweep finds nothing to do.
async fn invalidate_storage(storage: &dyn Storage) -> Result<()> {
    for prefix in [
        STORAGE_KEY_PREFIX_RUNNING_TASK,
        STORAGE_KEY_PREFIX_QUEUED_TASK,
    ] {
        for uuid in storage.list(prefix).await? {
            let key = format!("{}{}", prefix, uuid);

            let mut task = match storage.get(&key).await? {
                Some(data) => serde_json::from_slice::<Task>(&data)?,
                None => continue,
            };

            task.status = TaskStatus::Failed;
            task.reason = TASK_REASON_INVALIDATED.to_string();
            task.modified_at = Utc::now();

            storage
                .put(
                    &format!("{}{}", STORAGE_KEY_PREFIX_TASK, uuid),
                    &serde_json::to_vec(&task)?,
                )
                .await?;
            storage.delete(&key).await?;

            warn!("invalidated stale task {}", uuid);
        }
    }

    storage.delete(STORAGE_KEY_CURRENT_RUNNING_TASK).await?;

    Ok(())
}

async fn worker_loop(inner: Arc<ManagerInner>, mut rx: mpsc::Receiver<QueuedTask>) {
    while let Some(queued) = rx.recv().await {
        let storage = inner
            .storage
            .lock()
            .await
            .clone()
            .expect("storage is bound before the first task is queued");

        if let Err(e) = execute_task(&inner, storage, queued).await {
            warn!("task bookkeeping error: {}", e);
        }
    }
}

async fn execute_task(
    inner: &ManagerInner,
    storage: Arc<dyn Storage>,
    queued: QueuedTask,
) -> Result<()> {
    let uuid = queued.uuid;

    let queued_key = format!("{}{}", STORAGE_KEY_PREFIX_QUEUED_TASK, uuid);
    let running_key = format!("{}{}", STORAGE_KEY_PREFIX_RUNNING_TASK, uuid);

    let (cancel_tx, cancel_rx) = oneshot::channel();

    // The transition to running and the registration of the cancel handle
    // happen under the manager lock, so cancellation sees the task as
    // either still queued or already signallable, never in between.
    let mut task = {
        let _guard = inner.storage.lock().await;

        let mut task = match storage.get(&queued_key).await? {
            Some(data) => serde_json::from_slice::<Task>(&data)?,
            // Canceled or invalidated between enqueue and pickup.
            None => return Ok(()),
        };

        storage
            .put(STORAGE_KEY_CURRENT_RUNNING_TASK, uuid.as_bytes())
            .await?;

        task.status = TaskStatus::Running;
        task.modified_at = Utc::now();
        storage.put(&running_key, &serde_json::to_vec(&task)?).await?;
        storage.delete(&queued_key).await?;

        *inner.running_cancel.lock().await = Some(RunningCancel {
            uuid: uuid.clone(),
            cancel_tx,
        });

        task
    };

    info!("task {} started", uuid);

    let (status, reason) = tokio::select! {
        outcome = tokio::time::timeout(queued.timeout, (queued.action)(storage.clone())) => {
            match outcome {
                Ok(Ok(())) => (TaskStatus::Succeeded, String::new()),
                Ok(Err(e)) => (TaskStatus::Failed, e.to_string()),
                Err(_) => (
                    TaskStatus::Failed,
                    PipelineError::TaskDeadlineExceeded.to_string(),
                ),
            }
        }
        _ = cancel_rx => (TaskStatus::Canceled, TASK_REASON_CANCELED.to_string()),
    };

    inner.running_cancel.lock().await.take();

    match status {
        TaskStatus::Succeeded => info!("task {} succeeded", uuid),
        TaskStatus::Canceled => info!("task {} canceled", uuid),
        _ => warn!("task {} failed: {}", uuid, reason),
    }

    task.status = status;
    task.reason = reason;
    task.modified_at = Utc::now();

    storage
        .put(
            &format!("{}{}", STORAGE_KEY_PREFIX_TASK, uuid),
            &serde_json::to_vec(&task)?,
        )
        .await?;
    storage.delete(&running_key).await?;
    storage.delete(STORAGE_KEY_CURRENT_RUNNING_TASK).await?;

    Ok(())
}
