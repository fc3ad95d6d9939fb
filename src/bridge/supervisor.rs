use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Notify};
use tokio::task::{JoinError, JoinHandle};

type TaskMap = Mutex<TaskSet>;

struct TaskSet {
    handles: HashMap<u64, JoinHandle<anyhow::Result<()>>>,
    accepting: bool,
}

/// Tracks in-flight asynchronous work so teardown can cancel it deterministically.
///
/// A task is in the set before its work starts and removes itself exactly once
/// when it finishes, fails, or is cancelled. Once [`shutdown`](Self::shutdown)
/// starts, new work is refused until [`reopen`](Self::reopen).
pub struct TaskSupervisor {
    name: &'static str,
    tasks: Arc<TaskMap>,
    idle: Arc<Notify>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Aggregated result of [`TaskSupervisor::shutdown`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks cancelled before they finished.
    pub cancelled: usize,
    /// Tasks that had already finished successfully when teardown reached them.
    pub completed: usize,
    /// Tasks that panicked or returned an error, with their failure detail.
    pub failed: Vec<String>,
}

impl ShutdownReport {
    pub fn total(&self) -> usize {
        self.cancelled + self.completed + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Deregister {
    id: u64,
    tasks: Weak<TaskMap>,
    idle: Arc<Notify>,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.upgrade() {
            let mut tasks = tasks.lock();
            tasks.handles.remove(&self.id);
            if tasks.handles.is_empty() {
                self.idle.notify_waiters();
            }
        }
    }
}

impl TaskSupervisor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: Arc::new(Mutex::new(TaskSet {
                handles: HashMap::new(),
                accepting: true,
            })),
            idle: Arc::new(Notify::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawn `work` on the runtime and track it until it finishes.
    ///
    /// Returns the task id, or `None` without running `work` when the
    /// supervisor is shutting down. Errors returned by `work` are logged here;
    /// they never escape to the caller.
    pub fn spawn<F>(&self, label: impl Into<String>, work: F) -> Option<u64>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.is_accepting() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        let supervisor = self.name;
        let guard = Deregister {
            id,
            tasks: Arc::downgrade(&self.tasks),
            idle: Arc::clone(&self.idle),
        };

        // The task does not start its work until its handle is in the set, so
        // it can never deregister before it was registered.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            if registered_rx.await.is_err() {
                return Ok(());
            }
            let outcome = work.await;
            if let Err(error) = &outcome {
                tracing::warn!("{supervisor}: task `{label}` failed: {error:#}");
            }
            outcome
        });
        {
            let mut tasks = self.tasks.lock();
            if !tasks.accepting {
                handle.abort();
                return None;
            }
            tasks.handles.insert(id, handle);
        }
        let _ = registered_tx.send(());
        Some(id)
    }

    pub fn is_accepting(&self) -> bool {
        self.tasks.lock().accepting
    }

    /// Accept new work again after a [`shutdown`](Self::shutdown).
    pub fn reopen(&self) {
        self.tasks.lock().accepting = true;
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.lock().handles.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Resolve once no task is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Cancel every tracked task and await its acknowledgement.
    ///
    /// Cancellation itself is not a failure. Panics and task errors observed
    /// while draining are reported in [`ShutdownReport::failed`]. Work spawned
    /// after this starts is refused until [`reopen`](Self::reopen).
    pub async fn shutdown(&self) -> ShutdownReport {
        let handles: Vec<(u64, JoinHandle<anyhow::Result<()>>)> = {
            let mut tasks = self.tasks.lock();
            tasks.accepting = false;
            tasks.handles.drain().collect()
        };
        for (_, handle) in &handles {
            handle.abort();
        }

        let mut report = ShutdownReport::default();
        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(())) => report.completed += 1,
                Ok(Err(error)) => report.failed.push(format!("task {id}: {error:#}")),
                Err(error) if error.is_cancelled() => report.cancelled += 1,
                Err(error) => report.failed.push(format!("task {id}: {}", describe_join_error(error))),
            }
        }
        self.idle.notify_waiters();

        if report.total() > 0 {
            tracing::debug!(
                "{}: drained {} task(s), {} cancelled, {} failed",
                self.name,
                report.total(),
                report.cancelled,
                report.failed.len()
            );
        }
        report
    }
}

fn describe_join_error(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => {
            if let Some(message) = payload.downcast_ref::<&str>() {
                format!("panicked: {message}")
            } else if let Some(message) = payload.downcast_ref::<String>() {
                format!("panicked: {message}")
            } else {
                "panicked".to_string()
            }
        }
        Err(error) => error.to_string(),
    }
}
