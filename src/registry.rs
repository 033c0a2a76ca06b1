//! Registry of live task contexts.
//!
//! The registry is the owner side of a [`TaskContext`]: it launches contexts,
//! keeps them until the task body calls [`TaskContext::close`], and can cancel
//! one task, every task, or shut everything down and wait for the tasks to
//! close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Notify;

use crate::config::RegistryConfig;
use crate::context::{CancelHandle, CloseHandler, Context, Scope, TaskContext};
use crate::error::RegistryError;

/// Tracks the contexts of concurrently running tasks.
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    /// Every task context derives from this scope.
    root: Scope,
    root_cancel: CancelHandle,
    tasks: Mutex<HashMap<i64, TaskContext>>,
    next_id: AtomicI64,
    /// Notified whenever the last live task closes.
    drained: Notify,
}

impl RegistryInner {
    fn tasks(&self) -> MutexGuard<'_, HashMap<i64, TaskContext>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close handler body: forget the task and fire its scope, which also
    /// stops a pending deadline timer.
    fn release(&self, ctx: &TaskContext) {
        let mut tasks = self.tasks();
        // A stale handle must not evict a newer task registered under the same id.
        let removed = match tasks.get(&ctx.id()) {
            Some(current) if current.ptr_eq(ctx) => tasks.remove(&ctx.id()),
            _ => None,
        };
        let live = tasks.len();
        drop(tasks);

        if removed.is_none() {
            tracing::debug!(task_id = ctx.id(), "Close for task that is not registered");
            return;
        }

        tracing::debug!(task_id = ctx.id(), live, reason = ?ctx.err(), "Task closed");
        ctx.cancel();
        if live == 0 {
            self.drained.notify_waiters();
        }
    }
}

impl TaskRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (root, root_cancel) = Scope::with_cancel(&Scope::background());
        Self {
            inner: Arc::new(RegistryInner {
                config,
                root,
                root_cancel,
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                drained: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Launch a context with the next free sequential id.
    pub fn launch(&self) -> Result<TaskContext, RegistryError> {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            match self.register(id) {
                // Taken by launch_with_id; try the next one.
                Err(RegistryError::DuplicateId { .. }) => continue,
                other => return other,
            }
        }
    }

    /// Launch a context with a caller-chosen id.
    pub fn launch_with_id(&self, id: i64) -> Result<TaskContext, RegistryError> {
        self.register(id)
    }

    fn register(&self, id: i64) -> Result<TaskContext, RegistryError> {
        if self.inner.root.is_done() {
            return Err(RegistryError::ShuttingDown);
        }

        let mut tasks = self.inner.tasks();
        if tasks.contains_key(&id) {
            return Err(RegistryError::DuplicateId { id });
        }
        let max = self.inner.config.max_tasks;
        if tasks.len() >= max {
            tracing::warn!(task_id = id, max, "Task registry at capacity");
            return Err(RegistryError::CapacityExceeded { max });
        }

        let on_close = self.close_handler();
        let ctx = match self.inner.config.default_timeout {
            Some(timeout) => {
                TaskContext::with_timeout(&self.inner.root, id, timeout, Some(on_close))
            }
            None => TaskContext::derive(&self.inner.root, id, Some(on_close)),
        };
        tasks.insert(id, ctx.clone());
        let live = tasks.len();
        drop(tasks);

        tracing::debug!(task_id = id, live, deadline = ?ctx.deadline(), "Task launched");
        Ok(ctx)
    }

    fn close_handler(&self) -> CloseHandler {
        // Weak: registered contexts hold this handler, the registry holds them.
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        Arc::new(move |ctx: &TaskContext| {
            if let Some(inner) = registry.upgrade() {
                inner.release(ctx);
            }
        })
    }

    /// The live context registered under `id`.
    pub fn get(&self, id: i64) -> Option<TaskContext> {
        self.inner.tasks().get(&id).cloned()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.inner.tasks().contains_key(&id)
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.inner.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of live tasks, ascending.
    pub fn active_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.tasks().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancel one task. It stays registered until it closes.
    pub fn cancel(&self, id: i64) -> Result<(), RegistryError> {
        let ctx = self.get(id).ok_or(RegistryError::NotFound { id })?;
        ctx.cancel();
        tracing::info!(task_id = id, "Task cancelled");
        Ok(())
    }

    /// Cancel every live task and return how many were cancelled.
    ///
    /// The registry keeps accepting new tasks.
    pub fn cancel_all(&self) -> usize {
        let contexts: Vec<TaskContext> = self.inner.tasks().values().cloned().collect();
        for ctx in &contexts {
            ctx.cancel();
        }
        tracing::info!(count = contexts.len(), "Cancelled all tasks");
        contexts.len()
    }

    /// Stop accepting tasks, cancel the live ones, and wait up to the
    /// configured grace period for all of them to close.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.inner.root_cancel.cancel();

        let grace = self.inner.config.shutdown_grace;
        tracing::info!(live = self.len(), ?grace, "Shutting down task registry");

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            // Register interest before checking, so a close in between is not missed.
            let drained = self.inner.drained.notified();
            if self.is_empty() {
                tracing::info!("Task registry drained");
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                let remaining = self.len();
                if remaining == 0 {
                    return Ok(());
                }
                tracing::warn!(remaining, ?grace, "Tasks still running after shutdown grace");
                return Err(RegistryError::ShutdownTimedOut { remaining, grace });
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("config", &self.inner.config)
            .field("live", &self.len())
            .finish()
    }
}
