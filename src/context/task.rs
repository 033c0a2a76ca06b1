//! Task context: identity and close notification over a cancellable scope.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::done::Done;
use crate::context::scope::{CancelHandle, Scope};
use crate::context::traits::Context;
use crate::error::ContextError;

/// Listener notified by [`TaskContext::close`] with the closing context.
pub type CloseHandler = Arc<dyn Fn(&TaskContext) + Send + Sync>;

/// Execution handle for one task.
///
/// Created by the code launching the task and shared (by cloning) with the
/// task body. Either side may cancel. The task body is expected to call
/// [`TaskContext::close`] once, as its last action, so the owner can react
/// to completion.
///
/// Cancellation is cooperative: it flips the done signal and nothing else.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<Inner>,
}

struct Inner {
    id: i64,
    scope: Scope,
    cancel: CancelHandle,
    on_close: Option<CloseHandler>,
}

impl TaskContext {
    /// Create a context on its own fresh root scope.
    ///
    /// `id` is reported verbatim; uniqueness is up to the caller.
    pub fn new(id: i64, on_close: Option<CloseHandler>) -> Self {
        Self::derive(&Scope::background(), id, on_close)
    }

    /// Create a context whose cancellation also follows `parent`.
    pub fn derive(parent: &Scope, id: i64, on_close: Option<CloseHandler>) -> Self {
        Self::from_parts(id, Scope::with_cancel(parent), on_close)
    }

    /// Like [`TaskContext::derive`], with a deadline `timeout` from now.
    pub fn with_timeout(
        parent: &Scope,
        id: i64,
        timeout: Duration,
        on_close: Option<CloseHandler>,
    ) -> Self {
        Self::from_parts(id, Scope::with_timeout(parent, timeout), on_close)
    }

    fn from_parts(
        id: i64,
        (scope, cancel): (Scope, CancelHandle),
        on_close: Option<CloseHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                scope,
                cancel,
                on_close,
            }),
        }
    }

    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// Notify the close handler, synchronously on the calling thread.
    ///
    /// No-op without a handler. Every call invokes the handler again; calling
    /// it once per task is the caller's job. Does not cancel.
    pub fn close(&self) {
        if let Some(on_close) = &self.inner.on_close {
            on_close(self);
        }
    }

    /// Request cancellation. Idempotent and thread-safe; never runs the
    /// close handler.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// The underlying scope, for deriving child scopes (values, sub-deadlines).
    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Whether both handles refer to the same task context.
    pub fn ptr_eq(&self, other: &TaskContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Context for TaskContext {
    fn deadline(&self) -> Option<Instant> {
        self.inner.scope.deadline()
    }

    fn done(&self) -> Done {
        self.inner.scope.done()
    }

    fn err(&self) -> Option<ContextError> {
        self.inner.scope.err()
    }

    fn value(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.scope.value(key)
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.inner.id)
            .field("scope", &self.inner.scope)
            .field("has_close_handler", &self.inner.on_close.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_handler() -> (CloseHandler, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: CloseHandler = Arc::new(move |_ctx: &TaskContext| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (handler, calls)
    }

    #[test]
    fn id_is_reported_verbatim() {
        for id in [0, 42, -1, i64::MIN, i64::MAX] {
            let ctx = TaskContext::new(id, None);
            assert_eq!(ctx.id(), id);
            ctx.cancel();
            assert_eq!(ctx.id(), id);
        }
    }

    #[test]
    fn close_without_handler_is_noop() {
        let ctx = TaskContext::new(42, None);
        ctx.close();
        ctx.close();
        assert_eq!(ctx.id(), 42);
        assert!(!ctx.is_done());
    }

    #[test]
    fn close_passes_originating_context() {
        let seen: Arc<Mutex<Option<TaskContext>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let ctx = TaskContext::new(
            3,
            Some(Arc::new(move |ctx: &TaskContext| {
                *slot.lock().unwrap() = Some(ctx.clone());
            })),
        );

        ctx.close();

        let seen = seen.lock().unwrap().take().expect("handler not called");
        assert_eq!(seen.id(), 3);
        assert!(seen.ptr_eq(&ctx));
    }

    #[test]
    fn close_runs_handler_on_every_call() {
        let (handler, calls) = counting_handler();
        let ctx = TaskContext::new(5, Some(handler));

        ctx.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        ctx.close();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_does_not_cancel() {
        let (handler, _) = counting_handler();
        let ctx = TaskContext::new(6, Some(handler));
        ctx.close();
        assert!(ctx.err().is_none());
        assert!(!ctx.done().is_fired());
    }

    #[test]
    fn cancel_never_invokes_close_handler() {
        let (handler, calls) = counting_handler();
        let ctx = TaskContext::new(2, Some(handler));

        ctx.cancel();
        ctx.cancel();

        assert!(ctx.done().is_fired());
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_then_done_unblocks_immediately() {
        let ctx = TaskContext::new(1, None);
        ctx.cancel();
        ctx.done().wait();
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn clones_share_state() {
        let ctx = TaskContext::new(8, None);
        let worker = ctx.clone();
        worker.cancel();
        assert!(ctx.is_done());
        assert!(ctx.ptr_eq(&worker));
        assert!(!ctx.ptr_eq(&TaskContext::new(8, None)));
    }

    #[test]
    fn new_contexts_have_no_deadline() {
        assert!(TaskContext::new(1, None).deadline().is_none());
    }

    #[test]
    fn derived_context_follows_parent() {
        let (parent, cancel) = Scope::with_cancel(&Scope::background());
        let ctx = TaskContext::derive(&parent, 10, None);

        cancel.cancel();
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn values_survive_cancellation() {
        let root = Scope::with_value(&Scope::background(), "request", "r-1".to_string());
        let ctx = TaskContext::derive(&root, 11, None);
        ctx.cancel();
        assert_eq!(
            ctx.value_as::<String>("request").as_deref().map(String::as_str),
            Some("r-1")
        );
    }

    #[tokio::test]
    async fn timeout_context_reports_deadline_exceeded() {
        let ctx =
            TaskContext::with_timeout(&Scope::background(), 12, Duration::from_millis(10), None);
        assert!(ctx.deadline().is_some());

        ctx.done().await;
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));

        ctx.cancel();
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }
}
