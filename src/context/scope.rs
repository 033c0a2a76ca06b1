//! Cancellable signal tree.
//!
//! A [`Scope`] is one node of the tree. Cancellable nodes own a
//! [`CancellationToken`] derived from their parent's token, so firing a node
//! fires every descendant. Value nodes share their parent's token and only add
//! a key/value pair to the lookup chain.
//!
//! The terminal error is recorded once per node. A node fired through its
//! parent adopts the parent's error the first time it is observed.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::context::done::Done;
use crate::context::traits::Context;
use crate::error::ContextError;

type Value = Arc<dyn Any + Send + Sync>;

/// A node in the cancellation tree.
///
/// Cloning yields another handle on the same node.
#[derive(Clone)]
pub struct Scope {
    node: Arc<Node>,
}

/// Cancels the scope it was created with.
///
/// Dropping the handle does not cancel anything.
#[derive(Clone)]
pub struct CancelHandle {
    node: Arc<Node>,
}

struct Node {
    token: CancellationToken,
    err: OnceLock<ContextError>,
    /// Effective deadline: the earliest along the chain.
    deadline: Option<Instant>,
    /// Whether `deadline` was set on this node rather than inherited.
    owns_deadline: bool,
    entry: Option<(String, Value)>,
    parent: Option<Arc<Node>>,
    /// Set while a deadline timer for this node is pending.
    timer_live: AtomicBool,
}

impl Node {
    fn child(parent: &Arc<Node>) -> Self {
        Self {
            token: parent.token.child_token(),
            err: OnceLock::new(),
            deadline: parent.deadline,
            owns_deadline: false,
            entry: None,
            parent: Some(Arc::clone(parent)),
            timer_live: AtomicBool::new(false),
        }
    }

    /// Record `err` and fire, unless the node already fired.
    fn finish(&self, err: ContextError) {
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.err.set(err);
        self.token.cancel();
    }

    /// Fire the node owning the effective deadline if that deadline has
    /// passed. Covers timers that have not run yet.
    fn expire_if_due(&self) {
        let mut node = self;
        loop {
            if node.token.is_cancelled() {
                return;
            }
            if node.owns_deadline {
                if node.deadline.is_some_and(|at| Instant::now() >= at) {
                    node.finish(ContextError::DeadlineExceeded);
                }
                return;
            }
            match &node.parent {
                Some(parent) => node = parent.as_ref(),
                None => return,
            }
        }
    }

    fn err(&self) -> Option<ContextError> {
        self.expire_if_due();
        if !self.token.is_cancelled() {
            return None;
        }
        let err = self.err.get_or_init(|| {
            self.parent
                .as_ref()
                .and_then(|parent| parent.err())
                .unwrap_or(ContextError::Cancelled)
        });
        Some(*err)
    }

    fn value(&self, key: &str) -> Option<Value> {
        let mut node = Some(self);
        while let Some(current) = node {
            match &current.entry {
                Some((k, v)) if k == key => return Some(Arc::clone(v)),
                _ => {}
            }
            node = current.parent.as_deref();
        }
        None
    }
}

impl Scope {
    /// A fresh root that is never cancelled and has no deadline or values.
    ///
    /// Roots are independent of each other.
    pub fn background() -> Self {
        Self {
            node: Arc::new(Node {
                token: CancellationToken::new(),
                err: OnceLock::new(),
                deadline: None,
                owns_deadline: false,
                entry: None,
                parent: None,
                timer_live: AtomicBool::new(false),
            }),
        }
    }

    /// Child scope that fires when `parent` fires or the handle is cancelled.
    pub fn with_cancel(parent: &Scope) -> (Scope, CancelHandle) {
        let node = Arc::new(Node::child(&parent.node));
        (
            Scope {
                node: Arc::clone(&node),
            },
            CancelHandle { node },
        )
    }

    /// Child scope that also fires with [`ContextError::DeadlineExceeded`]
    /// at `at`.
    ///
    /// If the parent's deadline is already earlier, this is equivalent to
    /// [`Scope::with_cancel`]. A deadline in the past fires immediately.
    pub fn with_deadline(parent: &Scope, at: Instant) -> (Scope, CancelHandle) {
        if parent.node.deadline.is_some_and(|current| current <= at) {
            return Self::with_cancel(parent);
        }

        let node = Arc::new(Node {
            deadline: Some(at),
            owns_deadline: true,
            ..Node::child(&parent.node)
        });

        if at <= Instant::now() {
            node.finish(ContextError::DeadlineExceeded);
        } else {
            arm_timer(Arc::clone(&node), at);
        }

        (
            Scope {
                node: Arc::clone(&node),
            },
            CancelHandle { node },
        )
    }

    /// [`Scope::with_deadline`] at `now + timeout`.
    pub fn with_timeout(parent: &Scope, timeout: Duration) -> (Scope, CancelHandle) {
        Self::with_deadline(parent, Instant::now() + timeout)
    }

    /// Child scope carrying `key = value`, sharing the parent's cancellation.
    ///
    /// Lookups find the nearest binding, so a child may shadow a key.
    pub fn with_value<V>(parent: &Scope, key: impl Into<String>, value: V) -> Scope
    where
        V: Any + Send + Sync,
    {
        let parent_node = &parent.node;
        Scope {
            node: Arc::new(Node {
                token: parent_node.token.clone(),
                err: OnceLock::new(),
                deadline: parent_node.deadline,
                owns_deadline: false,
                entry: Some((key.into(), Arc::new(value))),
                parent: Some(Arc::clone(parent_node)),
                timer_live: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
impl Scope {
    /// Whether a deadline timer for this scope is still pending.
    pub(crate) fn has_pending_timer(&self) -> bool {
        self.node.timer_live.load(Ordering::Acquire)
    }
}

impl Context for Scope {
    fn deadline(&self) -> Option<Instant> {
        self.node.deadline
    }

    fn done(&self) -> Done {
        Done::new(self.node.token.clone())
    }

    fn err(&self) -> Option<ContextError> {
        self.node.err()
    }

    fn value(&self, key: &str) -> Option<Value> {
        self.node.value(key)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("deadline", &self.node.deadline)
            .field("fired", &self.node.token.is_cancelled())
            .field("err", &self.node.err.get())
            .finish_non_exhaustive()
    }
}

impl CancelHandle {
    /// Fire the scope with [`ContextError::Cancelled`].
    ///
    /// Idempotent and safe to call from any number of threads. Has no effect
    /// once the scope fired for another reason.
    pub fn cancel(&self) {
        self.node.finish(ContextError::Cancelled);
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("fired", &self.node.token.is_cancelled())
            .finish()
    }
}

/// Runtime driving every deadline timer, independent of whatever runtime the
/// caller happens to be on. `None` if it could not be built.
static TIMER_RUNTIME: OnceLock<Option<tokio::runtime::Runtime>> = OnceLock::new();

fn timer_runtime() -> Option<&'static tokio::runtime::Runtime> {
    TIMER_RUNTIME
        .get_or_init(|| {
            match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("taskctx-timer")
                .enable_time()
                .build()
            {
                Ok(rt) => Some(rt),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build deadline timer runtime");
                    None
                }
            }
        })
        .as_ref()
}

/// Fire `node` at `at` unless it fires earlier.
fn arm_timer(node: Arc<Node>, at: Instant) {
    match timer_runtime() {
        Some(rt) => {
            node.timer_live.store(true, Ordering::Release);
            rt.spawn(run_timer(node, at));
        }
        // expire_if_due still catches the deadline on the next err()/is_done().
        None => tracing::warn!("Deadline timer unavailable, expiry is only detected on poll"),
    }
}

async fn run_timer(node: Arc<Node>, at: Instant) {
    let token = node.token.clone();
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {
            node.finish(ContextError::DeadlineExceeded);
        }
    }
    node.timer_live.store(false, Ordering::Release);
}
