//! Read-side capability shared by scopes and task contexts.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use crate::context::done::Done;
use crate::error::ContextError;

/// Cancellation state, deadline and scoped values of a context.
///
/// Every method is non-blocking and safe to call from any thread, including
/// concurrently with cancellation. Waiting happens on the returned [`Done`].
pub trait Context: Send + Sync {
    /// The instant after which the context fires with
    /// [`ContextError::DeadlineExceeded`], if one applies.
    fn deadline(&self) -> Option<Instant>;

    /// Signal that fires once the context is cancelled or its deadline passes.
    fn done(&self) -> Done;

    /// `None` while active; afterwards the reason the done signal fired.
    ///
    /// Once `Some`, repeated calls return the same value.
    fn err(&self) -> Option<ContextError>;

    /// Nearest value stored under `key` in this context or its ancestors.
    ///
    /// Cancellation does not clear values.
    fn value(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Whether the done signal has fired.
    fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Typed variant of [`Context::value`]. Returns `None` when the key is
    /// missing or holds a different type.
    fn value_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>>
    where
        Self: Sized,
    {
        self.value(key)?.downcast::<T>().ok()
    }
}
