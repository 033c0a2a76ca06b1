//! Per-task context handles and the cancellable signal tree behind them.
//!
//! - [`Scope`]: a node in the cancellation tree (deadline, done, error, values)
//! - [`TaskContext`]: one task's handle, adding identity and close notification
//! - [`Done`]: the one-shot signal a task waits on

mod done;
mod scope;
mod task;
mod traits;

pub use done::Done;
pub use scope::{CancelHandle, Scope};
pub use task::{CloseHandler, TaskContext};
pub use traits::Context;
