//! Per-task execution contexts.
//!
//! A [`TaskContext`] gives each concurrently running task a stable id, a
//! cooperative cancellation signal, an optional deadline, read-only scoped
//! values, and a close hook the task fires when it finishes. Cancellation is
//! advisory: tasks poll [`Context::err`] or wait on [`Context::done`] and exit
//! on their own.
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskctx::{Context, TaskContext};
//!
//! # async fn run() {
//! let ctx = TaskContext::new(7, Some(Arc::new(|ctx: &TaskContext| {
//!     println!("task {} finished", ctx.id());
//! })));
//!
//! let worker = ctx.clone();
//! tokio::spawn(async move {
//!     worker.done().await;
//!     worker.close();
//! });
//!
//! ctx.cancel();
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod registry;

pub use config::RegistryConfig;
pub use context::{CancelHandle, CloseHandler, Context, Done, Scope, TaskContext};
pub use error::{ConfigError, ContextError, Error, RegistryError};
pub use registry::TaskRegistry;
