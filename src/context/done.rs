//! One-shot done signal.

use std::future::IntoFuture;

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Handle on a context's done signal.
///
/// Cloning is cheap and every clone observes the same signal. Async code
/// awaits it directly (`ctx.done().await`); thread-based code calls
/// [`Done::wait`]. All waiters are released when the signal fires, and a
/// signal that has fired stays fired.
#[derive(Debug, Clone)]
pub struct Done {
    token: CancellationToken,
}

impl Done {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Non-blocking check.
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Block the current thread until the signal fires.
    ///
    /// Must not be called from inside an async task; await the handle there.
    pub fn wait(&self) {
        futures::executor::block_on(self.token.cancelled());
    }
}

impl IntoFuture for Done {
    type Output = ();
    type IntoFuture = WaitForCancellationFutureOwned;

    fn into_future(self) -> Self::IntoFuture {
        self.token.cancelled_owned()
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    #[test]
    fn future_resolves_only_after_cancel() {
        let token = CancellationToken::new();
        let done = Done::new(token.clone());

        let mut waiter = task::spawn(done.clone().into_future());
        assert_pending!(waiter.poll());
        assert!(!done.is_fired());

        token.cancel();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
        assert!(done.is_fired());
    }

    #[test]
    fn wait_returns_immediately_when_already_fired() {
        let token = CancellationToken::new();
        token.cancel();
        Done::new(token).wait();
    }

    #[test]
    fn wait_is_released_from_another_thread() {
        let token = CancellationToken::new();
        let done = Done::new(token.clone());

        let waiter = std::thread::spawn(move || done.wait());
        token.cancel();
        waiter.join().unwrap();
    }
}
