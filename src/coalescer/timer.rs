use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A single cancellable delayed callback.
///
/// Arming spawns a task that either observes cancellation or sleeps for the
/// delay and then runs the callback. A fired timer reads as disarmed, so the
/// owner can tell "pending" apart from "already ran" without extra state.
#[derive(Debug, Default)]
pub struct FlushTimer {
    token: Option<CancellationToken>,
}

impl FlushTimer {
    pub fn new() -> Self {
        Self { token: None }
    }

    /// Returns true while a scheduled callback has neither fired nor been cancelled.
    pub fn is_armed(&self) -> bool {
        self.token.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Schedules `fire` to run after `delay`, replacing any pending schedule.
    ///
    /// Returns false when called outside a tokio runtime; nothing is scheduled.
    pub fn arm<F>(&mut self, delay: Duration, fire: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        self.cancel();

        let token = CancellationToken::new();
        let task_token = token.clone();
        handle.spawn(async move {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    task_token.cancel();
                    fire.await;
                }
            }
        });
        self.token = Some(token);

        true
    }

    /// Cancels the pending callback, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.token.take() {
            Some(token) => {
                let pending = !token.is_cancelled();
                token.cancel();
                pending
            }
            None => false,
        }
    }
}
