//! Cancellable timers.
//!
//! Delayed retries and initial job delays are timers owned by the queue
//! engine; closing a queue cancels them through their token.

use std::any::Any;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A future scheduled to run once after a delay unless cancelled first.
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `task` after `delay`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn after<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::after_with_token(delay, CancellationToken::new(), task)
    }

    /// Run `task` after `delay`, cancelled by `token` or any of its parents.
    pub fn after_with_token<F>(delay: Duration, token: CancellationToken, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let child = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = child.cancelled() => {}
                () = tokio::time::sleep(delay) => task.await,
            }
        });

        Self { token, handle }
    }

    /// Cancel the task if it has not fired yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns true once the task has fired or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let task = ScheduledTask::after(Duration::from_millis(100), async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(!task.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let task = ScheduledTask::after(Duration::from_millis(100), async move {
            flag.store(true, Ordering::SeqCst);
        });

        task.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(task.is_cancelled());
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_token_cancels_child() {
        let parent = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _task = ScheduledTask::after_with_token(
            Duration::from_millis(100),
            parent.child_token(),
            async move {
                flag.store(true, Ordering::SeqCst);
            },
        );

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panic_message() {
        let caught = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*caught), "boom");

        let caught = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*caught), "code 7");
    }
}
