use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SqlRegistryError;

/// Caller-side cancellation scope: a token plus an optional deadline.
///
/// Every operation layers its own budget on top of the scope it is given; whichever
/// deadline is earlier applies. Cancelling a scope cancels every operation derived
/// from it, but never its parent.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    /// A scope with no deadline of its own.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A scope cancelled along with `self`, sharing its deadline.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child scope whose deadline is the earlier of the parent's and `now + timeout`.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: Some(earliest(self.deadline, Instant::now() + timeout)),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn operation(&self, budget: Duration) -> OpGuard {
        OpGuard {
            token: self.token.child_token(),
            deadline: earliest(self.deadline, Instant::now() + budget),
            budget,
            released: false,
        }
    }
}

fn earliest(parent: Option<Instant>, own: Instant) -> Instant {
    parent.map_or(own, |p| p.min(own))
}

/// Derived context for one operation.
///
/// Releasing the guard cancels its child token exactly once, which stops any driver
/// work still attached to it. Dropping an unreleased guard releases it.
#[derive(Debug)]
pub(crate) struct OpGuard {
    token: CancellationToken,
    deadline: Instant,
    budget: Duration,
    released: bool,
}

impl OpGuard {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A scope bounded by this guard, for operations nested inside it.
    pub(crate) fn scope(&self) -> Scope {
        Scope {
            token: self.token.clone(),
            deadline: Some(self.deadline),
        }
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Run `fut` until it finishes, the deadline passes, or the scope is cancelled.
    ///
    /// On timeout the token is cancelled while `fut` is still alive, so cancel hooks it
    /// owns observe the cancellation before they are dropped.
    pub(crate) async fn bound<F, T>(&self, fut: F) -> Result<T, SqlRegistryError>
    where
        F: Future<Output = Result<T, SqlRegistryError>>,
    {
        let mut fut = std::pin::pin!(fut);
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(SqlRegistryError::Cancelled),
            () = tokio::time::sleep_until(self.deadline) => {
                self.token.cancel();
                Err(SqlRegistryError::DeadlineExceeded(self.budget))
            }
            res = &mut fut => res,
        }
    }

    pub(crate) fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.token.cancel();
            tracing::trace!("operation scope released");
        }
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tighter_parent_deadline_wins() {
        let parent = Scope::with_timeout(Duration::from_millis(50));
        let guard = parent.operation(Duration::from_secs(10));
        let err = guard
            .bound(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, SqlRegistryError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
        assert!(guard.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn own_budget_applies_without_parent_deadline() {
        let guard = Scope::new().operation(Duration::from_millis(20));
        let err = guard
            .bound(std::future::pending::<Result<(), SqlRegistryError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, SqlRegistryError::DeadlineExceeded(d) if d == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn cancelled_parent_cancels_operation() {
        let parent = Scope::new();
        let guard = parent.operation(Duration::from_secs(5));
        parent.cancel();
        let err = guard
            .bound(std::future::pending::<Result<(), SqlRegistryError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, SqlRegistryError::Cancelled));
    }

    /// Records whether the token was already cancelled when it was dropped.
    struct DropWatch {
        token: CancellationToken,
        seen: Arc<Mutex<Option<bool>>>,
    }

    impl Drop for DropWatch {
        fn drop(&mut self) {
            *self.seen.lock().unwrap() = Some(self.token.is_cancelled());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_work_sees_cancellation_before_it_is_dropped() {
        let guard = Scope::new().operation(Duration::from_millis(20));
        let seen = Arc::new(Mutex::new(None));
        let watch = DropWatch {
            token: guard.token().clone(),
            seen: Arc::clone(&seen),
        };
        let err = guard
            .bound(async move {
                let _watch = watch;
                std::future::pending::<Result<(), SqlRegistryError>>().await
            })
            .await
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn release_does_not_touch_parent() {
        let parent = Scope::new();
        let mut guard = parent.operation(Duration::from_secs(5));
        guard.release();
        assert!(guard.token().is_cancelled());
        assert!(!parent.is_cancelled());
        let child = parent.child_with_timeout(Duration::from_secs(1));
        assert!(child.deadline().is_some());
    }
}
