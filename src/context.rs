//! Explicit request context threaded through every public async entry point.
//!
//! No component in this crate reads thread-local state; correlation id,
//! cancellation, and deadline are always passed explicitly, per the
//! "ambient correlation IDs" re-architecture note: callers cannot forget to
//! propagate cancellation because it is a required argument, not a global.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Carries correlation id, cancellation trigger, and deadline through a call chain.
#[derive(Clone, Debug)]
pub struct RequestContext {
    correlation_id: Uuid,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Start a new, unrelated root context with a fresh correlation id.
    pub fn new() -> Self {
        Self { correlation_id: Uuid::new_v4(), cancellation: CancellationToken::new(), deadline: None }
    }

    /// Derive a child context that shares this context's cancellation token
    /// (cancelling the child also observes the parent's cancellation) but
    /// keeps the same correlation id, tightening the deadline if one is given.
    pub fn child(&self, deadline: Option<Duration>) -> Self {
        Self {
            correlation_id: self.correlation_id,
            cancellation: self.cancellation.child_token(),
            deadline: deadline
                .map(|d| Instant::now() + d)
                .into_iter()
                .chain(self.deadline)
                .min(),
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Race `fut` against cancellation; returns `None` if cancelled first.
    pub async fn run_cancellable<T>(
        &self,
        fut: impl std::future::Future<Output = T>,
    ) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => None,
            value = fut => Some(value),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_context_keeps_correlation_id() {
        let parent = RequestContext::new();
        let child = parent.child(None);
        assert_eq!(parent.correlation_id(), child.correlation_id());
    }

    #[test]
    fn child_inherits_cancellation() {
        let parent = RequestContext::new();
        let child = parent.child(None);
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn run_cancellable_returns_none_when_cancelled_first() {
        let ctx = RequestContext::new();
        ctx.cancel();
        let result = ctx.run_cancellable(async { 42 }).await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn run_cancellable_returns_value_when_not_cancelled() {
        let ctx = RequestContext::new();
        let result = ctx.run_cancellable(async { 42 }).await;
        assert_eq!(result, Some(42));
    }

    #[test]
    fn child_deadline_is_tighter_of_parent_and_requested() {
        let parent = RequestContext::new();
        let child = parent.child(Some(Duration::from_secs(5)));
        assert!(child.deadline().is_some());
        assert!(child.time_remaining().unwrap() <= Duration::from_secs(5));
    }
}
