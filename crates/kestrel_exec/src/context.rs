//! Shared per-query execution context.
//!
//! One `QueryContext` is created per DAG run and shared by every operator
//! task. The first failure (or an external cancel) flips the context;
//! every operator observes it at batch boundaries and unwinds promptly.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use kestrel_common::error::{EngineError, ExecError, ExecResult};
use kestrel_common::types::QueryId;

/// Cancellation latch plus the first captured execution error.
///
/// `cancel` is first-wins and idempotent: concurrent callers race on the
/// latch, exactly one error is captured, and every waiter blocked in
/// `done()` wakes. Cancellation without an error (`cancel_quiet`) models
/// external aborts that are not failures.
pub struct QueryContext {
    query_id: QueryId,
    node_name: String,
    canceled: AtomicBool,
    done: Notify,
    error: Mutex<Option<ExecError>>,
}

impl QueryContext {
    pub fn new(query_id: QueryId, node_name: impl Into<String>) -> Self {
        Self {
            query_id,
            node_name: node_name.into(),
            canceled: AtomicBool::new(false),
            done: Notify::new(),
            error: Mutex::new(None),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Name of the local node, used when capturing errors.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Cancel with a captured error. Returns true if this call won the
    /// latch; losers leave the first error in place.
    pub fn cancel(&self, err: ExecError) -> bool {
        let mut slot = self.error.lock();
        if self.canceled.swap(true, Ordering::SeqCst) {
            return false;
        }
        *slot = Some(err);
        drop(slot);
        self.done.notify_waiters();
        true
    }

    /// Cancel without an error (external abort, not a failure).
    pub fn cancel_quiet(&self) -> bool {
        let slot = self.error.lock();
        if self.canceled.swap(true, Ordering::SeqCst) {
            return false;
        }
        drop(slot);
        self.done.notify_waiters();
        true
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// The first captured error, if cancellation carried one.
    pub fn error(&self) -> Option<ExecError> {
        self.error.lock().clone()
    }

    /// Fast-path check for pull loops. `Err(Canceled)` once cancelled.
    pub fn check(&self) -> ExecResult<()> {
        if self.is_canceled() {
            Err(EngineError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Resolve once the context is cancelled. Safe to `select!` against
    /// blocking receives.
    pub async fn done(&self) {
        let mut notified = pin!(self.done.notified());
        loop {
            // Register before checking so a concurrent cancel between the
            // check and the await cannot be missed.
            notified.as_mut().enable();
            if self.is_canceled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.done.notified());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx() -> Arc<QueryContext> {
        Arc::new(QueryContext::new(QueryId::new(), "node-test"))
    }

    #[tokio::test]
    async fn test_cancel_first_wins() {
        let ctx = ctx();
        let first = ExecError::new("first", "node-test");
        let second = ExecError::new("second", "node-test");
        assert!(ctx.cancel(first.clone()));
        assert!(!ctx.cancel(second));
        assert_eq!(ctx.error().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_concurrent_cancel_single_capture() {
        let ctx = ctx();
        let mut handles = Vec::new();
        for i in 0..8 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                ctx.cancel(ExecError::new(format!("err-{i}"), "node-test"))
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(ctx.is_canceled());
        assert!(ctx.error().is_some());
    }

    #[tokio::test]
    async fn test_quiet_cancel_has_no_error() {
        let ctx = ctx();
        assert!(ctx.cancel_quiet());
        assert!(ctx.is_canceled());
        assert!(ctx.error().is_none());
        assert!(ctx.check().unwrap_err().is_canceled());
    }

    #[tokio::test]
    async fn test_done_wakes_on_cancel() {
        let ctx = ctx();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.done().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel_quiet();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("done() did not wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_done_returns_immediately_when_already_canceled() {
        let ctx = ctx();
        ctx.cancel_quiet();
        tokio::time::timeout(Duration::from_millis(100), ctx.done())
            .await
            .expect("done() should resolve immediately");
    }
}
