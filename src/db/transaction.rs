//! A sequence of queries bound to one backend handle between BEGIN and
//! COMMIT/ROLLBACK.

use crate::db::pool::Pool;
use crate::db::query::{Query, QueryKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Nothing enqueued yet.
    Inactive,
    /// At least one query enqueued; a handle will send BEGIN when it
    /// adopts the transaction.
    Executing,
    Committed,
    RolledBack,
    /// A query failed; the block ends in ROLLBACK whatever the caller asks.
    Failed,
}

#[derive(Debug)]
struct TxnInner {
    state: TransactionState,
    failed: bool,
    error: Option<String>,
    /// Handle that owns this transaction, while one does.
    handle: Option<u32>,
}

/// State shared between the [`Transaction`] handle its queries and the pool.
#[derive(Debug)]
pub(crate) struct TxnShared {
    id: u64,
    inner: Mutex<TxnInner>,
}

impl TxnShared {
    fn new() -> Arc<TxnShared> {
        Arc::new(TxnShared {
            id: NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(TxnInner {
                state: TransactionState::Inactive,
                failed: false,
                error: None,
                handle: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> TransactionState {
        self.inner.lock().unwrap().state
    }

    pub(crate) fn set_executing(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == TransactionState::Inactive {
            inner.state = TransactionState::Executing;
        }
    }

    pub(crate) fn failed(&self) -> bool {
        self.inner.lock().unwrap().failed
    }

    pub(crate) fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    /// Records the first failure; later ones keep the original message.
    pub(crate) fn mark_failed(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.failed {
            inner.failed = true;
            inner.error = Some(message.into());
            inner.state = TransactionState::Failed;
        }
    }

    pub(crate) fn handle(&self) -> Option<u32> {
        self.inner.lock().unwrap().handle
    }

    pub(crate) fn set_handle(&self, handle: u32) {
        self.inner.lock().unwrap().handle = Some(handle);
    }

    /// Called by the owning handle once COMMIT/ROLLBACK has completed.
    pub(crate) fn finish(&self, state: TransactionState) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        inner.handle = None;
    }
}

/// A unit of work. Queries enqueued here execute in order on a single
/// handle; once any of them fails, the rest are failed locally without ever
/// reaching the backend, and the block ends in ROLLBACK.
#[derive(Debug)]
pub struct Transaction {
    pool: Pool,
    shared: Arc<TxnShared>,
    submitter: Option<Arc<Notify>>,
    /// The COMMIT/ROLLBACK query, once one has been enqueued.
    end: Option<Arc<Query>>,
}

impl Transaction {
    pub fn new(pool: &Pool) -> Transaction {
        Transaction {
            pool: pool.clone(),
            shared: TxnShared::new(),
            submitter: None,
            end: None,
        }
    }

    /// Like [`new`](Self::new), but the terminating COMMIT/ROLLBACK query
    /// notifies `submitter` on completion.
    pub fn with_submitter(pool: &Pool, submitter: Arc<Notify>) -> Transaction {
        Transaction {
            pool: pool.clone(),
            shared: TxnShared::new(),
            submitter: Some(submitter),
            end: None,
        }
    }

    /// Hands `query` to the pool as part of this transaction.
    ///
    /// After a failure the query is failed immediately with the original
    /// error and never submitted.
    pub fn enqueue(&mut self, mut query: Query) -> Arc<Query> {
        query.attach_transaction(self.shared.clone());
        let query = Arc::new(query);
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.failed {
            let error = inner.error.clone().unwrap_or_default();
            drop(inner);
            query.set_submitted();
            query.fail(error);
        } else {
            if inner.state == TransactionState::Inactive {
                inner.state = TransactionState::Executing;
            }
            drop(inner);
            self.pool.submit(&query);
        }
        query
    }

    /// Enqueues the implicit COMMIT. If the transaction has failed, the
    /// backend receives ROLLBACK instead and [`failed`](Self::failed) stays
    /// true. Calling it again returns the same query.
    pub fn commit(&mut self) -> Arc<Query> {
        self.end_with(QueryKind::Commit, "COMMIT")
    }

    pub fn rollback(&mut self) -> Arc<Query> {
        self.end_with(QueryKind::Rollback, "ROLLBACK")
    }

    fn end_with(&mut self, kind: QueryKind, sql: &str) -> Arc<Query> {
        if let Some(end) = &self.end {
            return end.clone();
        }
        self.shared.set_executing();
        let query = Arc::new(Query::build(
            sql.to_string(),
            kind,
            Some(self.shared.clone()),
            self.submitter.take(),
        ));
        self.pool.submit(&query);
        self.end = Some(query.clone());
        query
    }

    /// True once the terminating COMMIT/ROLLBACK has completed.
    pub fn done(&self) -> bool {
        self.end.as_ref().map(|q| q.done()).unwrap_or(false)
    }

    pub fn failed(&self) -> bool {
        self.shared.failed() || self.end.as_ref().map(|q| q.failed()).unwrap_or(false)
    }

    pub fn error(&self) -> Option<String> {
        self.shared
            .error()
            .or_else(|| self.end.as_ref().and_then(|q| q.error()))
    }

    pub fn state(&self) -> TransactionState {
        self.shared.state()
    }

    pub(crate) fn shared(&self) -> &Arc<TxnShared> {
        &self.shared
    }
}

impl Drop for Transaction {
    /// An abandoned open transaction would pin its handle forever, so
    /// dropping without commit() or rollback() rolls back.
    fn drop(&mut self) {
        if self.end.is_none() && self.shared.state() == TransactionState::Executing {
            self.rollback();
        }
    }
}
