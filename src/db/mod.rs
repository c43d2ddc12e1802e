//! The database subsystem: a pool of pipelined backend handles behind a
//! single submission queue.
//!
//! [`Query`] and [`Transaction`] are the interface the rest of the server
//! uses; [`Pool`] owns the work queue and the handle lifecycle, and each
//! handle speaks the extended-query protocol on its own connection.

pub(crate) mod handle;
pub(crate) mod proto;

pub mod pool;
pub mod query;
pub mod transaction;

pub use pool::{BackendStream, Connect, Pool, PoolGauges};
pub use query::{Query, QueryState, Row, Value};
pub use transaction::{Transaction, TransactionState};
