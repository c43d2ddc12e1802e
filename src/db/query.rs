//! One SQL statement with bound parameters, a row buffer and a completion
//! notification.

use crate::db::proto::Column;
use crate::db::transaction::TxnShared;
use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// A value bound to a query parameter or decoded from a result column.
///
/// This is the logical-type surface the server exchanges with the backend;
/// anything richer is the caller's problem.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i32),
    BigInt(i64),
    Text(String),
    Bytes(Bytes),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Encodes the value for a Bind message as a `(format, bytes)` pair.
    /// Everything travels in text format except raw bytes.
    pub(crate) fn encode(&self) -> (i16, Option<Bytes>) {
        match self {
            Value::Null => (0, None),
            Value::Boolean(b) => (0, Some(Bytes::from(if *b { "true" } else { "false" }))),
            Value::Integer(i) => (0, Some(Bytes::from(i.to_string()))),
            Value::BigInt(i) => (0, Some(Bytes::from(i.to_string()))),
            Value::Text(s) => (0, Some(Bytes::from(s.clone()))),
            Value::Bytes(b) => (1, Some(b.clone())),
            Value::Timestamp(t) => (
                0,
                Some(Bytes::from(t.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string())),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::BigInt(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Decodes a text-format result value by the column's type oid. Types the
/// dispatch table does not know degrade to `Text`.
fn decode_value(oid: u32, raw: &[u8]) -> Result<Value> {
    let value = match oid {
        16 => match raw {
            b"t" | b"true" => Value::Boolean(true),
            b"f" | b"false" => Value::Boolean(false),
            other => {
                return Err(Error::Protocol(format!(
                    "invalid boolean literal {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        },
        21 | 23 => Value::Integer(
            atoi::atoi(raw).ok_or_else(|| Error::Protocol("invalid integer".to_string()))?,
        ),
        20 | 26 => Value::BigInt(
            atoi::atoi(raw).ok_or_else(|| Error::Protocol("invalid bigint".to_string()))?,
        ),
        17 => {
            let text = std::str::from_utf8(raw)
                .map_err(|e| Error::Protocol(format!("invalid bytea: {e}")))?;
            let hex = text
                .strip_prefix("\\x")
                .ok_or_else(|| Error::Protocol("bytea without \\x prefix".to_string()))?;
            Value::Bytes(Bytes::from(
                hex::decode(hex).map_err(|e| Error::Protocol(format!("invalid bytea: {e}")))?,
            ))
        }
        1114 | 1184 => {
            let text = std::str::from_utf8(raw)
                .map_err(|e| Error::Protocol(format!("invalid timestamp: {e}")))?;
            Value::Timestamp(parse_timestamp(text)?)
        }
        _ => Value::Text(String::from_utf8(raw.to_vec())?),
    };
    Ok(value)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(t.and_utc());
    }
    Err(Error::Protocol(format!("invalid timestamp `{text}`")))
}

/// One result row, addressable by column name.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn decode(columns: Arc<[Column]>, raw: Vec<Option<Bytes>>) -> Result<Row> {
        if raw.len() != columns.len() {
            return Err(Error::Protocol(format!(
                "row has {} values for {} columns",
                raw.len(),
                columns.len()
            )));
        }
        let values = columns
            .iter()
            .zip(raw)
            .map(|(column, value)| match value {
                None => Ok(Value::Null),
                Some(bytes) => decode_value(column.oid, &bytes),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Row { columns, values })
    }

    /// Looks a value up by column name, or `None` for unknown columns and
    /// SQL NULL.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let i = self.columns.iter().position(|c| c.name == name)?;
        match &self.values[i] {
            Value::Null => None,
            value => Some(value),
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integers of either width; the backend does not always agree with the
    /// schema about which one a count is.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Value::Integer(i) => Some(i64::from(*i)),
            Value::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_bytes(&self, name: &str) -> Option<&Bytes> {
        match self.get(name)? {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn get_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name)? {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

/// Lifecycle of a [`Query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Created, parameters still bindable.
    Inactive,
    /// In the pool's work queue; parameters are sealed.
    Submitted,
    /// Owned by a handle which is exchanging messages for it.
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl QueryState {
    /// True for the three states a query never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryState::Completed | QueryState::Failed | QueryState::Cancelled
        )
    }
}

/// What the handle should send for this unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryKind {
    Statement,
    Commit,
    Rollback,
}

#[derive(Debug)]
struct QueryInner {
    state: QueryState,
    /// Bound parameters, dense from position 1.
    params: Vec<Value>,
    rows: VecDeque<Row>,
    columns: Option<Arc<[Column]>>,
    error: Option<String>,
}

/// One SQL statement submitted to the pool.
///
/// A query is shared between its submitter and the pool, so all state is
/// behind a mutex; none of it is held across await points. The submitter is
/// notified exactly once, when the query reaches a terminal state.
#[derive(Debug)]
pub struct Query {
    id: u64,
    sql: String,
    kind: QueryKind,
    transaction: Option<Arc<TxnShared>>,
    submitter: Option<Arc<Notify>>,
    inner: Mutex<QueryInner>,
    done: Notify,
    submitter_notified: AtomicBool,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Query {
        Self::build(sql.into(), QueryKind::Statement, None, None)
    }

    /// A query whose completion pings `submitter`, waking the event loop of
    /// whoever is interested without them having to poll.
    pub fn with_submitter(sql: impl Into<String>, submitter: Arc<Notify>) -> Query {
        Self::build(sql.into(), QueryKind::Statement, None, Some(submitter))
    }

    pub(crate) fn build(
        sql: String,
        kind: QueryKind,
        transaction: Option<Arc<TxnShared>>,
        submitter: Option<Arc<Notify>>,
    ) -> Query {
        Query {
            id: NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed),
            sql,
            kind,
            transaction,
            submitter,
            inner: Mutex::new(QueryInner {
                state: QueryState::Inactive,
                params: Vec::new(),
                rows: VecDeque::new(),
                columns: None,
                error: None,
            }),
            done: Notify::new(),
            submitter_notified: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub(crate) fn kind(&self) -> QueryKind {
        self.kind
    }

    pub(crate) fn transaction_shared(&self) -> Option<&Arc<TxnShared>> {
        self.transaction.as_ref()
    }

    pub(crate) fn attach_transaction(&mut self, txn: Arc<TxnShared>) {
        self.transaction = Some(txn);
    }

    /// Binds the parameter at 1-based `position`. Binding is only possible
    /// before submission; gaps left unbound become NULL.
    pub fn bind(&self, position: usize, value: impl Into<Value>) -> Result<()> {
        if position == 0 {
            return Err(Error::Logic("parameter positions are 1-based".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.state != QueryState::Inactive {
            return Err(Error::Logic(format!(
                "cannot bind ${position} after submission"
            )));
        }
        if inner.params.len() < position {
            inner.params.resize(position, Value::Null);
        }
        inner.params[position - 1] = value.into();
        Ok(())
    }

    pub fn state(&self) -> QueryState {
        self.inner.lock().unwrap().state
    }

    /// True once the query has reached a terminal state.
    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn failed(&self) -> bool {
        matches!(self.state(), QueryState::Failed | QueryState::Cancelled)
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    /// Removes and returns the next buffered row.
    pub fn next_row(&self) -> Option<Row> {
        self.inner.lock().unwrap().rows.pop_front()
    }

    pub fn has_rows(&self) -> bool {
        !self.inner.lock().unwrap().rows.is_empty()
    }

    /// Waits until the query reaches a terminal state.
    pub async fn wait(&self) {
        loop {
            let notified = self.done.notified();
            if self.done() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn params(&self) -> Vec<(i16, Option<Bytes>)> {
        self.inner
            .lock()
            .unwrap()
            .params
            .iter()
            .map(Value::encode)
            .collect()
    }

    pub(crate) fn set_submitted(&self) {
        self.inner.lock().unwrap().state = QueryState::Submitted;
    }

    pub(crate) fn set_executing(&self) {
        self.inner.lock().unwrap().state = QueryState::Executing;
    }

    pub(crate) fn set_columns(&self, columns: Arc<[Column]>) {
        self.inner.lock().unwrap().columns = Some(columns);
    }

    pub(crate) fn push_row(&self, raw: Vec<Option<Bytes>>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let columns = inner
            .columns
            .clone()
            .ok_or_else(|| Error::Protocol("data row before row description".to_string()))?;
        let row = Row::decode(columns, raw)?;
        inner.rows.push_back(row);
        Ok(())
    }

    /// Moves to a terminal state and fires the completion notifications.
    /// Later calls are ignored, so the submitter hears about each query
    /// exactly once.
    fn finish(&self, state: QueryState, error: Option<String>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = state;
            inner.error = error;
        }
        self.notify();
    }

    pub(crate) fn complete(&self) {
        self.finish(QueryState::Completed, None);
    }

    pub(crate) fn fail(&self, message: impl Into<String>) {
        self.finish(QueryState::Failed, Some(message.into()));
    }

    pub(crate) fn cancelled(&self) {
        self.finish(QueryState::Cancelled, Some("query cancelled".to_string()));
    }

    fn notify(&self) {
        self.done.notify_waiters();
        if let Some(submitter) = &self.submitter {
            if !self.submitter_notified.swap(true, Ordering::AcqRel) {
                submitter.notify_one();
            }
        }
    }
}
