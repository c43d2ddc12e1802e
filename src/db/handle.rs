//! One live backend connection.
//!
//! A handle is a cooperative task owning one socket to the database. It
//! authenticates, then repeatedly pulls a unit of work from the pool,
//! pipelines the extended-query messages for it, and routes the backend's
//! replies into the owning query. Transactions are adopted whole: BEGIN is
//! pipelined in front of the first statement and the handle stays bound to
//! the transaction until COMMIT/ROLLBACK.

use crate::connection::Connection;
use crate::db::pool::{BackendStream, Control, HandleStatus, PoolShared, Take};
use crate::db::proto::{self, Auth, BackendMessage, Column, TransactionStatus};
use crate::db::query::{Query, QueryKind};
use crate::db::transaction::{TransactionState, TxnShared};
use crate::{Error, Result};
use bytes::Buf;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, warn};

/// SQLSTATE for "canceled by user request".
const QUERY_CANCELLED: &str = "57014";

/// Connects, authenticates and serves the queue until told to stop. The
/// slot is removed on the way out; losing the last handle re-seeds the pool.
pub(crate) async fn run(
    pool: Arc<PoolShared>,
    id: u32,
    control: mpsc::UnboundedReceiver<Control>,
) {
    let stream = match pool.connector().connect().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(handle = id, error = %e, "backend connection failed");
            // pace reconnection storms while the backend is unreachable
            tokio::time::sleep(Duration::from_secs(1)).await;
            pool.remove_handle(id);
            return;
        }
    };

    let mut handle = Handle {
        pool: pool.clone(),
        id,
        conn: Connection::new(stream),
        control,
        control_closed: false,
        prepared: HashMap::new(),
        next_statement: 0,
        last_parsed: None,
        cancel_key: None,
        pending_ready: 0,
        skip_complete: 0,
        current: None,
        txn: None,
        txn_failed: false,
        stop_requested: false,
    };

    match handle.serve().await {
        Ok(()) => debug!(handle = id, "handle closed"),
        Err(e) => {
            warn!(handle = id, error = %e, "handle broken");
            let message = format!("backend connection lost: {e}");
            if let Some(query) = handle.current.take() {
                query.fail(message.clone());
            }
            if let Some(txn) = handle.txn.take() {
                txn.mark_failed(message);
                txn.finish(TransactionState::Failed);
            }
        }
    }
    pool.remove_handle(id);
}

struct Handle {
    pool: Arc<PoolShared>,
    id: u32,
    conn: Connection<BackendStream>,
    control: mpsc::UnboundedReceiver<Control>,
    control_closed: bool,
    /// SQL text to named-statement mapping for this connection.
    prepared: HashMap<String, String>,
    next_statement: u32,
    /// SQL whose Parse is in flight; evicted from the cache on error.
    last_parsed: Option<String>,
    cancel_key: Option<(i32, i32)>,
    /// ReadyForQuery messages still owed by the backend.
    pending_ready: usize,
    /// CommandComplete messages that belong to pipelined BEGINs, not to the
    /// current query.
    skip_complete: usize,
    current: Option<Arc<Query>>,
    /// The transaction this handle is bound to, from BEGIN to COMMIT/ROLLBACK.
    txn: Option<Arc<TxnShared>>,
    txn_failed: bool,
    stop_requested: bool,
}

enum Step {
    Message(BackendMessage),
    Control(Option<Control>),
}

/// What the serve loop decided to do next.
enum Next {
    Work(Arc<Query>),
    Control(Option<Control>),
    Notified,
    Stop,
}

impl Handle {
    async fn serve(&mut self) -> Result<()> {
        self.startup().await?;
        self.pool.handle_connected(self.id);
        debug!(handle = self.id, "backend ready");

        loop {
            if self.stop_requested {
                return self.terminate().await;
            }
            let next = {
                // register interest before checking the queue, so a
                // submission racing with this poll is not lost
                let notified = self.pool.work_notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.pool.take_work(self.id) {
                    Take::Work(query) => Next::Work(query),
                    Take::Retire => {
                        debug!(handle = self.id, "retiring surplus handle");
                        Next::Stop
                    }
                    Take::Shutdown => Next::Stop,
                    Take::Wait => {
                        if self.control_closed {
                            notified.await;
                            Next::Notified
                        } else {
                            tokio::select! {
                                _ = &mut notified => Next::Notified,
                                control = self.control.recv() => Next::Control(control),
                            }
                        }
                    }
                }
            };
            match next {
                Next::Work(query) => self.run_unit(query).await?,
                Next::Control(control) => self.apply_control(control),
                Next::Notified => {}
                Next::Stop => return self.terminate().await,
            }
        }
    }

    /// Startup packet, authentication exchange, then wait for the first
    /// ReadyForQuery.
    async fn startup(&mut self) -> Result<()> {
        let (user, password) = self.pool.credentials();
        let database = self.pool.config().db_name.clone();
        proto::write_startup(self.conn.write_buffer(), &user, &database);
        self.conn.flush().await?;

        loop {
            match Self::read_message(&mut self.conn).await? {
                BackendMessage::Authentication(Auth::Ok) => {}
                BackendMessage::Authentication(Auth::CleartextPassword) => {
                    proto::write_password(self.conn.write_buffer(), &password);
                    self.conn.flush().await?;
                }
                BackendMessage::Authentication(Auth::Md5Password { salt }) => {
                    let digest = proto::md5_password(&user, &password, salt);
                    proto::write_password(self.conn.write_buffer(), &digest);
                    self.conn.flush().await?;
                }
                BackendMessage::Authentication(Auth::Other(code)) => {
                    return Err(Error::Protocol(format!(
                        "unsupported authentication request {code}"
                    )));
                }
                BackendMessage::BackendKeyData { pid, secret } => {
                    self.cancel_key = Some((pid, secret));
                }
                BackendMessage::ParameterStatus { name, value } => {
                    debug!(handle = self.id, %name, %value, "server parameter");
                }
                BackendMessage::NoticeResponse(notice) => debug!(handle = self.id, %notice),
                BackendMessage::ErrorResponse { code, message } => {
                    return Err(Error::Backend { code, message });
                }
                BackendMessage::ReadyForQuery(_) => return Ok(()),
                other => debug!(handle = self.id, ?other, "ignored during startup"),
            }
        }
    }

    /// Reads one backend message, waiting for more bytes as needed.
    async fn read_message(conn: &mut Connection<BackendStream>) -> Result<BackendMessage> {
        loop {
            {
                let buffer = conn.read_buffer();
                let mut cursor = Cursor::new(&buffer[..]);
                match BackendMessage::check(&mut cursor) {
                    Ok(()) => {
                        let len = cursor.position() as usize;
                        let mut cursor = Cursor::new(&buffer[..]);
                        let message = BackendMessage::parse(&mut cursor)?;
                        buffer.advance(len);
                        return Ok(message);
                    }
                    Err(Error::IncompleteMessage) => {}
                    Err(e) => return Err(e),
                }
            }
            if conn.read_more().await? == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "backend closed the connection",
                )));
            }
        }
    }

    async fn run_unit(&mut self, query: Arc<Query>) -> Result<()> {
        // inside a failed transaction only the terminating statement goes
        // anywhere; everything else is failed locally, never sent
        if let Some(txn) = query.transaction_shared() {
            if txn.failed() && query.kind() == QueryKind::Statement {
                let error = txn
                    .error()
                    .unwrap_or_else(|| "transaction failed".to_string());
                query.fail(error);
                self.pool
                    .work_finished(self.id, HandleStatus::FailedTransaction);
                return Ok(());
            }
        }
        match query.kind() {
            QueryKind::Statement => self.run_statement(query).await,
            QueryKind::Commit | QueryKind::Rollback => self.finish_transaction(query).await,
        }
    }

    /// Pipelines PARSE/BIND/DESCRIBE/EXECUTE/SYNC for one query, preceded
    /// by BEGIN if this statement adopts a transaction, then drains the
    /// replies.
    async fn run_statement(&mut self, query: Arc<Query>) -> Result<()> {
        if let Some(txn) = query.transaction_shared() {
            if self.txn.as_ref().map(|t| t.id()) != Some(txn.id()) {
                proto::write_query(self.conn.write_buffer(), "BEGIN");
                self.pending_ready += 1;
                self.skip_complete += 1;
                self.txn = Some(txn.clone());
                self.txn_failed = false;
            }
        }

        let statement = match self.prepared.get(query.sql()) {
            Some(name) => name.clone(),
            None => {
                let name = format!("s{}", self.next_statement);
                self.next_statement += 1;
                proto::write_parse(self.conn.write_buffer(), &name, query.sql());
                self.prepared.insert(query.sql().to_string(), name.clone());
                self.last_parsed = Some(query.sql().to_string());
                name
            }
        };
        proto::write_bind(self.conn.write_buffer(), &statement, &query.params());
        proto::write_describe_portal(self.conn.write_buffer());
        proto::write_execute(self.conn.write_buffer());
        proto::write_sync(self.conn.write_buffer());
        self.pending_ready += 1;
        self.pool.record_execution();
        self.conn.flush().await?;

        query.set_executing();
        self.current = Some(query);
        self.drain().await?;
        self.last_parsed = None;

        let status = self.unit_status();
        self.pool.work_finished(self.id, status);
        Ok(())
    }

    /// Sends the terminating COMMIT or ROLLBACK of a transaction. A failed
    /// transaction rolls back even when the caller asked for COMMIT.
    async fn finish_transaction(&mut self, query: Arc<Query>) -> Result<()> {
        let txn = query.transaction_shared().cloned();
        let rollback = query.kind() == QueryKind::Rollback
            || txn.as_ref().map(|t| t.failed()).unwrap_or(false);
        if let Some(txn) = &txn {
            // a transaction that never ran a statement here has no open
            // block to end, but the bookkeeping still completes below
            self.txn.get_or_insert_with(|| txn.clone());
        }

        let sql = if rollback { "ROLLBACK" } else { "COMMIT" };
        proto::write_query(self.conn.write_buffer(), sql);
        self.pending_ready += 1;
        self.pool.record_execution();
        self.conn.flush().await?;

        query.set_executing();
        self.current = Some(query);
        self.drain().await?;

        if let Some(txn) = self.txn.take() {
            let state = if rollback {
                TransactionState::RolledBack
            } else {
                TransactionState::Committed
            };
            txn.finish(state);
        }
        self.txn_failed = false;
        self.pool.release_transaction(self.id);
        self.pool.work_finished(self.id, HandleStatus::Idle);
        Ok(())
    }

    /// Processes backend messages until every pipelined Sync has been
    /// answered with ReadyForQuery, servicing control messages meanwhile.
    async fn drain(&mut self) -> Result<()> {
        while self.pending_ready > 0 {
            let step = if self.control_closed {
                Step::Message(Self::read_message(&mut self.conn).await?)
            } else {
                tokio::select! {
                    message = Self::read_message(&mut self.conn) => Step::Message(message?),
                    control = self.control.recv() => Step::Control(control),
                }
            };
            match step {
                Step::Message(message) => self.on_message(message),
                Step::Control(control) => self.apply_control(control),
            }
        }
        if let Some(query) = self.current.take() {
            // the backend went Ready without completing the query
            query.fail("no response to query".to_string());
        }
        Ok(())
    }

    fn on_message(&mut self, message: BackendMessage) {
        match message {
            BackendMessage::RowDescription(columns) => {
                let columns: Arc<[Column]> = columns.into();
                if let Some(query) = &self.current {
                    query.set_columns(columns);
                }
            }
            BackendMessage::DataRow(values) => {
                if let Some(query) = &self.current {
                    if let Err(e) = query.push_row(values) {
                        query.fail(e.to_string());
                    }
                }
            }
            BackendMessage::CommandComplete(tag) => {
                if self.skip_complete > 0 {
                    self.skip_complete -= 1;
                    debug!(handle = self.id, %tag, "pipelined statement done");
                } else if let Some(query) = self.current.take() {
                    query.complete();
                }
            }
            BackendMessage::EmptyQueryResponse => {
                if let Some(query) = self.current.take() {
                    query.complete();
                }
            }
            BackendMessage::ErrorResponse { code, message } => {
                // a failed Parse leaves no named statement behind
                if let Some(sql) = self.last_parsed.take() {
                    self.prepared.remove(&sql);
                }
                if let Some(query) = self.current.take() {
                    if code == QUERY_CANCELLED {
                        query.cancelled();
                    } else {
                        let error = Error::Backend {
                            code,
                            message: message.clone(),
                        };
                        query.fail(error.to_string());
                    }
                }
                if let Some(txn) = &self.txn {
                    txn.mark_failed(message);
                    self.txn_failed = true;
                }
            }
            BackendMessage::ReadyForQuery(status) => {
                if status == TransactionStatus::Failed {
                    self.txn_failed = true;
                }
                self.pending_ready = self.pending_ready.saturating_sub(1);
            }
            BackendMessage::NoticeResponse(notice) => debug!(handle = self.id, %notice),
            BackendMessage::ParameterStatus { name, value } => {
                debug!(handle = self.id, %name, %value, "server parameter changed");
            }
            BackendMessage::BackendKeyData { pid, secret } => {
                self.cancel_key = Some((pid, secret));
            }
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::PortalSuspended
            | BackendMessage::Authentication(_) => {}
            BackendMessage::Unknown(tag) => {
                debug!(handle = self.id, tag, "ignored backend message");
            }
        }
    }

    fn apply_control(&mut self, control: Option<Control>) {
        match control {
            Some(Control::Cancel(id)) => self.cancel(id),
            Some(Control::Shutdown) => self.stop_requested = true,
            None => self.control_closed = true,
        }
    }

    /// Issues the out-of-band cancel request for `id` if this handle is
    /// executing it. Without a cancellation key from startup this is a
    /// best-effort no-op.
    fn cancel(&mut self, id: u64) {
        let executing = self.current.as_ref().map(|q| q.id()) == Some(id);
        if !executing {
            return;
        }
        let Some((pid, secret)) = self.cancel_key else {
            debug!(handle = self.id, "no cancellation key, cancel is a no-op");
            return;
        };
        debug!(handle = self.id, query = id, "sending cancel request");
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = send_cancel(pool, pid, secret).await {
                debug!(error = %e, "cancel request failed");
            }
        });
    }

    fn unit_status(&self) -> HandleStatus {
        if self.txn.is_some() {
            if self.txn_failed {
                HandleStatus::FailedTransaction
            } else {
                HandleStatus::InTransaction
            }
        } else {
            HandleStatus::Idle
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        proto::write_terminate(self.conn.write_buffer());
        let _ = self.conn.close().await;
        Ok(())
    }
}

/// The cancel channel: a second short-lived connection carrying only the
/// CancelRequest packet.
async fn send_cancel(pool: Arc<PoolShared>, pid: i32, secret: i32) -> Result<()> {
    let stream = pool.connector().connect().await?;
    let mut conn = Connection::new(stream);
    proto::write_cancel_request(conn.write_buffer(), pid, secret);
    conn.flush().await?;
    conn.close().await
}
