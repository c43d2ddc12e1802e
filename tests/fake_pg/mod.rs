//! An in-process scripted PostgreSQL backend.
//!
//! Speaks just enough of the wire protocol for the pool's handles:
//! startup, the extended-query message flow, simple queries for
//! BEGIN/COMMIT/ROLLBACK, and the out-of-band CancelRequest. Results are
//! driven by substring-matched rules; every received statement is logged
//! with the id of the connection that received it, so tests can assert
//! ordering, affinity and what was never sent.

// each test binary uses a different slice of this module
#![allow(dead_code)]

use bytes::{Buf, BufMut, BytesMut};
use correio::db::{BackendStream, Connect};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tokio::time::Duration;

const STARTUP_CODE: i32 = 196_608;
const CANCEL_CODE: i32 = 80_877_102;

/// What a matched statement produces.
#[derive(Debug, Clone)]
pub enum Response {
    Rows {
        /// `(name, type oid)` per column.
        columns: Vec<(&'static str, u32)>,
        /// Text-format values; `None` is NULL.
        rows: Vec<Vec<Option<String>>>,
        tag: &'static str,
    },
    Error {
        code: &'static str,
        message: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// Substring matched against the statement text.
    pub pattern: &'static str,
    /// Simulated execution time.
    pub delay: Duration,
    pub response: Response,
}

impl Rule {
    pub fn rows(
        pattern: &'static str,
        columns: Vec<(&'static str, u32)>,
        rows: Vec<Vec<Option<String>>>,
    ) -> Rule {
        Rule {
            pattern,
            delay: Duration::ZERO,
            response: Response::Rows {
                columns,
                rows,
                tag: "SELECT 1",
            },
        }
    }

    pub fn error(pattern: &'static str, code: &'static str, message: &'static str) -> Rule {
        Rule {
            pattern,
            delay: Duration::ZERO,
            response: Response::Error { code, message },
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Rule {
        self.delay = delay;
        self
    }
}

/// The fake server: shared rules, a statement log and a cancellation flag.
pub struct FakePg {
    rules: Vec<Rule>,
    /// `(connection id, statement)` in receive order.
    log: Mutex<Vec<(usize, String)>>,
    connections: AtomicUsize,
    /// Pinged by a CancelRequest; in-flight delays abort with SQLSTATE
    /// 57014 when this fires.
    cancel: Notify,
}

impl FakePg {
    pub fn new(rules: Vec<Rule>) -> Arc<FakePg> {
        Arc::new(FakePg {
            rules,
            log: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            cancel: Notify::new(),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Box<dyn Connect> {
        Box::new(FakeConnector {
            server: self.clone(),
        })
    }

    /// Number of connections ever opened, cancel channels included.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<(usize, String)> {
        self.log.lock().unwrap().clone()
    }

    /// True if any received statement contains `pattern`.
    pub fn saw(&self, pattern: &str) -> bool {
        self.statements().iter().any(|(_, sql)| sql.contains(pattern))
    }

    fn respond_to(&self, sql: &str) -> Response {
        for rule in &self.rules {
            if sql.contains(rule.pattern) {
                return rule.response.clone();
            }
        }
        Response::Rows {
            columns: Vec::new(),
            rows: Vec::new(),
            tag: "SELECT 0",
        }
    }

    fn delay_for(&self, sql: &str) -> Duration {
        self.rules
            .iter()
            .find(|rule| sql.contains(rule.pattern))
            .map(|rule| rule.delay)
            .unwrap_or(Duration::ZERO)
    }
}

struct FakeConnector {
    server: Arc<FakePg>,
}

impl Connect for FakeConnector {
    fn connect(&self) -> Pin<Box<dyn Future<Output = correio::Result<BackendStream>> + Send + '_>> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let id = self.server.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(self.server.clone(), id, server));
            Ok(Box::new(client) as BackendStream)
        })
    }
}

fn put_message(dst: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    dst.put_u8(tag);
    let at = dst.len();
    dst.put_i32(0);
    body(dst);
    let len = (dst.len() - at) as i32;
    dst[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

fn ready_for_query(dst: &mut BytesMut, in_txn: bool, failed: bool) {
    let status = if !in_txn {
        b'I'
    } else if failed {
        b'E'
    } else {
        b'T'
    };
    put_message(dst, b'Z', |b| b.put_u8(status));
}

fn command_complete(dst: &mut BytesMut, tag: &str) {
    put_message(dst, b'C', |b| put_cstr(b, tag));
}

fn error_response(dst: &mut BytesMut, code: &str, message: &str) {
    put_message(dst, b'E', |b| {
        b.put_u8(b'S');
        put_cstr(b, "ERROR");
        b.put_u8(b'C');
        put_cstr(b, code);
        b.put_u8(b'M');
        put_cstr(b, message);
        b.put_u8(0);
    });
}

fn row_description(dst: &mut BytesMut, columns: &[(&str, u32)]) {
    put_message(dst, b'T', |b| {
        b.put_i16(columns.len() as i16);
        for (name, oid) in columns {
            put_cstr(b, name);
            b.put_i32(0);
            b.put_i16(0);
            b.put_u32(*oid);
            b.put_i16(-1);
            b.put_i32(-1);
            b.put_i16(0);
        }
    });
}

fn data_row(dst: &mut BytesMut, values: &[Option<String>]) {
    put_message(dst, b'D', |b| {
        b.put_i16(values.len() as i16);
        for value in values {
            match value {
                None => b.put_i32(-1),
                Some(v) => {
                    b.put_i32(v.len() as i32);
                    b.put_slice(v.as_bytes());
                }
            }
        }
    });
}

struct Conn {
    stream: DuplexStream,
    buffer: BytesMut,
}

impl Conn {
    /// Reads the next typed message, or `None` at end of stream.
    async fn next(&mut self) -> Option<(u8, BytesMut)> {
        loop {
            if self.buffer.len() >= 5 {
                let len = i32::from_be_bytes(self.buffer[1..5].try_into().unwrap()) as usize;
                if self.buffer.len() >= len + 1 {
                    let tag = self.buffer[0];
                    self.buffer.advance(5);
                    let body = self.buffer.split_to(len - 4);
                    return Some((tag, body));
                }
            }
            if self.stream.read_buf(&mut self.buffer).await.ok()? == 0 {
                return None;
            }
        }
    }

    async fn send(&mut self, out: &mut BytesMut) {
        if !out.is_empty() {
            let _ = self.stream.write_all(out).await;
            out.clear();
        }
    }
}

fn get_cstr(body: &mut BytesMut) -> String {
    let nul = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let s = String::from_utf8_lossy(&body[..nul]).into_owned();
    body.advance((nul + 1).min(body.len()));
    s
}

async fn serve(fake: Arc<FakePg>, id: usize, stream: DuplexStream) {
    let mut conn = Conn {
        stream,
        buffer: BytesMut::with_capacity(16 * 1024),
    };

    // untyped startup packet: length, version code, parameters
    let mut header = [0u8; 8];
    if conn.stream.read_exact(&mut header).await.is_err() {
        return;
    }
    let len = i32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
    let code = i32::from_be_bytes(header[4..8].try_into().unwrap());
    let mut rest = vec![0u8; len - 8];
    if conn.stream.read_exact(&mut rest).await.is_err() {
        return;
    }
    if code == CANCEL_CODE {
        fake.log.lock().unwrap().push((id, "<cancel>".to_string()));
        fake.cancel.notify_waiters();
        return;
    }
    assert_eq!(code, STARTUP_CODE, "unexpected startup code");

    let mut out = BytesMut::new();
    put_message(&mut out, b'R', |b| b.put_i32(0)); // AuthenticationOk
    put_message(&mut out, b'K', |b| {
        b.put_i32(id as i32);
        b.put_i32(424_242);
    });
    ready_for_query(&mut out, false, false);
    conn.send(&mut out).await;

    let mut statements: HashMap<String, String> = HashMap::new();
    let mut portal_sql = String::new();
    let mut in_txn = false;
    let mut failed = false;
    // after an error, incoming extended messages are discarded until Sync
    let mut skipping = false;

    while let Some((tag, mut body)) = conn.next().await {
        match tag {
            b'P' => {
                if skipping {
                    continue;
                }
                let name = get_cstr(&mut body);
                let sql = get_cstr(&mut body);
                statements.insert(name, sql);
                put_message(&mut out, b'1', |_| {});
            }
            b'B' => {
                if skipping {
                    continue;
                }
                let _portal = get_cstr(&mut body);
                let statement = get_cstr(&mut body);
                portal_sql = statements.get(&statement).cloned().unwrap_or_default();
                put_message(&mut out, b'2', |_| {});
            }
            b'D' => {
                if skipping {
                    continue;
                }
                if let Response::Rows { columns, .. } = fake.respond_to(&portal_sql) {
                    if !columns.is_empty() {
                        row_description(&mut out, &columns);
                    }
                }
            }
            b'E' => {
                if skipping {
                    continue;
                }
                fake.log.lock().unwrap().push((id, portal_sql.clone()));
                if in_txn && failed {
                    error_response(
                        &mut out,
                        "25P02",
                        "current transaction is aborted, commands ignored until end of transaction block",
                    );
                    skipping = true;
                    continue;
                }
                let delay = fake.delay_for(&portal_sql);
                let cancelled = if delay.is_zero() {
                    false
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        _ = fake.cancel.notified() => true,
                    }
                };
                if cancelled {
                    error_response(&mut out, "57014", "canceling statement due to user request");
                    if in_txn {
                        failed = true;
                    }
                    skipping = true;
                    continue;
                }
                match fake.respond_to(&portal_sql) {
                    Response::Rows { rows, tag, .. } => {
                        for row in &rows {
                            data_row(&mut out, row);
                        }
                        command_complete(&mut out, tag);
                    }
                    Response::Error { code, message } => {
                        error_response(&mut out, code, message);
                        if in_txn {
                            failed = true;
                        }
                        skipping = true;
                    }
                }
            }
            b'S' => {
                skipping = false;
                ready_for_query(&mut out, in_txn, failed);
                conn.send(&mut out).await;
            }
            b'Q' => {
                let sql = get_cstr(&mut body);
                fake.log.lock().unwrap().push((id, sql.clone()));
                match sql.to_uppercase().as_str() {
                    "BEGIN" => {
                        in_txn = true;
                        failed = false;
                        command_complete(&mut out, "BEGIN");
                    }
                    "COMMIT" => {
                        in_txn = false;
                        failed = false;
                        command_complete(&mut out, "COMMIT");
                    }
                    "ROLLBACK" => {
                        in_txn = false;
                        failed = false;
                        command_complete(&mut out, "ROLLBACK");
                    }
                    _ => command_complete(&mut out, "SELECT 0"),
                }
                ready_for_query(&mut out, in_txn, failed);
                conn.send(&mut out).await;
            }
            b'X' => return,
            b'p' => {} // no password expected; authentication is trusted
            other => panic!("fake backend got unexpected message {:?}", other as char),
        }
    }
}
