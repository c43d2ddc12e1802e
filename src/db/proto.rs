//! Framing for the PostgreSQL extended-query protocol.
//!
//! Frontend messages are appended to a write buffer by the `write_*`
//! functions; backend messages are parsed out of a read buffer with the
//! usual check-then-parse pair, where [`Error::IncompleteMessage`] signals
//! that more bytes are needed.
//!
//! See: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use std::io::Cursor;

/// Protocol version 3.0.
const PROTOCOL_VERSION: i32 = 196_608;
/// Magic "version" of a CancelRequest packet.
const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// One column of a result set, as described by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Oid of the column's type, used to pick a decoder.
    pub oid: u32,
}

/// Backend transaction status carried on every ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`: not in a transaction block.
    Idle,
    /// `T`: inside a transaction block.
    InTransaction,
    /// `E`: inside a failed transaction block; statements are rejected
    /// until the block ends.
    Failed,
}

/// An authentication request from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    /// Any mechanism this server does not negotiate.
    Other(i32),
}

/// A parsed backend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Authentication(Auth),
    ParameterStatus { name: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<Column>),
    /// One row; `None` entries are SQL NULL.
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    ErrorResponse { code: String, message: String },
    NoticeResponse(String),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    EmptyQueryResponse,
    PortalSuspended,
    /// Anything else; the payload is skipped.
    Unknown(u8),
}

impl BackendMessage {
    /// Checks whether a whole message is buffered, advancing the cursor
    /// past it.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<()> {
        if src.remaining() < 5 {
            return Err(Error::IncompleteMessage);
        }
        src.advance(1);
        let len = src.get_i32();
        if len < 4 {
            return Err(Error::Protocol(format!("invalid message length {len}")));
        }
        let body = len as usize - 4;
        if src.remaining() < body {
            return Err(Error::IncompleteMessage);
        }
        src.advance(body);
        Ok(())
    }

    /// Parses one message. The caller has already run [`check`](Self::check),
    /// so the bytes are known to be complete.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<BackendMessage> {
        let tag = src.get_u8();
        let len = src.get_i32() as usize - 4;
        let start = src.position() as usize;
        let message = {
            let mut body = Cursor::new(&src.get_ref()[start..start + len]);
            Self::parse_body(tag, &mut body)?
        };
        src.set_position((start + len) as u64);
        Ok(message)
    }

    fn parse_body(tag: u8, body: &mut Cursor<&[u8]>) -> Result<BackendMessage> {
        let message = match tag {
            b'R' => {
                let code = body.get_i32();
                let auth = match code {
                    0 => Auth::Ok,
                    3 => Auth::CleartextPassword,
                    5 => {
                        let mut salt = [0u8; 4];
                        body.copy_to_slice(&mut salt);
                        Auth::Md5Password { salt }
                    }
                    other => Auth::Other(other),
                };
                BackendMessage::Authentication(auth)
            }
            b'S' => BackendMessage::ParameterStatus {
                name: get_cstr(body)?,
                value: get_cstr(body)?,
            },
            b'K' => BackendMessage::BackendKeyData {
                pid: body.get_i32(),
                secret: body.get_i32(),
            },
            b'Z' => {
                let status = match body.get_u8() {
                    b'I' => TransactionStatus::Idle,
                    b'T' => TransactionStatus::InTransaction,
                    b'E' => TransactionStatus::Failed,
                    other => {
                        return Err(Error::Protocol(format!(
                            "invalid transaction status `{}`",
                            other as char
                        )))
                    }
                };
                BackendMessage::ReadyForQuery(status)
            }
            b'T' => {
                let n = body.get_i16();
                let mut columns = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let name = get_cstr(body)?;
                    body.advance(6); // table oid + attribute number
                    let oid = body.get_u32();
                    body.advance(8); // type size + modifier + format code
                    columns.push(Column { name, oid });
                }
                BackendMessage::RowDescription(columns)
            }
            b'D' => {
                let n = body.get_i16();
                let mut values = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let len = body.get_i32();
                    if len < 0 {
                        values.push(None);
                    } else {
                        let len = len as usize;
                        values.push(Some(Bytes::copy_from_slice(&body.chunk()[..len])));
                        body.advance(len);
                    }
                }
                BackendMessage::DataRow(values)
            }
            b'C' => BackendMessage::CommandComplete(get_cstr(body)?),
            b'E' => {
                let (code, message) = get_error_fields(body)?;
                BackendMessage::ErrorResponse { code, message }
            }
            b'N' => {
                let (_, message) = get_error_fields(body)?;
                BackendMessage::NoticeResponse(message)
            }
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'n' => BackendMessage::NoData,
            b'I' => BackendMessage::EmptyQueryResponse,
            b's' => BackendMessage::PortalSuspended,
            other => BackendMessage::Unknown(other),
        };
        Ok(message)
    }
}

/// Reads a NUL-terminated string.
fn get_cstr(src: &mut Cursor<&[u8]>) -> Result<String> {
    let nul = src
        .chunk()
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("unterminated string".to_string()))?;
    let s = String::from_utf8(src.chunk()[..nul].to_vec())?;
    src.advance(nul + 1);
    Ok(s)
}

/// Extracts the SQLSTATE code and human-readable message from an
/// ErrorResponse/NoticeResponse field list.
fn get_error_fields(src: &mut Cursor<&[u8]>) -> Result<(String, String)> {
    let mut code = String::new();
    let mut message = String::new();
    loop {
        let field = src.get_u8();
        if field == 0 {
            break;
        }
        let value = get_cstr(src)?;
        match field {
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    Ok((code, message))
}

fn put_cstr(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Appends a typed message: tag byte, length, then `body(dst)`.
fn put_message(dst: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    dst.put_u8(tag);
    let at = dst.len();
    dst.put_i32(0);
    body(dst);
    let len = (dst.len() - at) as i32;
    dst[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

/// The startup packet. Untagged, unlike every other frontend message.
pub fn write_startup(dst: &mut BytesMut, user: &str, database: &str) {
    let at = dst.len();
    dst.put_i32(0);
    dst.put_i32(PROTOCOL_VERSION);
    for (k, v) in [
        ("user", user),
        ("database", database),
        ("client_encoding", "UTF8"),
    ] {
        put_cstr(dst, k);
        put_cstr(dst, v);
    }
    dst.put_u8(0);
    let len = (dst.len() - at) as i32;
    dst[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

pub fn write_password(dst: &mut BytesMut, password: &str) {
    put_message(dst, b'p', |b| put_cstr(b, password));
}

/// The `md5...` digest for an MD5 authentication request:
/// `md5(md5(password ++ user) ++ salt)` in lowercase hex.
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

pub fn write_parse(dst: &mut BytesMut, statement: &str, sql: &str) {
    put_message(dst, b'P', |b| {
        put_cstr(b, statement);
        put_cstr(b, sql);
        b.put_i16(0); // no pre-declared parameter types
    });
}

/// Binds the unnamed portal to `statement`. Each parameter is a
/// `(format, value)` pair where format 0 is text and 1 binary; `None`
/// values are SQL NULL. Results are requested in text format.
pub fn write_bind(dst: &mut BytesMut, statement: &str, params: &[(i16, Option<Bytes>)]) {
    put_message(dst, b'B', |b| {
        put_cstr(b, ""); // unnamed portal
        put_cstr(b, statement);
        b.put_i16(params.len() as i16);
        for (format, _) in params {
            b.put_i16(*format);
        }
        b.put_i16(params.len() as i16);
        for (_, value) in params {
            match value {
                None => b.put_i32(-1),
                Some(v) => {
                    b.put_i32(v.len() as i32);
                    b.put_slice(v);
                }
            }
        }
        b.put_i16(1);
        b.put_i16(0); // all result columns in text format
    });
}

pub fn write_describe_portal(dst: &mut BytesMut) {
    put_message(dst, b'D', |b| {
        b.put_u8(b'P');
        put_cstr(b, "");
    });
}

pub fn write_execute(dst: &mut BytesMut) {
    put_message(dst, b'E', |b| {
        put_cstr(b, ""); // unnamed portal
        b.put_i32(0); // no row limit
    });
}

pub fn write_sync(dst: &mut BytesMut) {
    put_message(dst, b'S', |_| {});
}

/// A simple-protocol query, used for statements without parameters or
/// result rows worth preparing: BEGIN, COMMIT, ROLLBACK.
pub fn write_query(dst: &mut BytesMut, sql: &str) {
    put_message(dst, b'Q', |b| put_cstr(b, sql));
}

pub fn write_terminate(dst: &mut BytesMut) {
    put_message(dst, b'X', |_| {});
}

/// The out-of-band cancellation packet, sent on a fresh connection.
pub fn write_cancel_request(dst: &mut BytesMut, pid: i32, secret: i32) {
    dst.put_i32(16);
    dst.put_i32(CANCEL_REQUEST_CODE);
    dst.put_i32(pid);
    dst.put_i32(secret);
}
