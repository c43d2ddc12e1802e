//! Implementation of the `AUTHENTICATE` command.
use super::{SessionCtx, SessionState, Status, Step};
use crate::db::Query;
use crate::imap::parser::ImapParser;
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::sync::Arc;
use tracing::info;

/// SASL authentication; PLAIN is the one mechanism offered.
///
/// Without an initial response the command reserves the input stream,
/// sends an empty challenge and waits for the client's base64 line. A `*`
/// line aborts the exchange.
#[derive(Debug)]
pub(crate) struct AuthenticateCmd {
    mechanism: String,
    /// SASL-IR initial response, consumed on first execution.
    initial: Option<String>,
    credentials: Option<(String, String)>,
    challenged: bool,
    aborted: bool,
    query: Option<Arc<Query>>,
    user: Option<String>,
}

impl AuthenticateCmd {
    pub(crate) fn parse(parser: &mut ImapParser) -> Result<Self> {
        parser.space()?;
        let mechanism = parser.atom()?;
        let initial = if parser.opt_space() {
            Some(parser.rest())
        } else {
            None
        };
        Ok(Self {
            mechanism,
            initial,
            credentials: None,
            challenged: false,
            aborted: false,
            query: None,
            user: None,
        })
    }

    pub(crate) fn ready(&self) -> bool {
        if let Some(query) = &self.query {
            return query.done();
        }
        self.credentials.is_some() || self.aborted
    }

    pub(crate) fn execute(
        &mut self,
        id: u64,
        _out: &mut Vec<String>,
        ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        if !self.mechanism.eq_ignore_ascii_case("plain") {
            return Ok(Step::Done(
                Status::No,
                "unsupported authentication mechanism".to_string(),
            ));
        }
        if self.aborted {
            return Ok(Step::Done(
                Status::Bad,
                "AUTHENTICATE cancelled".to_string(),
            ));
        }

        if let Some(query) = &self.query {
            if query.failed() {
                return Ok(Step::Done(
                    Status::No,
                    format!("AUTHENTICATE failed: {}", query.error().unwrap_or_default()),
                ));
            }
            return match query.next_row() {
                Some(_) => {
                    let user = self.user.clone().unwrap_or_default();
                    info!(user = %user, "authenticated");
                    *ctx.login = Some(user);
                    *ctx.state = SessionState::Authenticated;
                    Ok(Step::Done(Status::Ok, "AUTHENTICATE completed".to_string()))
                }
                None => Ok(Step::Done(Status::No, "AUTHENTICATE failed".to_string())),
            };
        }

        if self.credentials.is_none() {
            if let Some(initial) = self.initial.take() {
                self.credentials = Some(decode_plain(initial.as_bytes())?);
            } else if !self.challenged {
                self.challenged = true;
                ctx.continuation("");
                *ctx.grabber = Some(id);
                return Ok(Step::Wait);
            } else {
                return Ok(Step::Done(
                    Status::Bad,
                    "AUTHENTICATE cancelled".to_string(),
                ));
            }
        }

        let (user, password) = self.credentials.clone().unwrap_or_default();
        let query = Arc::new(Query::with_submitter(
            "select id, login from users where login=$1 and secret=$2",
            ctx.wake.clone(),
        ));
        query.bind(1, user.as_str())?;
        query.bind(2, password.as_str())?;
        ctx.pool.submit(&query);
        self.user = Some(user);
        self.query = Some(query);
        Ok(Step::Wait)
    }

    pub(crate) fn feed_line(&mut self, line: &[u8], ctx: &mut SessionCtx<'_>) {
        *ctx.grabber = None;
        if line == b"*" {
            self.aborted = true;
            return;
        }
        match decode_plain(line) {
            Ok(credentials) => self.credentials = Some(credentials),
            Err(_) => self.aborted = true,
        }
    }
}

/// Decodes a SASL PLAIN response: base64 of `authzid NUL authcid NUL
/// password`.
fn decode_plain(line: &[u8]) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(line)
        .map_err(|e| Error::Protocol(format!("invalid base64: {e}")))?;
    let mut parts = decoded.split(|&b| b == 0);
    let _authzid = parts.next();
    let user = parts.next().ok_or_else(|| {
        Error::Protocol("malformed PLAIN response".to_string())
    })?;
    let password = parts.next().ok_or_else(|| {
        Error::Protocol("malformed PLAIN response".to_string())
    })?;
    Ok((
        String::from_utf8(user.to_vec())?,
        String::from_utf8(password.to_vec())?,
    ))
}
