//! Implementation of the `LOGIN` command.
use super::{SessionCtx, SessionState, Status, Step};
use crate::db::Query;
use crate::imap::parser::ImapParser;
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Plaintext authentication against the users table.
///
/// The first execution pass submits the lookup query and suspends; the
/// second inspects the result.
#[derive(Debug)]
pub(crate) struct LoginCmd {
    user: String,
    password: String,
    query: Option<Arc<Query>>,
}

impl LoginCmd {
    pub(crate) fn parse(parser: &mut ImapParser) -> Result<Self> {
        parser.space()?;
        let user = String::from_utf8(parser.astring()?.to_vec())?;
        parser.space()?;
        let password = String::from_utf8(parser.astring()?.to_vec())?;
        Ok(Self {
            user,
            password,
            query: None,
        })
    }

    pub(crate) fn ready(&self) -> bool {
        self.query.as_ref().map(|q| q.done()).unwrap_or(true)
    }

    pub(crate) fn execute(
        &mut self,
        _out: &mut Vec<String>,
        ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        let Some(query) = &self.query else {
            let query = Arc::new(Query::with_submitter(
                "select id, login from users where login=$1 and secret=$2",
                ctx.wake.clone(),
            ));
            query.bind(1, self.user.as_str())?;
            query.bind(2, self.password.as_str())?;
            ctx.pool.submit(&query);
            self.query = Some(query);
            return Ok(Step::Wait);
        };

        if query.failed() {
            return Ok(Step::Done(
                Status::No,
                format!("LOGIN failed: {}", query.error().unwrap_or_default()),
            ));
        }
        match query.next_row() {
            Some(_) => {
                info!(user = %self.user, "logged in");
                *ctx.login = Some(self.user.clone());
                *ctx.state = SessionState::Authenticated;
                Ok(Step::Done(Status::Ok, "LOGIN completed".to_string()))
            }
            None => Ok(Step::Done(Status::No, "LOGIN failed".to_string())),
        }
    }
}
