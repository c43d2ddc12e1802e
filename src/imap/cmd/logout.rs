//! Implementation of the `LOGOUT` command.
use super::{SessionCtx, SessionState, Status, Step};
use crate::imap::parser::ImapParser;
use crate::Result;

/// Ends the session. The untagged BYE is required to precede the tagged OK.
#[derive(Debug, Default)]
pub(crate) struct LogoutCmd;

impl LogoutCmd {
    pub(crate) fn parse(_parser: &mut ImapParser) -> Result<Self> {
        Ok(Self)
    }

    pub(crate) fn execute(
        &mut self,
        out: &mut Vec<String>,
        ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        out.push("* BYE logging out".to_string());
        *ctx.state = SessionState::Logout;
        Ok(Step::Done(Status::Ok, "LOGOUT completed".to_string()))
    }
}
