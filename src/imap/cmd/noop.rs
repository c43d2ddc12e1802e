//! Implementation of the `NOOP` command.
use super::{SessionCtx, Status, Step};
use crate::imap::parser::ImapParser;
use crate::Result;

/// Does nothing, successfully. Clients use it to poll and to reset the
/// inactivity deadline.
#[derive(Debug, Default)]
pub(crate) struct NoopCmd;

impl NoopCmd {
    pub(crate) fn parse(_parser: &mut ImapParser) -> Result<Self> {
        Ok(Self)
    }

    pub(crate) fn execute(
        &mut self,
        _out: &mut Vec<String>,
        _ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        Ok(Step::Done(Status::Ok, "NOOP completed".to_string()))
    }
}
