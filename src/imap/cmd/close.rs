//! Implementation of the `CLOSE` and `UNSELECT` commands.
//!
//! Both return the session from Selected to Authenticated; message
//! expunging on CLOSE belongs to the storage layer.
use super::{SessionCtx, SessionState, Status, Step};
use crate::imap::parser::ImapParser;
use crate::Result;

#[derive(Debug, Default)]
pub(crate) struct CloseCmd;

impl CloseCmd {
    pub(crate) fn parse(_parser: &mut ImapParser) -> Result<Self> {
        Ok(Self)
    }

    pub(crate) fn execute(
        &mut self,
        _out: &mut Vec<String>,
        ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        *ctx.mailbox = None;
        *ctx.state = SessionState::Authenticated;
        Ok(Step::Done(Status::Ok, "CLOSE completed".to_string()))
    }
}

#[derive(Debug, Default)]
pub(crate) struct UnselectCmd;

impl UnselectCmd {
    pub(crate) fn parse(_parser: &mut ImapParser) -> Result<Self> {
        Ok(Self)
    }

    pub(crate) fn execute(
        &mut self,
        _out: &mut Vec<String>,
        ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        *ctx.mailbox = None;
        *ctx.state = SessionState::Authenticated;
        Ok(Step::Done(Status::Ok, "UNSELECT completed".to_string()))
    }
}
