//! Implementation of the `CAPABILITY` command.
use super::{SessionCtx, Status, Step, CAPABILITIES};
use crate::imap::parser::ImapParser;
use crate::Result;

/// Reports the advertised capability set. Valid in every state.
#[derive(Debug, Default)]
pub(crate) struct CapabilityCmd;

impl CapabilityCmd {
    pub(crate) fn parse(_parser: &mut ImapParser) -> Result<Self> {
        Ok(Self)
    }

    pub(crate) fn execute(
        &mut self,
        out: &mut Vec<String>,
        _ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        out.push(format!("* CAPABILITY {CAPABILITIES}"));
        Ok(Step::Done(Status::Ok, "CAPABILITY completed".to_string()))
    }
}
