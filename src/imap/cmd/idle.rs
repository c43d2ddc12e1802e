//! Implementation of the `IDLE` command (RFC 2177).
use super::{SessionCtx, Status, Step};
use crate::imap::parser::ImapParser;
use crate::Result;
use tracing::debug;

/// Puts the connection into idle mode.
///
/// IDLE reserves the input stream: the dispatcher stops parsing tags and
/// feeds raw lines here until the client sends `DONE`. The reservation is
/// always released before the command finishes.
#[derive(Debug, Default)]
pub(crate) struct IdleCmd {
    started: bool,
    done: bool,
    /// The terminating line was something other than DONE.
    bad: bool,
}

impl IdleCmd {
    pub(crate) fn parse(_parser: &mut ImapParser) -> Result<Self> {
        Ok(Self::default())
    }

    pub(crate) fn ready(&self) -> bool {
        self.done
    }

    pub(crate) fn execute(
        &mut self,
        id: u64,
        _out: &mut Vec<String>,
        ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        if !self.started {
            self.started = true;
            ctx.continuation("idling");
            *ctx.grabber = Some(id);
            *ctx.idling = true;
            debug!("entered idle mode");
            return Ok(Step::Wait);
        }

        *ctx.idling = false;
        debug!("left idle mode");
        if self.bad {
            Ok(Step::Done(Status::Bad, "expected DONE".to_string()))
        } else {
            Ok(Step::Done(Status::Ok, "IDLE terminated".to_string()))
        }
    }

    pub(crate) fn feed_line(&mut self, line: &[u8], ctx: &mut SessionCtx<'_>) {
        self.done = true;
        self.bad = !line.eq_ignore_ascii_case(b"DONE");
        *ctx.grabber = None;
    }
}
