//! IMAP commands.
//!
//! Each verb lives in its own module; [`Command::create`] is the registry
//! that maps a lower-cased verb to its parser. A command executes as a
//! little state machine: `execute` is re-entered after every event batch
//! and either finishes with a tagged status or asks to wait for a query it
//! submitted.

use crate::db::Pool;
use crate::imap::parser::ImapParser;
use crate::{Error, Result};
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub mod authenticate;
pub mod capability;
pub mod close;
pub mod enable;
pub mod fetch;
pub mod idle;
pub mod login;
pub mod logout;
pub mod noop;
pub mod select;
pub mod store;

pub(crate) use authenticate::AuthenticateCmd;
pub(crate) use capability::CapabilityCmd;
pub(crate) use close::{CloseCmd, UnselectCmd};
pub(crate) use enable::EnableCmd;
pub(crate) use fetch::FetchCmd;
pub(crate) use idle::IdleCmd;
pub(crate) use login::LoginCmd;
pub(crate) use logout::LogoutCmd;
pub(crate) use noop::NoopCmd;
pub(crate) use select::SelectCmd;
pub(crate) use store::StoreCmd;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// What the server advertises, in the greeting and to CAPABILITY.
pub const CAPABILITIES: &str = "IMAP4rev1 ENABLE IDLE CONDSTORE LIST-EXTENDED LITERAL+ AUTH=PLAIN";

/// RFC 3501 session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandState {
    /// Admitted but not allowed to run concurrently with what's in flight.
    Blocked,
    Executing,
    /// Suspended on a query; resumed when its notification arrives.
    Waiting,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Ok,
    No,
    Bad,
}

impl Status {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        }
    }
}

/// Outcome of one `execute` pass.
pub(crate) enum Step {
    /// Suspend; a query notification will resume the command.
    Wait,
    /// Finish with this tagged completion.
    Done(Status, String),
}

/// The selected mailbox.
#[derive(Debug, Clone)]
pub(crate) struct Mailbox {
    pub name: String,
    pub id: i64,
    pub uidvalidity: i64,
    pub uidnext: i64,
    pub exists: i64,
    pub read_only: bool,
}

/// The slice of session state handlers are allowed to touch.
pub(crate) struct SessionCtx<'a> {
    pub state: &'a mut SessionState,
    pub mailbox: &'a mut Option<Mailbox>,
    pub login: &'a mut Option<String>,
    pub idling: &'a mut bool,
    /// Id of the command currently reserving the input stream.
    pub grabber: &'a mut Option<u64>,
    pub pool: &'a Pool,
    pub wake: &'a Arc<Notify>,
    /// The connection's write buffer, for continuation requests that must
    /// not wait for command completion.
    pub output: &'a mut BytesMut,
}

impl SessionCtx<'_> {
    /// Sends a `+ text` continuation immediately.
    pub(crate) fn continuation(&mut self, text: &str) {
        self.output.extend_from_slice(b"+ ");
        self.output.extend_from_slice(text.as_bytes());
        self.output.extend_from_slice(b"\r\n");
    }
}

#[derive(Debug)]
enum Handler {
    Capability(CapabilityCmd),
    Noop(NoopCmd),
    Login(LoginCmd),
    Authenticate(AuthenticateCmd),
    Logout(LogoutCmd),
    Select(SelectCmd),
    Close(CloseCmd),
    Unselect(UnselectCmd),
    Fetch(FetchCmd),
    Store(StoreCmd),
    Enable(EnableCmd),
    Idle(IdleCmd),
}

/// One IMAP command in flight.
#[derive(Debug)]
pub(crate) struct Command {
    pub tag: String,
    pub verb: String,
    pub id: u64,
    pub state: CommandState,
    /// Commands sharing a non-zero group may execute concurrently within a
    /// session; group 0 commands run alone.
    pub group: u32,
    /// Untagged response lines, flushed in command order on completion.
    pub responses: Vec<String>,
    pub completion: Option<(Status, String)>,
    /// Set once the state check has run, on first execution.
    pub state_checked: bool,
    handler: Handler,
}

impl Command {
    /// The verb registry: parses the arguments for a known verb or reports
    /// it unknown.
    pub(crate) fn create(tag: String, verb: String, parser: &mut ImapParser) -> Result<Command> {
        let handler = match verb.to_lowercase().as_str() {
            "capability" => Handler::Capability(CapabilityCmd::parse(parser)?),
            "noop" => Handler::Noop(NoopCmd::parse(parser)?),
            "login" => Handler::Login(LoginCmd::parse(parser)?),
            "authenticate" => Handler::Authenticate(AuthenticateCmd::parse(parser)?),
            "logout" => Handler::Logout(LogoutCmd::parse(parser)?),
            "select" => Handler::Select(SelectCmd::parse(parser, false)?),
            "examine" => Handler::Select(SelectCmd::parse(parser, true)?),
            "close" => Handler::Close(CloseCmd::parse(parser)?),
            "unselect" => Handler::Unselect(UnselectCmd::parse(parser)?),
            "fetch" => Handler::Fetch(FetchCmd::parse(parser)?),
            "uid fetch" => Handler::Fetch(FetchCmd::parse(parser)?),
            "store" => Handler::Store(StoreCmd::parse(parser)?),
            "uid store" => Handler::Store(StoreCmd::parse(parser)?),
            "enable" => Handler::Enable(EnableCmd::parse(parser)?),
            "idle" => Handler::Idle(IdleCmd::parse(parser)?),
            _ => return Err(Error::UnknownCommand(verb)),
        };
        parser.end()?;

        let group = match &handler {
            Handler::Fetch(_) | Handler::Store(_) => 1,
            _ => 0,
        };
        Ok(Command {
            tag,
            verb,
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            state: CommandState::Executing,
            group,
            responses: Vec::new(),
            completion: None,
            state_checked: false,
            handler,
        })
    }

    /// The session states this command may run in.
    pub(crate) fn valid_in(&self, state: SessionState) -> bool {
        use SessionState::*;
        match &self.handler {
            Handler::Capability(_) | Handler::Noop(_) | Handler::Logout(_) => true,
            Handler::Login(_) | Handler::Authenticate(_) => state == NotAuthenticated,
            Handler::Select(_) | Handler::Enable(_) => {
                matches!(state, Authenticated | Selected)
            }
            Handler::Idle(_) => matches!(state, Authenticated | Selected),
            Handler::Close(_) | Handler::Unselect(_) | Handler::Fetch(_) | Handler::Store(_) => {
                state == Selected
            }
        }
    }

    /// Whether a Waiting command can be promoted back to Executing.
    pub(crate) fn ready(&self) -> bool {
        match &self.handler {
            Handler::Login(c) => c.ready(),
            Handler::Authenticate(c) => c.ready(),
            Handler::Select(c) => c.ready(),
            Handler::Fetch(c) => c.ready(),
            Handler::Store(c) => c.ready(),
            Handler::Idle(c) => c.ready(),
            _ => true,
        }
    }

    /// One execution pass. Errors become a tagged BAD.
    pub(crate) fn execute(&mut self, ctx: &mut SessionCtx<'_>) -> Result<Step> {
        let id = self.id;
        let out = &mut self.responses;
        match &mut self.handler {
            Handler::Capability(c) => c.execute(out, ctx),
            Handler::Noop(c) => c.execute(out, ctx),
            Handler::Login(c) => c.execute(out, ctx),
            Handler::Authenticate(c) => c.execute(id, out, ctx),
            Handler::Logout(c) => c.execute(out, ctx),
            Handler::Select(c) => c.execute(out, ctx),
            Handler::Close(c) => c.execute(out, ctx),
            Handler::Unselect(c) => c.execute(out, ctx),
            Handler::Fetch(c) => c.execute(out, ctx),
            Handler::Store(c) => c.execute(out, ctx),
            Handler::Enable(c) => c.execute(out, ctx),
            Handler::Idle(c) => c.execute(id, out, ctx),
        }
    }

    /// Feeds a line of reserved input to the command that grabbed the
    /// stream.
    pub(crate) fn feed_line(&mut self, line: &[u8], ctx: &mut SessionCtx<'_>) {
        match &mut self.handler {
            Handler::Idle(c) => c.feed_line(line, ctx),
            Handler::Authenticate(c) => c.feed_line(line, ctx),
            _ => {}
        }
    }
}
