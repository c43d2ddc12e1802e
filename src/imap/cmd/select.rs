//! Implementation of the `SELECT` and `EXAMINE` commands.
use super::{Mailbox, SessionCtx, SessionState, Status, Step};
use crate::db::Query;
use crate::imap::parser::ImapParser;
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Selects a mailbox. EXAMINE is SELECT without write access.
///
/// A failed SELECT leaves the session with no mailbox selected, per RFC
/// 3501 section 6.3.1.
#[derive(Debug)]
pub(crate) struct SelectCmd {
    name: String,
    read_only: bool,
    query: Option<Arc<Query>>,
}

impl SelectCmd {
    pub(crate) fn parse(parser: &mut ImapParser, read_only: bool) -> Result<Self> {
        parser.space()?;
        let mut name = String::from_utf8(parser.astring()?.to_vec())?;
        // the one case-insensitive mailbox name
        if name.eq_ignore_ascii_case("inbox") {
            name = "INBOX".to_string();
        }
        Ok(Self {
            name,
            read_only,
            query: None,
        })
    }

    pub(crate) fn ready(&self) -> bool {
        self.query.as_ref().map(|q| q.done()).unwrap_or(true)
    }

    fn completed(&self) -> String {
        if self.read_only {
            "[READ-ONLY] EXAMINE completed".to_string()
        } else {
            "[READ-WRITE] SELECT completed".to_string()
        }
    }

    pub(crate) fn execute(
        &mut self,
        out: &mut Vec<String>,
        ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        let Some(query) = &self.query else {
            let query = Arc::new(Query::with_submitter(
                "select m.id, m.uidvalidity, m.uidnext, \
                 (select count(*) from messages where mailbox=m.id) as messages \
                 from mailboxes m where m.name=$1 and not m.deleted",
                ctx.wake.clone(),
            ));
            query.bind(1, self.name.as_str())?;
            ctx.pool.submit(&query);
            self.query = Some(query);
            return Ok(Step::Wait);
        };

        // whatever happens next, the old selection is gone
        *ctx.mailbox = None;
        *ctx.state = SessionState::Authenticated;

        if query.failed() {
            return Ok(Step::Done(
                Status::No,
                format!("SELECT failed: {}", query.error().unwrap_or_default()),
            ));
        }
        let Some(row) = query.next_row() else {
            return Ok(Step::Done(Status::No, "no such mailbox".to_string()));
        };

        let mailbox = Mailbox {
            name: self.name.clone(),
            id: row.get_int("id").unwrap_or(0),
            uidvalidity: row.get_int("uidvalidity").unwrap_or(1),
            uidnext: row.get_int("uidnext").unwrap_or(1),
            exists: row.get_int("messages").unwrap_or(0),
            read_only: self.read_only,
        };
        info!(mailbox = %mailbox.name, "mailbox selected");

        out.push(format!("* {} EXISTS", mailbox.exists));
        out.push("* 0 RECENT".to_string());
        out.push("* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)".to_string());
        out.push(format!(
            "* OK [UIDVALIDITY {}] uid validity",
            mailbox.uidvalidity
        ));
        out.push(format!("* OK [UIDNEXT {}] predicted next uid", mailbox.uidnext));

        *ctx.mailbox = Some(mailbox);
        *ctx.state = SessionState::Selected;
        Ok(Step::Done(Status::Ok, self.completed()))
    }
}
