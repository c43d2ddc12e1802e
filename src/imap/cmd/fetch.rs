//! Implementation of the `FETCH` command.
use super::{SessionCtx, Status, Step};
use crate::db::Query;
use crate::imap::parser::ImapParser;
use crate::Result;
use std::sync::Arc;
use tracing::debug;

/// Fetches message data for a uid range.
///
/// Messages are addressed by uid; flags and the uid itself are the data
/// items this server serves, whatever mix the client asked for. FETCH runs
/// in command group 1, so pipelined fetches execute concurrently.
#[derive(Debug)]
pub(crate) struct FetchCmd {
    first: u32,
    last: u32,
    items: String,
    query: Option<Arc<Query>>,
}

impl FetchCmd {
    pub(crate) fn parse(parser: &mut ImapParser) -> Result<Self> {
        parser.space()?;
        let (first, last) = parser.sequence_set()?;
        parser.space()?;
        let items = parser.rest();
        Ok(Self {
            first,
            last,
            items,
            query: None,
        })
    }

    pub(crate) fn ready(&self) -> bool {
        self.query.as_ref().map(|q| q.done()).unwrap_or(true)
    }

    pub(crate) fn execute(
        &mut self,
        out: &mut Vec<String>,
        ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        let Some(query) = &self.query else {
            let Some(mailbox) = ctx.mailbox.as_ref() else {
                return Ok(Step::Done(Status::Bad, "no mailbox selected".to_string()));
            };
            debug!(items = %self.items, first = self.first, last = self.last, "fetch");
            let query = Arc::new(Query::with_submitter(
                "select uid, seen, deleted, flagged, answered, draft \
                 from messages where mailbox=$1 and uid>=$2 and uid<=$3 \
                 order by uid",
                ctx.wake.clone(),
            ));
            query.bind(1, mailbox.id)?;
            query.bind(2, i64::from(self.first))?;
            query.bind(3, i64::from(self.last))?;
            ctx.pool.submit(&query);
            self.query = Some(query);
            return Ok(Step::Wait);
        };

        if query.failed() {
            return Ok(Step::Done(
                Status::No,
                format!("FETCH failed: {}", query.error().unwrap_or_default()),
            ));
        }

        let mut seq = 0;
        while let Some(row) = query.next_row() {
            seq += 1;
            let uid = row.get_int("uid").unwrap_or(0);
            let mut flags = Vec::new();
            for (column, flag) in [
                ("seen", "\\Seen"),
                ("deleted", "\\Deleted"),
                ("flagged", "\\Flagged"),
                ("answered", "\\Answered"),
                ("draft", "\\Draft"),
            ] {
                if row.get_bool(column) == Some(true) {
                    flags.push(flag);
                }
            }
            out.push(format!(
                "* {} FETCH (UID {} FLAGS ({}))",
                seq,
                uid,
                flags.join(" ")
            ));
        }
        Ok(Step::Done(Status::Ok, "FETCH completed".to_string()))
    }
}
