//! Implementation of the `STORE` command.
use super::{SessionCtx, Status, Step};
use crate::db::Query;
use crate::imap::parser::ImapParser;
use crate::Result;
use std::sync::Arc;

/// Updates message flags over a uid range. `\Seen` is the one flag this
/// server stores per message column; STORE shares command group 1 with
/// FETCH.
#[derive(Debug)]
pub(crate) struct StoreCmd {
    first: u32,
    last: u32,
    /// `+FLAGS`, `-FLAGS` or `FLAGS`, with or without `.SILENT`.
    item: String,
    flags: String,
    query: Option<Arc<Query>>,
}

impl StoreCmd {
    pub(crate) fn parse(parser: &mut ImapParser) -> Result<Self> {
        parser.space()?;
        let (first, last) = parser.sequence_set()?;
        parser.space()?;
        let item = parser.atom()?;
        parser.space()?;
        let flags = parser.rest();
        Ok(Self {
            first,
            last,
            item,
            flags,
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
            let Some(mailbox) = ctx.mailbox.as_ref() else {
                return Ok(Step::Done(Status::Bad, "no mailbox selected".to_string()));
            };
            if mailbox.read_only {
                return Ok(Step::Done(Status::No, "mailbox is read-only".to_string()));
            }
            let item = self.item.to_lowercase();
            let item = item.strip_suffix(".silent").unwrap_or(&item);
            if !self.flags.to_lowercase().contains("\\seen") {
                return Ok(Step::Done(
                    Status::No,
                    "only the \\Seen flag is supported".to_string(),
                ));
            }
            let seen = match item {
                "flags" | "+flags" => true,
                "-flags" => false,
                _ => {
                    return Ok(Step::Done(
                        Status::Bad,
                        format!("unknown data item {}", self.item),
                    ))
                }
            };

            let query = Arc::new(Query::with_submitter(
                "update messages set seen=$1 where mailbox=$2 and uid>=$3 and uid<=$4",
                ctx.wake.clone(),
            ));
            query.bind(1, seen)?;
            query.bind(2, mailbox.id)?;
            query.bind(3, i64::from(self.first))?;
            query.bind(4, i64::from(self.last))?;
            ctx.pool.submit(&query);
            self.query = Some(query);
            return Ok(Step::Wait);
        };

        if query.failed() {
            return Ok(Step::Done(
                Status::No,
                format!("STORE failed: {}", query.error().unwrap_or_default()),
            ));
        }
        Ok(Step::Done(Status::Ok, "STORE completed".to_string()))
    }
}
