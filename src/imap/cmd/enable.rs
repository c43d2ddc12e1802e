//! Implementation of the `ENABLE` command (RFC 5161).
use super::{SessionCtx, Status, Step};
use crate::imap::parser::ImapParser;
use crate::Result;

/// Extensions a client can turn on. Unknown names are ignored, as the RFC
/// requires; only the enabled ones are echoed back.
const KNOWN: &[&str] = &["CONDSTORE"];

#[derive(Debug)]
pub(crate) struct EnableCmd {
    capabilities: Vec<String>,
}

impl EnableCmd {
    pub(crate) fn parse(parser: &mut ImapParser) -> Result<Self> {
        parser.space()?;
        let mut capabilities = vec![parser.atom()?];
        while parser.opt_space() {
            capabilities.push(parser.atom()?);
        }
        Ok(Self { capabilities })
    }

    pub(crate) fn execute(
        &mut self,
        out: &mut Vec<String>,
        _ctx: &mut SessionCtx<'_>,
    ) -> Result<Step> {
        let enabled: Vec<&str> = self
            .capabilities
            .iter()
            .filter_map(|c| {
                KNOWN
                    .iter()
                    .find(|k| k.eq_ignore_ascii_case(c))
                    .copied()
            })
            .collect();
        if !enabled.is_empty() {
            out.push(format!("* ENABLED {}", enabled.join(" ")));
        }
        Ok(Step::Done(Status::Ok, "ENABLE completed".to_string()))
    }
}
