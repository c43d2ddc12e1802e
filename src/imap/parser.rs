//! Token-level parsing of received IMAP commands.
//!
//! A command arrives as alternating line and literal segments: the line
//! `A001 LOGIN {5}` is followed by a 5-byte literal and then the rest of
//! the command on another line. The parser walks tokens across that
//! boundary, so handlers never notice literals.

use crate::{Error, Result};
use bytes::Bytes;

/// One received piece of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Line(String),
    Literal(Bytes),
}

#[derive(Debug)]
pub(crate) struct ImapParser {
    segments: Vec<Segment>,
    /// Index of the current segment; always a `Line` between calls.
    seg: usize,
    /// Byte position within the current line.
    pos: usize,
}

fn tag_char(c: u8) -> bool {
    c > b' ' && c < 0x7f && !matches!(c, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b'+')
}

fn atom_char(c: u8) -> bool {
    c > b' ' && c < 0x7f && !matches!(c, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b']')
}

impl ImapParser {
    pub(crate) fn new(segments: Vec<Segment>) -> ImapParser {
        ImapParser {
            segments,
            seg: 0,
            pos: 0,
        }
    }

    fn line(&self) -> &str {
        match self.segments.get(self.seg) {
            Some(Segment::Line(line)) => line,
            _ => "",
        }
    }

    fn rest_of_line(&self) -> &str {
        &self.line()[self.pos.min(self.line().len())..]
    }

    fn peek(&self) -> Option<u8> {
        self.rest_of_line().bytes().next()
    }

    /// True when the whole command has been consumed.
    pub(crate) fn at_end(&self) -> bool {
        self.seg + 1 >= self.segments.len() && self.rest_of_line().is_empty()
    }

    /// Fails unless every argument has been consumed.
    pub(crate) fn end(&self) -> Result<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "trailing arguments: {:?}",
                self.rest_of_line()
            )))
        }
    }

    fn take_while(&mut self, keep: impl Fn(u8) -> bool) -> String {
        let rest = self.rest_of_line();
        let len = rest.bytes().take_while(|&c| keep(c)).count();
        let token = rest[..len].to_string();
        self.pos += len;
        token
    }

    /// The command tag.
    pub(crate) fn tag(&mut self) -> Result<String> {
        let tag = self.take_while(tag_char);
        if tag.is_empty() {
            return Err(Error::Protocol("missing tag".to_string()));
        }
        Ok(tag)
    }

    /// The command name. `UID` is a prefix of the following name, so `UID
    /// FETCH` parses as one verb.
    pub(crate) fn verb(&mut self) -> Result<String> {
        let verb = self.take_while(atom_char);
        if verb.is_empty() {
            return Err(Error::Protocol("missing command".to_string()));
        }
        if verb.eq_ignore_ascii_case("uid") && self.peek() == Some(b' ') {
            self.pos += 1;
            let second = self.take_while(atom_char);
            if second.is_empty() {
                return Err(Error::Protocol("missing command after uid".to_string()));
            }
            return Ok(format!("{verb} {second}"));
        }
        Ok(verb)
    }

    /// One mandatory space.
    pub(crate) fn space(&mut self) -> Result<()> {
        if self.peek() == Some(b' ') {
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::Protocol("expected space".to_string()))
        }
    }

    /// Consumes a space if one is present.
    pub(crate) fn opt_space(&mut self) -> bool {
        if self.peek() == Some(b' ') {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn atom(&mut self) -> Result<String> {
        let atom = self.take_while(atom_char);
        if atom.is_empty() {
            return Err(Error::Protocol("expected atom".to_string()));
        }
        Ok(atom)
    }

    pub(crate) fn number(&mut self) -> Result<u32> {
        let digits = self.take_while(|c| c.is_ascii_digit());
        atoi::atoi(digits.as_bytes())
            .ok_or_else(|| Error::Protocol("expected number".to_string()))
    }

    /// An astring: an atom, a quoted string, or a literal.
    pub(crate) fn astring(&mut self) -> Result<Bytes> {
        match self.peek() {
            Some(b'"') => self.quoted(),
            Some(b'{') => self.literal(),
            Some(_) => Ok(Bytes::from(self.atom()?)),
            None => Err(Error::EndOfStream),
        }
    }

    fn quoted(&mut self) -> Result<Bytes> {
        let rest = self.rest_of_line().as_bytes();
        debug_assert_eq!(rest.first(), Some(&b'"'));
        let mut out = Vec::new();
        let mut i = 1;
        while i < rest.len() {
            match rest[i] {
                b'"' => {
                    self.pos += i + 1;
                    return Ok(Bytes::from(out));
                }
                b'\\' if i + 1 < rest.len() => {
                    out.push(rest[i + 1]);
                    i += 2;
                }
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        Err(Error::Protocol("unterminated quoted string".to_string()))
    }

    /// A `{N}` marker at the end of the line refers to the following
    /// literal segment; parsing continues on the line after it.
    fn literal(&mut self) -> Result<Bytes> {
        let marker = self.rest_of_line();
        let inner = marker
            .strip_prefix('{')
            .and_then(|m| m.strip_suffix('}'))
            .ok_or_else(|| Error::Protocol("malformed literal marker".to_string()))?;
        let digits = inner.strip_suffix('+').unwrap_or(inner);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Protocol("malformed literal marker".to_string()));
        }
        match self.segments.get(self.seg + 1) {
            Some(Segment::Literal(data)) => {
                let data = data.clone();
                self.seg += 2;
                self.pos = 0;
                Ok(data)
            }
            _ => Err(Error::Protocol("literal marker without literal".to_string())),
        }
    }

    /// A message sequence set of the form `n`, `n:m` or `n:*`. `*` maps to
    /// the largest possible uid.
    pub(crate) fn sequence_set(&mut self) -> Result<(u32, u32)> {
        let first = self.number()?;
        if self.peek() != Some(b':') {
            return Ok((first, first));
        }
        self.pos += 1;
        let last = if self.peek() == Some(b'*') {
            self.pos += 1;
            u32::MAX
        } else {
            self.number()?
        };
        Ok((first.min(last), first.max(last)))
    }

    /// The remainder of the current line, consumed verbatim.
    pub(crate) fn rest(&mut self) -> String {
        let rest = self.rest_of_line().to_string();
        self.pos = self.line().len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> Vec<Segment> {
        vec![Segment::Line(s.to_string())]
    }

    #[test]
    fn test_tag_verb_and_atoms() {
        let mut p = ImapParser::new(line("A001 SELECT INBOX"));
        assert_eq!(p.tag().unwrap(), "A001");
        p.space().unwrap();
        assert_eq!(p.verb().unwrap(), "SELECT");
        p.space().unwrap();
        assert_eq!(p.astring().unwrap(), Bytes::from("INBOX"));
        p.end().unwrap();
    }

    #[test]
    fn test_uid_prefixed_verb() {
        let mut p = ImapParser::new(line("t1 UID FETCH 1:* FLAGS"));
        p.tag().unwrap();
        p.space().unwrap();
        assert_eq!(p.verb().unwrap(), "UID FETCH");
        p.space().unwrap();
        assert_eq!(p.sequence_set().unwrap(), (1, u32::MAX));
        p.space().unwrap();
        assert_eq!(p.rest(), "FLAGS");
    }

    #[test]
    fn test_login_with_literal() {
        let mut p = ImapParser::new(vec![
            Segment::Line("A001 LOGIN {5}".to_string()),
            Segment::Literal(Bytes::from("ALICE")),
            Segment::Line(" pwd".to_string()),
        ]);
        assert_eq!(p.tag().unwrap(), "A001");
        p.space().unwrap();
        assert_eq!(p.verb().unwrap(), "LOGIN");
        p.space().unwrap();
        assert_eq!(p.astring().unwrap(), Bytes::from("ALICE"));
        p.space().unwrap();
        assert_eq!(p.astring().unwrap(), Bytes::from("pwd"));
        p.end().unwrap();
    }

    #[test]
    fn test_quoted_string_with_escapes() {
        let mut p = ImapParser::new(line(r#"x LOGIN "al ice" "p\"w\\d""#));
        p.tag().unwrap();
        p.space().unwrap();
        p.verb().unwrap();
        p.space().unwrap();
        assert_eq!(p.astring().unwrap(), Bytes::from("al ice"));
        p.space().unwrap();
        assert_eq!(p.astring().unwrap(), Bytes::from(r#"p"w\d"#));
        p.end().unwrap();
    }

    #[test]
    fn test_sequence_sets() {
        let mut p = ImapParser::new(line("1"));
        assert_eq!(p.sequence_set().unwrap(), (1, 1));
        let mut p = ImapParser::new(line("3:7"));
        assert_eq!(p.sequence_set().unwrap(), (3, 7));
        let mut p = ImapParser::new(line("7:3"));
        assert_eq!(p.sequence_set().unwrap(), (3, 7));
    }

    #[test]
    fn test_trailing_arguments_rejected() {
        let mut p = ImapParser::new(line("A1 NOOP junk"));
        p.tag().unwrap();
        p.space().unwrap();
        p.verb().unwrap();
        assert!(p.end().is_err());
    }

    #[test]
    fn test_missing_tag() {
        let mut p = ImapParser::new(line(" NOOP"));
        assert!(p.tag().is_err());
    }
}
