//! A minimal IMAP client.

use crate::connection::{Connection, ConnectionStream};
use crate::{Error, Result};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Established connection with an IMAP server.
///
/// Just enough client to drive one command at a time: it sends a tagged
/// line and collects responses until the matching tagged completion. No
/// pipelining, no literals.
#[derive(Debug)]
pub struct Client<S = TcpStream> {
    conn: Connection<S>,
    next_tag: u32,
    /// The server greeting, captured at connect time.
    pub greeting: String,
}

impl Client<TcpStream> {
    /// Connects to the IMAP server at `addr` and reads the greeting.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        Client::from_stream(socket).await
    }
}

impl<S: ConnectionStream> Client<S> {
    /// Wraps an established stream and reads the greeting line.
    pub async fn from_stream(stream: S) -> Result<Self> {
        let mut conn = Connection::new(stream);
        let greeting = read_line(&mut conn).await?;
        debug!(%greeting, "connected");
        Ok(Client {
            conn,
            next_tag: 1,
            greeting,
        })
    }

    /// Sends one command and returns all response lines, the tagged
    /// completion last. Returns an error on a tagged NO or BAD.
    pub async fn command(&mut self, command: &str) -> Result<Vec<String>> {
        let tag = format!("c{}", self.next_tag);
        self.next_tag += 1;

        self.conn.enqueue(format!("{tag} {command}\r\n").as_bytes());
        self.conn.flush().await?;

        let mut lines = Vec::new();
        loop {
            let line = read_line(&mut self.conn).await?;
            debug!(%line, "response");
            if let Some(rest) = line.strip_prefix(&format!("{tag} ")) {
                let ok = rest.starts_with("OK");
                lines.push(line);
                if ok {
                    return Ok(lines);
                }
                return Err(Error::Protocol(lines.pop().unwrap_or_default()));
            }
            lines.push(line);
        }
    }

    pub async fn capability(&mut self) -> Result<Vec<String>> {
        self.command("CAPABILITY").await
    }

    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        self.command(&format!("LOGIN \"{user}\" \"{password}\""))
            .await?;
        Ok(())
    }

    pub async fn select(&mut self, mailbox: &str) -> Result<Vec<String>> {
        self.command(&format!("SELECT \"{mailbox}\"")).await
    }

    pub async fn noop(&mut self) -> Result<()> {
        self.command("NOOP").await?;
        Ok(())
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.command("LOGOUT").await?;
        Ok(())
    }
}

async fn read_line<S: ConnectionStream>(conn: &mut Connection<S>) -> Result<String> {
    loop {
        if let Some(line) = conn.remove_line() {
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        if conn.read_more().await? == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by server",
            )));
        }
    }
}
