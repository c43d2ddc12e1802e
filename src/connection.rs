//! A module for handling the connection to a stream, usually a remote peer via a [`TcpStream`].
use crate::Result;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// A byte stream with explicit read and write buffers and an optional
/// absolute deadline.
///
/// Protocol layers consume the read buffer directly: line-oriented ones
/// through [`remove_line`](Connection::remove_line) and [`take`], framed ones
/// by parsing [`read_buffer`](Connection::read_buffer) and asking for more
/// bytes with [`read_more`](Connection::read_more). Outgoing bytes are
/// appended with [`enqueue`](Connection::enqueue) and pushed to the socket by
/// [`flush`](Connection::flush), so a whole batch of responses becomes few
/// syscalls.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    /// Buffer of received, not yet consumed bytes.
    read_buf: BytesMut,
    /// Buffer of enqueued, not yet written bytes.
    write_buf: BytesMut,
    /// Absolute inactivity deadline, if armed.
    deadline: Option<Instant>,
}

/// A trait for types that can be used as a connection stream.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types that implement `AsyncRead + AsyncWrite + Unpin + Send`.
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> ConnectionStream for T {}

impl Connection<TcpStream> {
    /// Establish a TCP connection to `addr` and wrap it.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S: ConnectionStream> Connection<S> {
    /// Create a new `Connection` over an established stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            deadline: None,
        }
    }

    /// Read whatever the peer has sent into the read buffer.
    ///
    /// Returns the number of bytes received; `0` means the peer closed its
    /// end of the stream.
    pub async fn read_more(&mut self) -> Result<usize> {
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        Ok(n)
    }

    /// The buffer of received, not yet consumed bytes.
    pub fn read_buffer(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Remove and return the next line from the read buffer, without its
    /// line ending, or `None` if no complete line has been received yet.
    ///
    /// Lines are LF-delimited; a CR immediately before the LF is stripped,
    /// so both strict CRLF peers and sloppy LF-only ones parse.
    pub fn remove_line(&mut self) -> Option<Bytes> {
        let lf = self.read_buf.iter().position(|&b| b == b'\n')?;
        let mut line = self.read_buf.split_to(lf + 1);
        line.truncate(lf);
        if line.last() == Some(&b'\r') {
            line.truncate(lf - 1);
        }
        Some(line.freeze())
    }

    /// Remove and return exactly `n` buffered bytes, or `None` if fewer
    /// have been received so far.
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        if self.read_buf.len() < n {
            return None;
        }
        Some(self.read_buf.split_to(n).freeze())
    }

    /// Append `bytes` to the write buffer. Nothing reaches the peer until
    /// [`flush`](Connection::flush).
    pub fn enqueue(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    /// The buffer of enqueued, not yet written bytes.
    pub fn write_buffer(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    /// Write the whole write buffer to the stream.
    pub async fn flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            let n = self.stream.write(&self.write_buf).await?;
            self.write_buf.advance(n);
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Arm the inactivity deadline `seconds` from now; `0` disarms it.
    pub fn set_timeout_after(&mut self, seconds: u64) {
        if seconds == 0 {
            self.deadline = None;
        } else {
            self.deadline = Some(Instant::now() + Duration::from_secs(seconds));
        }
    }

    /// The current absolute deadline, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Flush any remaining output and shut the stream down.
    pub async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        self.stream.shutdown().await?;
        debug!("connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_remove_line_variants() {
        let stream = tokio_test::io::Builder::new()
            .read(b"A001 NOOP\r\nA002 CAPA")
            .read(b"BILITY\r\nbare lf\nrest")
            .build();
        let mut conn = Connection::new(stream);

        assert!(conn.remove_line().is_none());
        conn.read_more().await.unwrap();
        assert_eq!(conn.remove_line().unwrap(), Bytes::from("A001 NOOP"));
        // second line is split across reads
        assert!(conn.remove_line().is_none());
        conn.read_more().await.unwrap();
        assert_eq!(conn.remove_line().unwrap(), Bytes::from("A002 CAPABILITY"));
        assert_eq!(conn.remove_line().unwrap(), Bytes::from("bare lf"));
        assert!(conn.remove_line().is_none());
        assert_eq!(conn.read_buffer().as_ref(), b"rest");
    }

    #[tokio::test]
    async fn test_take_literal_bytes() {
        let stream = tokio_test::io::Builder::new().read(b"ALICE pwd\r\n").build();
        let mut conn = Connection::new(stream);
        conn.read_more().await.unwrap();

        assert!(conn.take(100).is_none());
        assert_eq!(conn.take(5).unwrap(), Bytes::from("ALICE"));
        assert_eq!(conn.remove_line().unwrap(), Bytes::from(" pwd"));
    }

    #[tokio::test]
    async fn test_enqueue_then_flush() {
        let stream = tokio_test::io::Builder::new()
            .write(b"* OK ready\r\n+ idling\r\n")
            .build();
        let mut conn = Connection::new(stream);

        conn.enqueue(b"* OK ready\r\n");
        conn.enqueue(b"+ idling\r\n");
        conn.flush().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_arming() {
        let stream = tokio_test::io::Builder::new().build();
        let mut conn = Connection::new(stream);

        assert!(conn.deadline().is_none());
        conn.set_timeout_after(30);
        let armed = conn.deadline().unwrap();
        assert_eq!(armed - Instant::now(), Duration::from_secs(30));
        conn.set_timeout_after(0);
        assert!(conn.deadline().is_none());
    }
}
