use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Not enough bytes buffered to parse a complete message.
    #[error("incomplete message")]
    IncompleteMessage,
    #[error("protocol error: {0}")]
    Protocol(String),
    /// An ErrorResponse from the database server.
    #[error("backend error {code}: {message}")]
    Backend { code: String, message: String },
    #[error("query cancelled")]
    Cancelled,
    #[error("deadline reached")]
    Timeout,
    /// A caller misused an API, e.g. bound a parameter at position zero.
    #[error("logic error: {0}")]
    Logic(String),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("end of stream")]
    /// Attempting to extract a value failed due to the input being fully consumed.
    EndOfStream,
    #[error(transparent)]
    Conversion(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}
