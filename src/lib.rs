use std::time::Duration;

pub mod clients;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod imap;
pub mod metrics;
pub mod server;

pub use clients::Client;
pub use config::{Config, Login};
pub use connection::{Connection, ConnectionStream};
pub use db::{Pool, Query, Row, Transaction, Value};
pub use error::Error;

pub const DEFAULT_PORT: u16 = 1143;
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Inactivity deadline for IMAP connections, per RFC 3501 section 5.4.
pub const AUTOLOGOUT: Duration = Duration::from_secs(30 * 60);

pub type Result<T> = std::result::Result<T, crate::error::Error>;
