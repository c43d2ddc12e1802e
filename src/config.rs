//! The database-facing configuration surface.
//!
//! Only the keys the pool actually consumes live here; everything else
//! (listen addresses, TLS, logging filters) belongs to the binaries.

use crate::{Error, Result};

/// Database configuration, one field per `db-*` key.
#[derive(Debug, Clone)]
pub struct Config {
    /// Schema dialect name. The part after a `+`, or the whole string if
    /// there is no `+`, must be one of `pg`, `pgsql` or `postgres`.
    pub db: String,
    /// Server address; a leading `/` means a unix-domain socket path.
    pub db_address: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub db_owner: String,
    pub db_owner_password: String,
    /// Ceiling on the number of concurrently open handles.
    pub db_max_handles: u32,
    /// Minimum number of seconds between two handle creations.
    pub db_handle_interval: u64,
    /// When set together with a unix-domain address, the pool opens the
    /// maximum number of handles up front instead of growing on demand.
    pub security: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: "postgres".to_string(),
            db_address: "127.0.0.1".to_string(),
            db_port: 5432,
            db_name: "correio".to_string(),
            db_user: "correio".to_string(),
            db_password: String::new(),
            db_owner: "correio-owner".to_string(),
            db_owner_password: String::new(),
            db_max_handles: 4,
            db_handle_interval: 10,
            security: false,
        }
    }
}

/// Which set of configured credentials a pool logs in with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Login {
    DbUser,
    DbOwner,
}

impl Config {
    /// Checks that the configured dialect is one this server speaks: the
    /// token after the last `+`, or the whole name when there is none.
    pub fn validate(&self) -> Result<()> {
        let db = self.db.to_lowercase();
        let dialect = db
            .rsplit_once('+')
            .map(|(_, suffix)| suffix)
            .unwrap_or(&db);
        match dialect {
            "pg" | "pgsql" | "postgres" => Ok(()),
            _ => Err(Error::Logic(format!("unsupported database type: {}", self.db))),
        }
    }

    /// True when `db_address` names a unix-domain socket.
    pub fn is_unix(&self) -> bool {
        self.db_address.starts_with('/')
    }

    /// The TCP endpoint string, meaningless for unix-domain addresses.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.db_address, self.db_port)
    }

    /// The `(user, password)` pair for the given login role.
    pub fn credentials(&self, login: Login) -> (String, String) {
        match login {
            Login::DbUser => (self.db_user.clone(), self.db_password.clone()),
            Login::DbOwner => (self.db_owner.clone(), self.db_owner_password.clone()),
        }
    }
}
