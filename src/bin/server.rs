use anyhow::Context;
use clap::Parser;
use correio::{Config, Login, Pool, DEFAULT_HOST, DEFAULT_PORT};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "correio-server", version, author)]
/// IMAP server storing mail in PostgreSQL.
struct Args {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Database dialect name; the suffix must be pg, pgsql or postgres.
    #[arg(long, default_value = "postgres")]
    db: String,
    /// Database server address; a leading / means a unix-domain socket.
    #[arg(long, default_value = "127.0.0.1")]
    db_address: String,
    #[arg(long, default_value_t = 5432)]
    db_port: u16,
    #[arg(long, default_value = "correio")]
    db_name: String,
    #[arg(long, default_value = "correio")]
    db_user: String,
    #[arg(long, default_value = "")]
    db_password: String,
    #[arg(long, default_value = "correio-owner")]
    db_owner: String,
    #[arg(long, default_value = "")]
    db_owner_password: String,
    /// Ceiling on concurrently open database handles.
    #[arg(long, default_value_t = 4)]
    db_max_handles: u32,
    /// Minimum seconds between two database handle creations.
    #[arg(long, default_value_t = 10)]
    db_handle_interval: u64,
    /// Security mode; with a unix-domain db-address this opens the
    /// maximum number of handles up front.
    #[arg(long)]
    security: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config {
        db: args.db,
        db_address: args.db_address,
        db_port: args.db_port,
        db_name: args.db_name,
        db_user: args.db_user,
        db_password: args.db_password,
        db_owner: args.db_owner,
        db_owner_password: args.db_owner_password,
        db_max_handles: args.db_max_handles,
        db_handle_interval: args.db_handle_interval,
        security: args.security,
    };

    let pool = Pool::new(config);
    pool.setup(0, Login::DbUser)
        .context("failed to set up the database pool")?;

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .context("failed to bind tcp listener")?;
    info!(host = %args.host, port = args.port, "listening");

    correio::server::run(listener, pool, tokio::signal::ctrl_c()).await;

    Ok(())
}
