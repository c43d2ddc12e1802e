use clap::{Parser, Subcommand};
use correio::{Client, DEFAULT_PORT};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = CorreioCli::parse();
    let addr = std::net::SocketAddr::new(cli.host, cli.port);
    let mut client = Client::connect(&addr).await?;
    println!("{}", client.greeting);

    match cli.command {
        CorreioSubcommand::Capability => {
            for line in client.capability().await? {
                println!("{line}");
            }
        }
        CorreioSubcommand::Noop => {
            client.noop().await?;
            println!("OK");
        }
        CorreioSubcommand::Login { user, password } => {
            client.login(&user, &password).await?;
            println!("OK");
        }
        CorreioSubcommand::Select {
            user,
            password,
            mailbox,
        } => {
            client.login(&user, &password).await?;
            for line in client.select(&mailbox).await? {
                println!("{line}");
            }
        }
    };

    client.logout().await?;
    Ok(())
}

#[derive(Debug, Parser)]
#[command(name = "correio-cli", version, author)]
/// A debugging client for the correio IMAP server.
struct CorreioCli {
    #[clap(subcommand)]
    command: CorreioSubcommand,
    #[arg(long, default_value = "127.0.0.1")]
    host: std::net::IpAddr,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Debug, Subcommand)]
/// Subcommand to execute.
enum CorreioSubcommand {
    /// Ask the server for its capability list.
    Capability,
    /// Ping the server.
    Noop,
    /// Verify a login.
    Login {
        user: String,
        password: String,
    },
    /// Select a mailbox and print its status.
    Select {
        user: String,
        password: String,
        mailbox: String,
    },
}
