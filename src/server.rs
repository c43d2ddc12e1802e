//! The IMAP server front end.
//!
//! Provides an async `run` function that listens for inbound connections,
//! spawning a session task per connection, and coordinates the two-phase
//! shutdown: first the listener closes and sessions drain gracefully, then
//! outstanding database work is cancelled.

use crate::connection::Connection;
use crate::db::Pool;
use crate::imap::Session;
use crate::Result;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, Semaphore},
    time::timeout,
};
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent client connections the server accepts.
///
/// When the limit is reached, the listener waits for an active connection
/// to terminate before accepting a new one.
const MAX_CONNECTIONS: usize = 500;

/// How long draining sessions get after the listener closes before the
/// hard phase cancels their database work.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Server listener state. Accepts connections and hands each one to a
/// [`Session`] running in its own task.
#[derive(Debug)]
struct Listener {
    listener: TcpListener,
    /// Shared database pool handed to every session.
    pool: Pool,
    /// Bounds the number of live connections.
    limit_connections: Arc<Semaphore>,
    /// Broadcasts the shutdown signal to all active sessions.
    notify_shutdown: broadcast::Sender<()>,
    /// Cloned into every session; the receiver completes once all clones
    /// have dropped, which is how the server knows draining is done.
    shutdown_complete_tx: mpsc::Sender<()>,
}

/// Per-connection handler.
struct Handler {
    session: Session<TcpStream>,
    _shutdown_complete: mpsc::Sender<()>,
}

/// Runs the server until the `shutdown` future completes.
///
/// `tokio::signal::ctrl_c()` is the usual `shutdown` argument. On shutdown
/// the listener closes immediately, sessions get [`SHUTDOWN_GRACE`] to
/// write their BYEs and finish in-flight commands, and then the pool stops:
/// queued queries are cancelled and no new backend work starts.
pub async fn run(listener: TcpListener, pool: Pool, shutdown: impl Future) {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    let mut server = Listener {
        listener,
        pool: pool.clone(),
        limit_connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        notify_shutdown,
        shutdown_complete_tx,
    };

    tokio::select! {
        res = server.run() => {
            // accept failed repeatedly; individual connection errors do
            // not bubble up to this point
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }

    // close the listener and tell every session, then wait for the drain
    let Listener {
        shutdown_complete_tx,
        notify_shutdown,
        listener,
        ..
    } = server;
    drop(listener);
    drop(notify_shutdown);
    drop(shutdown_complete_tx);

    if timeout(SHUTDOWN_GRACE, shutdown_complete_rx.recv())
        .await
        .is_err()
    {
        warn!("graceful period expired with sessions still open");
    }

    // hard phase: cancel outstanding queries, stop handle creation, drop
    // backend connections
    pool.stop();
}

impl Listener {
    /// Accept loop. Each inbound connection gets a permit, a session and a
    /// task.
    async fn run(&mut self) -> Result<()> {
        info!("accepting inbound connections");

        loop {
            // the semaphore is never closed, so acquire cannot fail
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");

            let socket = self.accept().await?;

            let mut handler = Handler {
                session: Session::new(
                    Connection::new(socket),
                    self.pool.clone(),
                    self.notify_shutdown.subscribe(),
                ),
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.session.run().await {
                    error!(cause = %err, "connection error");
                }
                drop(permit);
            });
        }
    }

    /// Accepts an inbound connection, retrying transient errors with
    /// exponential backoff up to 64 seconds.
    async fn accept(&mut self) -> Result<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    debug!(%peer, "accepted IMAP connection");
                    return Ok(socket);
                }
                Err(err) => {
                    if backoff > 64 {
                        error!(%err, "failed to accept too many times");
                        return Err(err.into());
                    }
                    warn!(%err, "error accepting connection, retrying in {backoff} seconds");
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}
