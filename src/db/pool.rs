//! The database connection pool.
//!
//! One process-wide queue of submitted queries, a set of backend handles
//! that drain it, and the policies that tie them together: admission,
//! growth, the idle barrier and shutdown. All bookkeeping lives behind one
//! mutex that is never held across an await point; handles are cooperative
//! tasks that pull work rather than having it pushed at them.

use crate::config::{Config, Login};
use crate::connection::ConnectionStream;
use crate::db::handle;
use crate::db::query::Query;
use crate::metrics::Gauge;
use crate::Result;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A backend connection as the pool sees it: any async byte stream.
pub type BackendStream = Box<dyn ConnectionStream>;

/// Opens backend connections. The default implementation dials the
/// configured TCP or unix-domain endpoint; tests and alternative backends
/// substitute their own.
pub trait Connect: Send + Sync {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<BackendStream>> + Send + '_>>;
}

struct TcpConnector {
    config: Config,
}

impl Connect for TcpConnector {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<BackendStream>> + Send + '_>> {
        Box::pin(async move {
            if self.config.is_unix() {
                let stream = UnixStream::connect(&self.config.db_address).await?;
                Ok(Box::new(stream) as BackendStream)
            } else {
                let stream = TcpStream::connect(self.config.endpoint()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream) as BackendStream)
            }
        })
    }
}

/// Out-of-band instructions for a handle task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Cancel the query with this id if the handle is executing it.
    Cancel(u64),
    /// Tear the connection down.
    Shutdown,
}

/// What [`PoolShared::take_work`] decided for a polling handle.
pub(crate) enum Take {
    Work(Arc<Query>),
    /// Nothing suitable queued; wait for a work notification.
    Wait,
    /// The pool has more handles than the workload needs; close.
    Retire,
    Shutdown,
}

/// Pool-side view of one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleStatus {
    Connecting,
    Idle,
    Busy,
    InTransaction,
    FailedTransaction,
    Broken,
}

#[derive(Debug)]
struct HandleSlot {
    id: u32,
    status: HandleStatus,
    /// Transaction this handle owns, by id, while it owns one.
    txn: Option<u64>,
    control: mpsc::UnboundedSender<Control>,
}

impl HandleSlot {
    /// Working, in the busy-gauge sense. Connecting and Broken handles are
    /// neither working nor available.
    fn busy(&self) -> bool {
        matches!(
            self.status,
            HandleStatus::Busy | HandleStatus::InTransaction | HandleStatus::FailedTransaction
        )
    }
}

#[derive(Debug)]
struct PoolState {
    queue: VecDeque<Arc<Query>>,
    handles: Vec<HandleSlot>,
    when_idle: Vec<oneshot::Sender<()>>,
    last_created: Option<Instant>,
    last_executed: Option<Instant>,
    next_handle_id: u32,
    shutting_down: bool,
    user: String,
    password: String,
    login_role: Login,
}

/// The gauges the pool publishes; the growth policy reads them back.
#[derive(Debug)]
pub struct PoolGauges {
    pub queue_length: Gauge,
    pub busy_handles: Gauge,
    pub total_handles: Gauge,
}

pub(crate) struct PoolShared {
    config: Config,
    state: Mutex<PoolState>,
    /// Pinged whenever queued work may have become available.
    work: Notify,
    gauges: PoolGauges,
    connector: Box<dyn Connect>,
}

/// Handle to the process-wide pool. Cloning is shallow.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("Pool")
            .field("queue", &state.queue.len())
            .field("handles", &state.handles.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl Pool {
    /// Creates a pool that dials the configured endpoint. No handles are
    /// opened until [`setup`](Self::setup).
    pub fn new(config: Config) -> Pool {
        let connector = Box::new(TcpConnector {
            config: config.clone(),
        });
        Self::with_connector(config, connector)
    }

    /// Creates a pool over a caller-supplied [`Connect`] implementation.
    pub fn with_connector(config: Config, connector: Box<dyn Connect>) -> Pool {
        let user = config.db_user.clone();
        let password = config.db_password.clone();
        Pool {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    handles: Vec::new(),
                    when_idle: Vec::new(),
                    last_created: None,
                    last_executed: None,
                    next_handle_id: 1,
                    shutting_down: false,
                    user,
                    password,
                    login_role: Login::DbUser,
                }),
                work: Notify::new(),
                gauges: PoolGauges {
                    queue_length: Gauge::new("query-queue-length"),
                    busy_handles: Gauge::new("active-db-connections"),
                    total_handles: Gauge::new("total-db-connections"),
                },
                connector,
            }),
        }
    }

    /// Validates the configuration and opens the initial handles, logging
    /// in with the credentials of `login`.
    ///
    /// `desired == 0` asks for the adaptive default: three handles, or the
    /// configured maximum when connecting over a unix-domain socket with
    /// the security toggle on.
    pub fn setup(&self, desired: u32, login: Login) -> Result<()> {
        let config = &self.shared.config;
        config.validate()?;

        let (user, password) = config.credentials(login);
        let max = config.db_max_handles;
        let mut desired = desired;
        if desired == 0 {
            desired = 3;
            if config.security && config.is_unix() {
                desired = max;
            }
        }
        let desired = desired.min(max);

        {
            let mut state = self.shared.state.lock().unwrap();
            state.user = user;
            state.password = password;
            state.login_role = login;
        }
        info!(handles = desired, "database pool starting");
        self.shared.add_handles(desired);
        Ok(())
    }

    /// The login role chosen at setup time.
    pub fn login_as(&self) -> Login {
        self.shared.state.lock().unwrap().login_role
    }

    /// Appends `query` to the work queue and pokes the handles.
    ///
    /// During shutdown, submission cancels the query instead; no new
    /// backend work starts once [`stop`](Self::stop) has run.
    pub fn submit(&self, query: &Arc<Query>) {
        query.set_submitted();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutting_down {
                drop(state);
                query.cancelled();
                return;
            }
            state.queue.push_back(query.clone());
        }
        self.shared.run_queue();
    }

    /// Submits a batch. The queue preserves the given order, but only a
    /// [`Transaction`](crate::Transaction) guarantees the queries execute
    /// in it.
    pub fn submit_many(&self, queries: &[Arc<Query>]) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutting_down {
                drop(state);
                for query in queries {
                    query.set_submitted();
                    query.cancelled();
                }
                return;
            }
            for query in queries {
                query.set_submitted();
                state.queue.push_back(query.clone());
            }
        }
        self.shared.run_queue();
    }

    /// Forwards a cancellation request to every handle; the one executing
    /// `query` (if any) issues the out-of-band cancel.
    pub fn cancel_query(&self, query: &Arc<Query>) {
        let state = self.shared.state.lock().unwrap();
        for slot in &state.handles {
            let _ = slot.control.send(Control::Cancel(query.id()));
        }
    }

    /// Registers a one-shot callback for the next moment the pool is
    /// completely idle: empty queue, every handle idle.
    ///
    /// The callback never fires synchronously. Registering while the pool
    /// is already idle arms it for the next busy-to-idle edge.
    pub fn notify_when_idle(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.shared.state.lock().unwrap().when_idle.push(tx);
        rx
    }

    /// True when no work is queued and every handle is idle.
    pub fn idle(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.queue.is_empty()
            && state
                .handles
                .iter()
                .all(|slot| slot.status == HandleStatus::Idle)
    }

    /// Tears every handle down without marking the pool as shutting down.
    /// Used only during reconfiguration; `setup` may be called again
    /// afterwards.
    pub fn disconnect(&self) {
        let slots = {
            let mut state = self.shared.state.lock().unwrap();
            std::mem::take(&mut state.handles)
        };
        self.shared.gauges.total_handles.set(0);
        for slot in slots {
            let _ = slot.control.send(Control::Shutdown);
        }
    }

    /// Begins shutdown: cancels all queued work, stops handle creation and
    /// asks every handle to terminate once its current work is done.
    pub fn stop(&self) {
        let (queued, slots) = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutting_down = true;
            let queued: Vec<_> = state.queue.drain(..).collect();
            let controls: Vec<_> = state
                .handles
                .iter()
                .map(|slot| slot.control.clone())
                .collect();
            (queued, controls)
        };
        for query in queued {
            query.cancelled();
        }
        for control in slots {
            let _ = control.send(Control::Shutdown);
        }
        // wake any handle parked on the work notification
        self.shared.work.notify_waiters();
        debug!("pool stopping");
    }

    pub fn gauges(&self) -> &PoolGauges {
        &self.shared.gauges
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }
}

impl PoolShared {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn connector(&self) -> &dyn Connect {
        self.connector.as_ref()
    }

    /// The login credentials chosen at setup.
    pub(crate) fn credentials(&self) -> (String, String) {
        let state = self.state.lock().unwrap();
        (state.user.clone(), state.password.clone())
    }

    /// Records the time of a backend send, for the growth/retire policy.
    pub(crate) fn record_execution(&self) {
        self.state.lock().unwrap().last_executed = Some(Instant::now());
    }

    /// A future for the next work notification. Callers register interest
    /// (`enable`) before re-checking the queue so no submission is lost.
    pub(crate) fn work_notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.work.notified()
    }

    /// Wakes idle handles, publishes gauges and applies the growth policy.
    ///
    /// Growth happens only when queued work exists that no idle handle is
    /// about to pick up, at most once per `db-handle-interval`, below the
    /// `db-max-handles` ceiling, never during shutdown and never towards an
    /// unreachable unix-domain socket.
    fn run_queue(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        let busy = state.handles.iter().filter(|s| s.busy()).count();
        let idle = state
            .handles
            .iter()
            .filter(|s| s.status == HandleStatus::Idle)
            .count();
        self.gauges.queue_length.set(state.queue.len() as u64);
        self.gauges.busy_handles.set(busy as u64);

        if state.queue.is_empty() {
            drop(state);
            self.react_to_idleness();
            return;
        }
        self.work.notify_waiters();

        if idle > 0 || state.shutting_down {
            return;
        }
        if self.config.is_unix() && !std::path::Path::new(&self.config.db_address).exists() {
            return;
        }
        let interval = Duration::from_secs(self.config.db_handle_interval);
        if let Some(at) = state.last_created {
            if at.elapsed() < interval {
                return;
            }
        }
        if (state.handles.len() as u32) < self.config.db_max_handles {
            self.spawn_handle(&mut state);
        }
    }

    /// Opens `n` handles right away. Used for the initial set and for
    /// re-seeding after the last handle dies; the creation interval applies
    /// only to demand growth.
    pub(crate) fn add_handles(self: &Arc<Self>, n: u32) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..n {
            self.spawn_handle(&mut state);
        }
    }

    fn spawn_handle(self: &Arc<Self>, state: &mut PoolState) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, deferring handle creation");
            return;
        };
        let id = state.next_handle_id;
        state.next_handle_id += 1;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        state.handles.push(HandleSlot {
            id,
            status: HandleStatus::Connecting,
            txn: None,
            control: control_tx,
        });
        state.last_created = Some(Instant::now());
        self.gauges.total_handles.set(state.handles.len() as u64);
        debug!(handle = id, "creating database handle");
        runtime.spawn(handle::run(self.clone(), id, control_rx));
    }

    /// Removes a dead handle. When the last one dies outside shutdown, the
    /// pool re-seeds itself with three fresh handles.
    pub(crate) fn remove_handle(self: &Arc<Self>, id: u32) {
        let reseed = {
            let mut state = self.state.lock().unwrap();
            let Some(at) = state.handles.iter().position(|slot| slot.id == id) else {
                return;
            };
            state.handles.remove(at);
            self.gauges.total_handles.set(state.handles.len() as u64);
            state.handles.is_empty() && !state.shutting_down
        };
        if reseed {
            warn!("all database handles lost, re-seeding");
            self.add_handles(3);
        }
        self.react_to_idleness();
    }

    /// Marks a freshly connected handle as available for work.
    pub(crate) fn handle_connected(&self, id: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.handles.iter_mut().find(|slot| slot.id == id) {
            slot.status = HandleStatus::Idle;
        }
    }

    /// Hands the polling handle its next unit of work, if any.
    pub(crate) fn take_work(self: &Arc<Self>, id: u32) -> Take {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return Take::Shutdown;
        }
        let Some(at) = state.handles.iter().position(|slot| slot.id == id) else {
            return Take::Shutdown;
        };

        if let Some(txn_id) = state.handles[at].txn {
            // mid-transaction: only this transaction's queries are eligible
            let found = state
                .queue
                .iter()
                .position(|q| q.transaction_shared().map(|t| t.id()) == Some(txn_id));
            return match found.and_then(|i| state.queue.remove(i)) {
                Some(query) => {
                    self.gauges.queue_length.set(state.queue.len() as u64);
                    Take::Work(query)
                }
                None => Take::Wait,
            };
        }

        if let Some(query) = first_submitted_query(&mut state, id, true) {
            let slot = &mut state.handles[at];
            slot.status = if query.transaction_shared().is_some() {
                HandleStatus::InTransaction
            } else {
                HandleStatus::Busy
            };
            self.gauges.queue_length.set(state.queue.len() as u64);
            self.gauges
                .busy_handles
                .set(state.handles.iter().filter(|s| s.busy()).count() as u64);
            return Take::Work(query);
        }

        if self.should_retire(&state) {
            return Take::Retire;
        }
        Take::Wait
    }

    /// Whether an idle handle may close itself: TCP endpoint, pool larger
    /// than both the floor and the recent workload, and quiet for at least
    /// one creation interval.
    fn should_retire(&self, state: &PoolState) -> bool {
        if self.config.is_unix() || state.handles.len() <= 3 {
            return false;
        }
        let interval = Duration::from_secs(self.config.db_handle_interval);
        match state.last_executed {
            Some(at) if at.elapsed() < interval => return false,
            None => return false,
            _ => {}
        }
        state.handles.len() as u64 > self.handles_needed(state).max(3)
    }

    /// The handle count the recent workload calls for, derived from the
    /// gauge history.
    fn handles_needed(&self, state: &PoolState) -> u64 {
        if self.config.is_unix() {
            return state.handles.len() as u64;
        }
        let now = Instant::now();
        let interval = Duration::from_secs(self.config.db_handle_interval);
        let mut needed = match now.checked_sub(2 * interval) {
            Some(since) => self.gauges.busy_handles.maximum_since(since),
            None => self.gauges.busy_handles.get(),
        };
        let recently = match now.checked_sub(Duration::from_secs(5)) {
            Some(since) => self.gauges.total_handles.maximum_since(since),
            None => self.gauges.total_handles.get(),
        };
        if recently >= 1 && needed < recently - 1 {
            needed = recently - 1;
        }
        needed.max(1)
    }

    /// Records that a handle finished its unit of work and is now in
    /// `status`, then checks the idle barrier.
    pub(crate) fn work_finished(&self, id: u32, status: HandleStatus) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(slot) = state.handles.iter_mut().find(|slot| slot.id == id) {
                slot.status = status;
                if status == HandleStatus::Idle {
                    slot.txn = None;
                }
            }
            self.gauges
                .busy_handles
                .set(state.handles.iter().filter(|s| s.busy()).count() as u64);
        }
        self.react_to_idleness();
    }

    /// Marks adoption of a transaction by a handle. Called with the state
    /// lock *not* held.
    pub(crate) fn release_transaction(&self, id: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.handles.iter_mut().find(|slot| slot.id == id) {
            slot.txn = None;
        }
    }

    /// Flushes the idle-notification list if the pool just became
    /// completely idle.
    pub(crate) fn react_to_idleness(&self) {
        let ready = {
            let mut state = self.state.lock().unwrap();
            if !state.queue.is_empty() || state.when_idle.is_empty() {
                return;
            }
            if state
                .handles
                .iter()
                .any(|slot| slot.status != HandleStatus::Idle)
            {
                return;
            }
            std::mem::take(&mut state.when_idle)
        };
        debug!(callbacks = ready.len(), "database idle");
        for callback in ready {
            let _ = callback.send(());
        }
    }
}

/// Removes and returns the first query a free handle may run.
///
/// Standalone queries are always eligible. A query belonging to a
/// transaction is eligible only when `transaction_ok` is set and its
/// transaction is unowned, in which case `handle_id` adopts it; queries of
/// transactions owned by other handles are skipped so a transaction never
/// crosses a handle boundary.
fn first_submitted_query(
    state: &mut PoolState,
    handle_id: u32,
    transaction_ok: bool,
) -> Option<Arc<Query>> {
    let mut at = None;
    for (i, query) in state.queue.iter().enumerate() {
        match query.transaction_shared() {
            None => {
                at = Some(i);
                break;
            }
            Some(txn) if transaction_ok => match txn.handle() {
                None => {
                    txn.set_handle(handle_id);
                    if let Some(slot) = state.handles.iter_mut().find(|s| s.id == handle_id) {
                        slot.txn = Some(txn.id());
                    }
                    at = Some(i);
                    break;
                }
                Some(owner) if owner == handle_id => {
                    at = Some(i);
                    break;
                }
                Some(_) => continue,
            },
            Some(_) => continue,
        }
    }
    state.queue.remove(at?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Transaction;

    /// A configuration no handle can ever be created for, so the queue is
    /// observable without a backend.
    fn unreachable_config() -> Config {
        Config {
            db_address: "/nonexistent/pg.sock".to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_first_submitted_query_skips_foreign_transactions() {
        let pool = Pool::new(unreachable_config());
        let mut txn = Transaction::new(&pool);
        let in_txn = txn.enqueue(Query::new("select 1"));
        let standalone = Arc::new(Query::new("select 2"));
        pool.submit(&standalone);

        let mut state = pool.shared().state.lock().unwrap();
        // mark the transaction as owned by handle 9, which is not polling
        in_txn.transaction_shared().unwrap().set_handle(9);

        let taken = first_submitted_query(&mut state, 1, true).unwrap();
        assert_eq!(taken.sql(), "select 2");
        // the transaction query is still queued for its owner
        assert_eq!(state.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_first_submitted_query_transaction_not_ok() {
        let pool = Pool::new(unreachable_config());
        let mut txn = Transaction::new(&pool);
        txn.enqueue(Query::new("select 1"));

        let mut state = pool.shared().state.lock().unwrap();
        assert!(first_submitted_query(&mut state, 1, false).is_none());
        assert_eq!(state.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_during_shutdown_cancels() {
        let pool = Pool::new(unreachable_config());
        pool.stop();
        let query = Arc::new(Query::new("select 1"));
        pool.submit(&query);
        assert!(query.failed());
        assert!(pool.shared().state.lock().unwrap().queue.is_empty());
    }

    #[test]
    fn test_setup_rejects_unknown_dialect() {
        let config = Config {
            db: "mysql".to_string(),
            ..Config::default()
        };
        let pool = Pool::new(config);
        assert!(pool.setup(0, Login::DbUser).is_err());
    }
}
