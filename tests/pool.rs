//! Pool behavior against the scripted fake backend: scheduling,
//! transactions, the idle barrier, growth and shutdown.

mod fake_pg;

use fake_pg::{FakePg, Rule};
use correio::{Config, Login, Pool, Query, Transaction};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{advance, timeout, Duration, Instant};

fn config() -> Config {
    Config {
        db_max_handles: 4,
        db_handle_interval: 10,
        ..Config::default()
    }
}

fn pool_with(fake: &Arc<FakePg>, config: Config) -> Pool {
    Pool::with_connector(config, fake.connector())
}

#[tokio::test]
async fn test_single_select() {
    let fake = FakePg::new(vec![Rule::rows(
        "select 1 as n",
        vec![("n", 23)],
        vec![vec![Some("1".to_string())]],
    )]);
    let pool = pool_with(&fake, config());
    pool.setup(1, Login::DbUser).unwrap();

    let notify = Arc::new(Notify::new());
    let query = Arc::new(Query::with_submitter("select 1 as n", notify.clone()));
    pool.submit(&query);
    query.wait().await;

    assert!(query.done());
    assert!(!query.failed(), "error: {:?}", query.error());
    let row = query.next_row().unwrap();
    assert_eq!(row.get_int("n"), Some(1));
    assert!(query.next_row().is_none());

    // the submitter was notified exactly once
    timeout(Duration::from_millis(100), notify.notified())
        .await
        .expect("submitter was not notified");
    assert!(timeout(Duration::from_millis(100), notify.notified())
        .await
        .is_err());
}

#[tokio::test]
async fn test_concurrent_selects_on_two_handles() {
    let fake = FakePg::new(vec![Rule::rows("as n", vec![("n", 23)], vec![vec![Some(
        "7".to_string(),
    )]])
    .delayed(Duration::from_millis(40))]);
    let pool = pool_with(&fake, config());
    pool.setup(2, Login::DbUser).unwrap();
    let started = Instant::now();

    let queries: Vec<_> = (0..10)
        .map(|i| Arc::new(Query::new(format!("select {i} as n"))))
        .collect();
    pool.submit_many(&queries);

    for query in &queries {
        query.wait().await;
        assert!(!query.failed(), "error: {:?}", query.error());
    }

    // two handles were opened, and both were busy at peak
    assert_eq!(fake.connections(), 2);
    assert_eq!(pool.gauges().busy_handles.maximum_since(started), 2);
    assert!(pool.gauges().queue_length.maximum_since(started) <= 10);

    // per-handle FIFO: each connection saw its statements in submission order
    for handle in 0..2 {
        let seen: Vec<usize> = fake
            .statements()
            .iter()
            .filter(|(conn, sql)| *conn == handle && sql.contains("as n"))
            .map(|(_, sql)| {
                sql.split_whitespace()
                    .nth(1)
                    .unwrap()
                    .parse::<usize>()
                    .unwrap()
            })
            .collect();
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted, "handle {handle} reordered its queries");
    }
}

#[tokio::test]
async fn test_transaction_failure_forces_rollback() {
    let fake = FakePg::new(vec![
        Rule::rows("select 1 as n", vec![("n", 23)], vec![vec![Some("1".to_string())]]),
        Rule::error("insert into messages", "23505", "duplicate key value"),
        Rule::rows("select 2 as n", vec![("n", 23)], vec![vec![Some("2".to_string())]]),
    ]);
    let pool = pool_with(&fake, config());
    pool.setup(1, Login::DbUser).unwrap();

    let mut txn = Transaction::new(&pool);
    let q1 = txn.enqueue(Query::new("select 1 as n"));
    let q2 = txn.enqueue(Query::new("insert into messages (id) values (1)"));
    let q3 = txn.enqueue(Query::new("select 2 as n"));
    let end = txn.commit();
    end.wait().await;

    assert!(!q1.failed());
    assert_eq!(q1.next_row().unwrap().get_int("n"), Some(1));
    assert!(q2.failed());
    assert!(q2.error().unwrap().contains("duplicate key"));
    // q3 was failed locally with the original error, and never sent
    assert!(q3.failed());
    assert!(q3.error().unwrap().contains("duplicate key"));
    assert!(!fake.saw("select 2 as n"));

    assert!(txn.failed());
    assert!(txn.done());
    assert!(fake.saw("BEGIN"));
    assert!(fake.saw("ROLLBACK"));
    assert!(!fake.saw("COMMIT"));

    // an enqueue after the failure short-circuits immediately
    let late = txn.enqueue(Query::new("select 3 as n"));
    assert!(late.failed());
    assert!(!fake.saw("select 3 as n"));
}

#[tokio::test]
async fn test_transaction_affinity_with_competing_handles() {
    let fake = FakePg::new(vec![Rule::rows("as t", vec![("t", 23)], vec![vec![Some(
        "1".to_string(),
    )]])
    .delayed(Duration::from_millis(10))]);
    let pool = pool_with(&fake, config());
    pool.setup(2, Login::DbUser).unwrap();

    let mut txn = Transaction::new(&pool);
    let queries: Vec<_> = (0..3)
        .map(|i| txn.enqueue(Query::new(format!("select {i} as t"))))
        .collect();
    // standalone noise for the other handle
    let noise: Vec<_> = (0..5)
        .map(|i| Arc::new(Query::new(format!("select {i} as n"))))
        .collect();
    pool.submit_many(&noise);
    let end = txn.commit();

    end.wait().await;
    for query in queries.iter().chain(noise.iter()) {
        query.wait().await;
        assert!(!query.failed(), "error: {:?}", query.error());
    }

    // every statement of the transaction ran on one connection
    let transactional: Vec<usize> = fake
        .statements()
        .iter()
        .filter(|(_, sql)| {
            sql.contains("as t") || sql == "BEGIN" || sql == "COMMIT"
        })
        .map(|(conn, _)| *conn)
        .collect();
    assert!(!transactional.is_empty());
    assert!(
        transactional.windows(2).all(|w| w[0] == w[1]),
        "transaction crossed handles: {transactional:?}"
    );
}

#[tokio::test]
async fn test_idle_barrier_edge_semantics() {
    let fake = FakePg::new(vec![Rule::rows("slow", vec![("n", 23)], vec![vec![Some(
        "1".to_string(),
    )]])
    .delayed(Duration::from_millis(40))]);
    let pool = pool_with(&fake, config());
    pool.setup(1, Login::DbUser).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await; // let the handle connect

    // registered while idle: fires only on the next busy-to-idle edge
    let mut early = pool.notify_when_idle();
    assert!(timeout(Duration::from_millis(100), &mut early).await.is_err());

    let first = Arc::new(Query::new("select slow as n"));
    let second = Arc::new(Query::new("select slow as n"));
    pool.submit_many(&[first.clone(), second.clone()]);
    let during = pool.notify_when_idle();

    first.wait().await;
    second.wait().await;

    // both callbacks fire exactly once, after both completions
    timeout(Duration::from_secs(1), early)
        .await
        .expect("early barrier never fired")
        .unwrap();
    timeout(Duration::from_secs(1), during)
        .await
        .expect("barrier never fired")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_growth_is_rate_limited() {
    let fake = FakePg::new(vec![Rule::rows("hang", vec![("n", 23)], vec![vec![Some(
        "1".to_string(),
    )]])
    .delayed(Duration::from_secs(100_000))]);
    let pool = pool_with(&fake, config());
    pool.setup(1, Login::DbUser).unwrap();
    // let the first handle connect and park
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fake.connections(), 1);

    // saturate the lone handle; growth is blocked by the creation interval
    for i in 0..3 {
        let query = Arc::new(Query::new(format!("select {i} where hang")));
        pool.submit(&query);
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fake.connections(), 1, "grew during the creation interval");

    // one interval later one more handle may be created, but only one
    advance(Duration::from_secs(11)).await;
    let query = Arc::new(Query::new("select 10 where hang"));
    pool.submit(&query);
    let query = Arc::new(Query::new("select 11 where hang"));
    pool.submit(&query);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fake.connections(), 2);

    advance(Duration::from_secs(11)).await;
    let query = Arc::new(Query::new("select 12 where hang"));
    pool.submit(&query);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fake.connections(), 3);

    pool.stop();
}

#[tokio::test]
async fn test_shutdown_quiescence() {
    let fake = FakePg::new(vec![Rule::rows("busy", vec![("n", 23)], vec![vec![Some(
        "1".to_string(),
    )]])
    .delayed(Duration::from_millis(50))]);
    let pool = pool_with(&fake, config());
    pool.setup(1, Login::DbUser).unwrap();

    let executing = Arc::new(Query::new("select busy as n"));
    pool.submit(&executing);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let queued = Arc::new(Query::new("select queued as n"));
    pool.submit(&queued);
    // the lone handle is still busy, so `queued` is still in the queue
    pool.stop();

    executing.wait().await;
    queued.wait().await;
    assert!(queued.failed(), "queued work must be cancelled by stop()");
    assert!(!fake.saw("select queued"));

    // no new handles and no new work after stop
    let connections = fake.connections();
    let late = Arc::new(Query::new("select late as n"));
    pool.submit(&late);
    assert!(late.failed());
    assert!(!fake.saw("select late"));
    assert_eq!(fake.connections(), connections);

    // the handle drains and goes away without being re-seeded
    timeout(Duration::from_secs(1), async {
        while pool.gauges().total_handles.get() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handles were not torn down");
}

#[tokio::test]
async fn test_cancel_reaches_the_backend() {
    let fake = FakePg::new(vec![Rule::rows("sleepy", vec![("n", 23)], vec![vec![Some(
        "1".to_string(),
    )]])
    .delayed(Duration::from_secs(3600))]);
    let pool = pool_with(&fake, config());
    pool.setup(1, Login::DbUser).unwrap();

    let query = Arc::new(Query::new("select sleepy as n"));
    pool.submit(&query);
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.cancel_query(&query);
    timeout(Duration::from_secs(2), query.wait())
        .await
        .expect("cancel did not take effect");
    assert!(query.failed());
    assert!(fake.saw("<cancel>"));
}
