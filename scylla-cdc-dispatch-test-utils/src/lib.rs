//! Helpers for tests that need a live Scylla cluster, reachable at
//! `SCYLLA_URI` (default `127.0.0.1:9042`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::statement::unprepared::Statement;
use scylla::statement::Consistency;

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Current wall-clock time in milliseconds since the epoch.
pub fn now() -> i64 {
    chrono::Local::now().timestamp_millis()
}

/// A name no concurrent test run can collide with.
pub fn unique_name() -> String {
    let seq = NAME_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("dispatch_test_{}_{}", now() / 1000, seq)
}

/// DDL of a small CDC-enabled table the dispatch tests read through.
/// Several partitions per table keep more than one stream busy.
pub fn cdc_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id int,
            seq int,
            payload text,
            PRIMARY KEY (id, seq)
        ) WITH cdc = {{'enabled': true}};"
    )
}

async fn connect() -> anyhow::Result<Arc<Session>> {
    let uri = std::env::var("SCYLLA_URI").unwrap_or_else(|_| "127.0.0.1:9042".to_string());
    let session = SessionBuilder::new().known_node(uri).build().await?;
    Ok(Arc::new(session))
}

/// Connects to the cluster, creates a fresh keyspace, switches the session
/// into it and runs the given DDL there.
pub async fn prepare_keyspace(
    schema: &[String],
    replication_factor: u8,
) -> anyhow::Result<(Arc<Session>, String)> {
    let session = connect().await?;
    let ks = unique_name();

    let mut create_keyspace = Statement::new(format!(
        "CREATE KEYSPACE IF NOT EXISTS {ks} WITH REPLICATION = \
         {{'class': 'SimpleStrategy', 'replication_factor': {replication_factor}}};"
    ));
    create_keyspace.set_consistency(Consistency::All);
    session.query_unpaged(create_keyspace, &[]).await?;
    session.await_schema_agreement().await?;
    session.use_keyspace(&ks, false).await?;

    for ddl in schema {
        session.query_unpaged(ddl.clone(), &[]).await?;
    }
    session.await_schema_agreement().await?;

    Ok((session, ks))
}

/// A fresh keyspace holding one CDC-enabled table per name in `tables`,
/// the shape the multi-table task-set tests want.
pub async fn prepare_cdc_tables(
    tables: &[&str],
    replication_factor: u8,
) -> anyhow::Result<(Arc<Session>, String)> {
    let schema: Vec<String> = tables.iter().map(|table| cdc_table_ddl(table)).collect();
    prepare_keyspace(&schema, replication_factor).await
}

/// Writes `rows_per_partition` rows into each of `partitions` partitions
/// of `table`. Spreading writes over partitions spreads them over streams,
/// which is what the windowed readers group by vnode.
pub async fn feed_table(
    session: &Arc<Session>,
    table: &str,
    partitions: u32,
    rows_per_partition: u32,
) -> anyhow::Result<()> {
    for id in 0..partitions {
        for seq in 0..rows_per_partition {
            session
                .query_unpaged(
                    format!("INSERT INTO {table} (id, seq, payload) VALUES (?, ?, ?);"),
                    (id as i32, seq as i32, format!("payload-{id}-{seq}")),
                )
                .await?;
        }
    }
    Ok(())
}
