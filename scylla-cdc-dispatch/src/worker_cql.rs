//! Worker-side CQL port: per-table prepared queries and window readers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use futures::stream::StreamExt;
use scylla::client::pager::TypedRowStream;
use scylla::client::session::Session;
use scylla::statement::prepared::PreparedStatement;
use scylla::value::Row;
use tokio::sync::RwLock;
use tracing::debug;

use crate::cdc_types::TableName;
use crate::consistency::select_consistency;
use crate::consumer::{RawChange, RawChangeSchema};
use crate::task::Task;

/// A lazy, forward-only walk over one window of one task.
///
/// Changes arrive in the order the log returns them: by time-UUID, then by
/// stream. `None` is the permanent end of the window; the reader must not
/// be polled past it.
#[async_trait]
pub trait ChangeReader: Send {
    async fn next_change(&mut self) -> anyhow::Result<Option<RawChange>>;
}

/// Operations the workers need from the cluster.
#[async_trait]
pub trait WorkerCql: Send + Sync {
    /// Prepares the log query of every table in `tables`. Idempotent:
    /// already-prepared tables are skipped.
    async fn prepare(&self, tables: &BTreeSet<TableName>) -> anyhow::Result<()>;

    /// Opens a reader over the window currently described by `task.state`,
    /// bound to the task's streams.
    async fn create_reader(&self, task: &Task) -> anyhow::Result<Box<dyn ChangeReader>>;
}

/// [`WorkerCql`] implementation querying the per-table CDC log.
pub struct ScyllaWorkerCql {
    session: Arc<Session>,
    // Write-once per table: entries are only observed after prepare
    // completed them.
    prepared_stmts: RwLock<HashMap<TableName, PreparedStatement>>,
}

fn get_log_query(table: &TableName) -> String {
    format!(
        "SELECT * FROM \"{}\".\"{}_scylla_cdc_log\" \
         WHERE \"cdc$stream_id\" IN ? AND \"cdc$time\" > ? AND \"cdc$time\" <= ?",
        table.keyspace, table.name
    )
}

impl ScyllaWorkerCql {
    pub fn new(session: &Arc<Session>) -> ScyllaWorkerCql {
        ScyllaWorkerCql {
            session: Arc::clone(session),
            prepared_stmts: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkerCql for ScyllaWorkerCql {
    async fn prepare(&self, tables: &BTreeSet<TableName>) -> anyhow::Result<()> {
        let missing: Vec<TableName> = {
            let stmts = self.prepared_stmts.read().await;
            tables
                .iter()
                .filter(|table| !stmts.contains_key(*table))
                .cloned()
                .collect()
        };

        // Prepare in bulk and publish only complete results, so no reader
        // ever observes a half-prepared table and no lock spans an await.
        let prepared = try_join_all(missing.into_iter().map(|table| async {
            let stmt = self.session.prepare(get_log_query(&table)).await?;
            Ok::<_, anyhow::Error>((table, stmt))
        }))
        .await?;

        let mut stmts = self.prepared_stmts.write().await;
        stmts.extend(prepared);
        Ok(())
    }

    async fn create_reader(&self, task: &Task) -> anyhow::Result<Box<dyn ChangeReader>> {
        let mut stmt = self
            .prepared_stmts
            .read()
            .await
            .get(&task.id.table)
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!("no prepared log query for table {}", task.id.table)
            })?;
        stmt.set_consistency(select_consistency(&self.session).await?);

        let streams: Vec<&[u8]> = task.streams.iter().map(|s| s.as_bytes()).collect();
        debug!(
            "Querying window [{}, {}] for {}",
            task.state.window_start_uuid(),
            task.state.window_end_uuid(),
            task.id
        );

        let pager = self
            .session
            .execute_iter(
                stmt,
                (
                    streams,
                    task.state.window_start_uuid(),
                    task.state.window_end_uuid(),
                ),
            )
            .await?;

        // One schema per window query: a reader is recreated every window,
        // so base-table schema changes surface at window boundaries.
        let schema = Arc::new(RawChangeSchema::new(pager.column_specs()));
        let rows = pager.rows_stream::<Row>()?;

        Ok(Box::new(ScyllaChangeReader { rows, schema }))
    }
}

struct ScyllaChangeReader {
    rows: TypedRowStream<Row>,
    schema: Arc<RawChangeSchema>,
}

#[async_trait]
impl ChangeReader for ScyllaChangeReader {
    async fn next_change(&mut self) -> anyhow::Result<Option<RawChange>> {
        match self.rows.next().await {
            Some(row) => Ok(Some(RawChange::from_row(row?, &self.schema))),
            None => Ok(None),
        }
    }
}
