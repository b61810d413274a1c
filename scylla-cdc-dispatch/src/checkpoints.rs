//! A module representing the logic behind saving progress.
//!
//! A checkpoint store makes task progress survive process restarts: the
//! local transport loads the last reported [`TaskState`] of every task it
//! configures and saves each progress report. Without a store the library
//! still guarantees at-most-once delivery per run, but a restart re-reads
//! from the generation start.

use async_trait::async_trait;
use scylla::client::session::Session;
use scylla::statement::prepared::PreparedStatement;
use scylla::value::{CqlTimestamp, CqlTimeuuid};
use std::sync::Arc;

use crate::cdc_types::{ChangeId, GenerationId, StreamID, TaskId, Timestamp};
use crate::task::TaskState;

/// Customizable trait responsible for persisting progress.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Saves the given task state. Called after every progress report; may
    /// be called repeatedly with the same state.
    async fn save_progress(&self, task_id: &TaskId, state: &TaskState) -> anyhow::Result<()>;
    /// Loads the last saved state of the given task.
    async fn load_progress(&self, task_id: &TaskId) -> anyhow::Result<Option<TaskState>>;
    /// Records the generation the master currently operates on.
    async fn save_generation(&self, generation: &GenerationId) -> anyhow::Result<()>;
    /// Loads the last recorded generation, used as the master's restart hint.
    async fn load_generation(&self) -> anyhow::Result<Option<GenerationId>>;
}

/// Default implementation of [`CheckpointStore`] backed by a ScyllaDB table.
/// Along with one row per task, the table contains a special row storing the
/// latest generation.
pub struct TableBackedCheckpointStore {
    session: Arc<Session>,
    checkpoint_table: String,
    save_progress_stmt: PreparedStatement,
}

// The generation marker row lives under an impossible task key.
const GENERATION_MARKER_VNODE: i64 = -1;

impl TableBackedCheckpointStore {
    /// Creates a new [`TableBackedCheckpointStore`].
    /// Will create the table if `keyspace.table_name` doesn't exist.
    /// Created checkpoints will have Time To Live equal to 7 days.
    pub async fn new_with_default_ttl(
        session: Arc<Session>,
        keyspace: &str,
        table_name: &str,
    ) -> anyhow::Result<Self> {
        const DEFAULT_TTL: i64 = 604800; // 7 days
        TableBackedCheckpointStore::new(session, keyspace, table_name, DEFAULT_TTL).await
    }

    /// Creates a new [`TableBackedCheckpointStore`].
    /// Will create the table if `keyspace.table_name` doesn't exist.
    pub async fn new(
        session: Arc<Session>,
        keyspace: &str,
        table_name: &str,
        ttl: i64,
    ) -> anyhow::Result<Self> {
        let checkpoint_table = format!("{keyspace}.{table_name}");

        let schema = format!(
            "CREATE TABLE IF NOT EXISTS {checkpoint_table} (
                generation timestamp,
                vnode_id bigint,
                keyspace_name text,
                table_name text,
                window_start timestamp,
                window_end timestamp,
                last_consumed_time timeuuid,
                last_consumed_stream blob,
                PRIMARY KEY ((generation, vnode_id, keyspace_name, table_name)))"
        );
        session.query_unpaged(schema, ()).await?;
        session.await_schema_agreement().await?;

        let save_progress_stmt = session
            .prepare(format!(
                "UPDATE {checkpoint_table} USING TTL {ttl}
                SET window_start = ?, window_end = ?,
                    last_consumed_time = ?, last_consumed_stream = ?
                WHERE generation = ? AND vnode_id = ? AND keyspace_name = ? AND table_name = ?"
            ))
            .await?;

        Ok(TableBackedCheckpointStore {
            session,
            checkpoint_table,
            save_progress_stmt,
        })
    }

    fn task_key(task_id: &TaskId) -> (CqlTimestamp, i64, &str, &str) {
        (
            CqlTimestamp(task_id.generation.start().timestamp_millis()),
            task_id.vnode.0 as i64,
            &task_id.table.keyspace,
            &task_id.table.name,
        )
    }
}

#[async_trait]
impl CheckpointStore for TableBackedCheckpointStore {
    async fn save_progress(&self, task_id: &TaskId, state: &TaskState) -> anyhow::Result<()> {
        let (generation, vnode, keyspace, table) = Self::task_key(task_id);
        let last_time = state.last_consumed().map(|c| c.time);
        let last_stream = state.last_consumed().map(|c| c.stream_id.as_bytes());

        self.session
            .execute_unpaged(
                &self.save_progress_stmt,
                (
                    CqlTimestamp(state.window_start().timestamp_millis()),
                    CqlTimestamp(state.window_end().timestamp_millis()),
                    last_time,
                    last_stream,
                    generation,
                    vnode,
                    keyspace,
                    table,
                ),
            )
            .await?;

        Ok(())
    }

    async fn load_progress(&self, task_id: &TaskId) -> anyhow::Result<Option<TaskState>> {
        let row = self
            .session
            .query_unpaged(
                format!(
                    "SELECT window_start, window_end, last_consumed_time, last_consumed_stream
                    FROM {}
                    WHERE generation = ? AND vnode_id = ? AND keyspace_name = ? AND table_name = ?",
                    self.checkpoint_table
                ),
                Self::task_key(task_id),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<(
                CqlTimestamp,
                CqlTimestamp,
                Option<CqlTimeuuid>,
                Option<Vec<u8>>,
            )>()?;

        Ok(row.map(|(start, end, last_time, last_stream)| {
            let last_consumed = match (last_time, last_stream) {
                (Some(time), Some(stream)) => Some(ChangeId::new(StreamID::new(stream), time)),
                _ => None,
            };
            TaskState::new(
                Timestamp::from_millis(start.0),
                Timestamp::from_millis(end.0),
                last_consumed,
            )
        }))
    }

    async fn save_generation(&self, generation: &GenerationId) -> anyhow::Result<()> {
        // The marker row stores the generation in window_start.
        self.session
            .execute_unpaged(
                &self.save_progress_stmt,
                (
                    CqlTimestamp(generation.start().timestamp_millis()),
                    CqlTimestamp(0),
                    None::<CqlTimeuuid>,
                    None::<Vec<u8>>,
                    CqlTimestamp(0),
                    GENERATION_MARKER_VNODE,
                    "",
                    "",
                ),
            )
            .await?;

        Ok(())
    }

    async fn load_generation(&self) -> anyhow::Result<Option<GenerationId>> {
        let generation = self
            .session
            .query_unpaged(
                format!(
                    "SELECT window_start FROM {}
                    WHERE generation = ? AND vnode_id = ? AND keyspace_name = ? AND table_name = ?",
                    self.checkpoint_table
                ),
                (CqlTimestamp(0), GENERATION_MARKER_VNODE, "", ""),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<(CqlTimestamp,)>()?
            .map(|(ts,)| GenerationId(Timestamp::from_millis(ts.0)));

        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;
    use scylla_cdc_dispatch_test_utils::{prepare_keyspace, unique_name};

    use super::*;
    use crate::cdc_types::{TableName, VNodeId};
    use crate::time_uuid;

    async fn setup() -> Arc<TableBackedCheckpointStore> {
        const TEST_TTL: i64 = 300;
        let (session, ks) = prepare_keyspace(&[], 1).await.unwrap();
        let table_name = unique_name();

        Arc::new(
            TableBackedCheckpointStore::new(session, &ks, &table_name, TEST_TTL)
                .await
                .unwrap(),
        )
    }

    fn test_task_id(vnode: u64) -> TaskId {
        TaskId::new(
            GenerationId(Timestamp::from_millis(1_700_000_000_000)),
            VNodeId(vnode),
            TableName::new("ks", "t"),
        )
    }

    #[tokio::test]
    #[ignore = "requires a live Scylla cluster at SCYLLA_URI"]
    async fn test_save_progress_multiple_times_keeps_the_latest() {
        const N: usize = 20;
        let store = setup().await;
        let task_id = test_task_id(0);

        let mut state = TaskState::create_initial(task_id.generation, 1000);
        for _ in 0..N {
            state = state.move_to_next_window(1000);
            store.save_progress(&task_id, &state).await.unwrap();
        }

        let loaded = store.load_progress(&task_id).await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    #[ignore = "requires a live Scylla cluster at SCYLLA_URI"]
    async fn test_progress_round_trip_preserves_the_cursor() {
        let store = setup().await;
        let task_id = test_task_id(1);

        let change = ChangeId::new(
            StreamID::new(vec![1, 1, 1, 1, 1, 1, 1, 1]),
            time_uuid::start_of(1_700_000_000_500),
        );
        let state = TaskState::create_initial(task_id.generation, 1000).update(change);
        store.save_progress(&task_id, &state).await.unwrap();

        let loaded = store.load_progress(&task_id).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.last_consumed(), state.last_consumed());
    }

    #[tokio::test]
    #[ignore = "requires a live Scylla cluster at SCYLLA_URI"]
    async fn test_save_progress_multiple_tasks() {
        const N_OF_TASKS: u64 = 50;
        let store = setup().await;

        let mut states = Vec::new();
        for vnode in 0..N_OF_TASKS {
            let task_id = test_task_id(vnode);
            let window = 1000 + (random::<u64>() % 10_000) as i64;
            let state = TaskState::create_initial(task_id.generation, window);
            store.save_progress(&task_id, &state).await.unwrap();
            states.push((task_id, state));
        }

        for (task_id, state) in &states {
            let loaded = store.load_progress(task_id).await.unwrap().unwrap();
            assert_eq!(&loaded, state);
        }
    }

    #[tokio::test]
    #[ignore = "requires a live Scylla cluster at SCYLLA_URI"]
    async fn test_generation_round_trip() {
        let store = setup().await;

        assert!(store.load_generation().await.unwrap().is_none());

        let generation = GenerationId(Timestamp::from_millis(1_700_000_123_456));
        store.save_generation(&generation).await.unwrap();
        assert_eq!(store.load_generation().await.unwrap(), Some(generation));

        // A newer generation overwrites the marker.
        let newer = GenerationId(Timestamp::from_millis(1_700_000_999_999));
        store.save_generation(&newer).await.unwrap();
        assert_eq!(store.load_generation().await.unwrap(), Some(newer));
    }
}
