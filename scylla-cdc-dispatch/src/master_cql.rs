//! Master-side CQL port: generation discovery, stream enumeration and table
//! TTLs.
//!
//! Scylla has shipped two on-disk layouts of the streams description data.
//! The implementation here talks to both: the legacy (V1) layout until a
//! `rewritten` row confirms that the V1 to V2 rewrite has finished, the new
//! (V2) layout afterwards. Once observed, the decision latches for the
//! lifetime of the process.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::StreamExt;
use scylla::client::session::Session;
use scylla::value::CqlTimestamp;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cdc_types::{GenerationId, StreamID, TableName, Timestamp};
use crate::consistency::new_coordination_query;
use crate::generation::GenerationMetadata;

// Number taken from: https://www.scylladb.com/2017/11/17/7-rules-planning-queries-maximum-performance/.
const DEFAULT_PAGE_SIZE: i32 = 5000;

/// Errors caused by cluster or table configuration, as opposed to transient
/// query failures. Expected absence (no generation yet, TTL disabled) is
/// never one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "could not find any CDC streams description table (neither V1 nor V2); \
         make sure Scylla CDC is enabled"
    )]
    NoStreamsDescriptionTables,
    #[error("could not fetch the metadata of table {0}")]
    TableNotFound(TableName),
    #[error("table {0} does not have CDC enabled")]
    CdcNotEnabled(TableName),
    #[error("table {0} has CDC enabled but no TTL value in its CDC options")]
    MissingTtl(TableName),
    #[error("table {0} has an invalid CDC TTL value: {1}")]
    MalformedTtl(TableName, String),
}

/// Operations the master needs from the cluster.
#[async_trait]
pub trait MasterCql: Send + Sync {
    /// The earliest known generation, or `None` when CDC has not produced
    /// one yet.
    async fn fetch_first_generation_id(&self) -> anyhow::Result<Option<GenerationId>>;

    /// The complete record of `id`, including its streams.
    /// Fails if the generation is unknown.
    async fn fetch_generation_metadata(
        &self,
        id: GenerationId,
    ) -> anyhow::Result<GenerationMetadata>;

    /// The instant `id` closed; absent while the generation is still open.
    async fn fetch_generation_end(&self, id: GenerationId) -> anyhow::Result<Option<Timestamp>>;

    /// The CDC log TTL of `table` in seconds; `None` when TTL is disabled.
    async fn fetch_table_ttl(&self, table: &TableName) -> anyhow::Result<Option<i64>>;
}

/// [`MasterCql`] implementation querying the cluster's CDC description
/// tables.
pub struct ScyllaMasterCql {
    session: Arc<Session>,
    generations_table_name: String,
    streams_table_name: String,
    legacy_streams_table_name: String,
    cdc_local_table_name: String,
    scylla_tables_name: String,
    // Latched once a 'rewritten' row is observed; never reverts. Racy reads
    // are fine, the flipped outcome is idempotent.
    found_rewritten: AtomicBool,
}

impl ScyllaMasterCql {
    pub fn new(session: &Arc<Session>) -> ScyllaMasterCql {
        ScyllaMasterCql {
            session: Arc::clone(session),
            generations_table_name: "system_distributed.cdc_generation_timestamps".to_string(),
            streams_table_name: "system_distributed.cdc_streams_descriptions_v2".to_string(),
            legacy_streams_table_name: "system_distributed.cdc_streams_descriptions".to_string(),
            cdc_local_table_name: "system.cdc_local".to_string(),
            scylla_tables_name: "system_schema.scylla_tables".to_string(),
            found_rewritten: AtomicBool::new(false),
        }
    }

    async fn table_exists(&self, qualified_name: &str) -> anyhow::Result<bool> {
        let Some((keyspace, name)) = qualified_name.split_once('.') else {
            return Ok(false);
        };
        let row = self
            .session
            .query_unpaged(
                "SELECT table_name FROM system_schema.tables \
                 WHERE keyspace_name = ? AND table_name = ?",
                (keyspace, name),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<(String,)>()?;
        Ok(row.is_some())
    }

    fn get_fetch_rewritten_query(&self) -> String {
        format!(
            "SELECT key FROM {} WHERE key = 'rewritten'",
            self.cdc_local_table_name
        )
    }

    /// Decides whether the legacy (V1) streams description layout should
    /// still be queried.
    async fn should_query_legacy_tables(&self) -> anyhow::Result<bool> {
        let has_new_tables = self.table_exists(&self.generations_table_name).await?;
        let has_legacy_tables = self.table_exists(&self.legacy_streams_table_name).await?;

        if has_legacy_tables && !has_new_tables {
            debug!("Using legacy (V1) streams description table, as a newer (V2) table was not found.");
            return Ok(true);
        }
        if !has_legacy_tables && has_new_tables {
            debug!("Using new (V2) streams description table, as a legacy (V1) table was not found.");
            return Ok(false);
        }
        if !has_legacy_tables && !has_new_tables {
            return Err(ConfigError::NoStreamsDescriptionTables.into());
        }

        // Both layouts are present. The V2 table is only complete after the
        // rewrite has finished, which the 'rewritten' row announces.
        if self.found_rewritten.load(Ordering::Relaxed) {
            return Ok(false);
        }

        let query = new_coordination_query(self.get_fetch_rewritten_query(), &self.session).await?;
        let rewritten = self
            .session
            .query_unpaged(query, &[])
            .await?
            .into_rows_result()?
            .maybe_first_row::<(String,)>()?
            .is_some();

        if rewritten {
            self.found_rewritten.store(true, Ordering::Relaxed);
            info!("Found a 'rewritten' row. Will use new (V2) streams description table from now on.");
            Ok(false)
        } else {
            warn!(
                "Using legacy (V1) streams description table, even though a newer (V2) table \
                 was found, because a 'rewritten' row is still missing. The rewriting process \
                 may still be pending."
            );
            Ok(true)
        }
    }

    fn get_smallest_generation_after_query(&self) -> String {
        format!(
            "SELECT min(time) FROM {} WHERE key = 'timestamps' AND time > ?",
            self.generations_table_name
        )
    }

    fn get_legacy_smallest_generation_after_query(&self) -> String {
        format!(
            "SELECT min(time) FROM {} WHERE time > ? ALLOW FILTERING",
            self.legacy_streams_table_name
        )
    }

    /// The start of the earliest generation operating strictly after
    /// `after`, under whichever layout is in force.
    async fn fetch_smallest_generation_after(
        &self,
        after: Timestamp,
    ) -> anyhow::Result<Option<Timestamp>> {
        let stmt = if self.should_query_legacy_tables().await? {
            self.get_legacy_smallest_generation_after_query()
        } else {
            self.get_smallest_generation_after_query()
        };
        let query = new_coordination_query(stmt, &self.session).await?;

        let result = self
            .session
            .query_unpaged(query, (CqlTimestamp(after.timestamp_millis()),))
            .await?
            .into_rows_result()?
            .maybe_first_row::<(Option<CqlTimestamp>,)>()?
            .and_then(|(ts,)| ts)
            .map(|ts| Timestamp::from_millis(ts.0));

        Ok(result)
    }

    fn get_streams_query(&self) -> String {
        format!(
            "SELECT streams FROM {} WHERE time = ?",
            self.streams_table_name
        )
    }

    fn get_legacy_streams_query(&self) -> String {
        format!(
            "SELECT streams FROM {} WHERE time = ? ALLOW FILTERING",
            self.legacy_streams_table_name
        )
    }

    /// All stream ids of the generation starting at `generation_start`.
    ///
    /// The V2 layout stores one row per vnode, the legacy layout one set per
    /// generation; both are flattened here and re-grouped by the derived
    /// vnode id during task construction.
    async fn fetch_streams_for_generation(
        &self,
        generation_start: Timestamp,
    ) -> anyhow::Result<BTreeSet<StreamID>> {
        let time = CqlTimestamp(generation_start.timestamp_millis());
        let mut streams = BTreeSet::new();

        if self.should_query_legacy_tables().await? {
            let query = new_coordination_query(self.get_legacy_streams_query(), &self.session)
                .await?;
            let row = self
                .session
                .query_unpaged(query, (time,))
                .await?
                .into_rows_result()?
                .maybe_first_row::<(Vec<Vec<u8>>,)>()?;
            let Some((ids,)) = row else {
                anyhow::bail!("unknown generation: {}", generation_start);
            };
            streams.extend(ids.into_iter().map(StreamID::new));
        } else {
            let mut query =
                new_coordination_query(self.get_streams_query(), &self.session).await?;
            query.set_page_size(DEFAULT_PAGE_SIZE);
            let mut rows = self
                .session
                .query_iter(query, (time,))
                .await?
                .rows_stream::<(Vec<Vec<u8>>,)>()?;
            while let Some(next_row) = rows.next().await {
                let (ids,) = next_row?;
                streams.extend(ids.into_iter().map(StreamID::new));
            }
            if streams.is_empty() {
                anyhow::bail!("unknown generation: {}", generation_start);
            }
        }

        Ok(streams)
    }

    fn get_table_cdc_options_query(&self) -> String {
        format!(
            "SELECT cdc FROM {} WHERE keyspace_name = ? AND table_name = ?",
            self.scylla_tables_name
        )
    }
}

#[async_trait]
impl MasterCql for ScyllaMasterCql {
    async fn fetch_first_generation_id(&self) -> anyhow::Result<Option<GenerationId>> {
        let first = self
            .fetch_smallest_generation_after(Timestamp::zero())
            .await?;
        Ok(first.map(GenerationId))
    }

    async fn fetch_generation_metadata(
        &self,
        id: GenerationId,
    ) -> anyhow::Result<GenerationMetadata> {
        let streams = self.fetch_streams_for_generation(id.start()).await?;
        // A generation ends exactly where its successor starts.
        let next_start = self.fetch_smallest_generation_after(id.start()).await?;
        Ok(GenerationMetadata::new(
            id,
            next_start,
            next_start.map(GenerationId),
            streams,
        ))
    }

    async fn fetch_generation_end(&self, id: GenerationId) -> anyhow::Result<Option<Timestamp>> {
        self.fetch_smallest_generation_after(id.start()).await
    }

    async fn fetch_table_ttl(&self, table: &TableName) -> anyhow::Result<Option<i64>> {
        let query =
            new_coordination_query(self.get_table_cdc_options_query(), &self.session).await?;
        let row = self
            .session
            .query_unpaged(query, (table.keyspace.as_str(), table.name.as_str()))
            .await?
            .into_rows_result()?
            .maybe_first_row::<(Option<HashMap<String, String>>,)>()?;

        let Some((cdc_options,)) = row else {
            return Err(ConfigError::TableNotFound(table.clone()).into());
        };
        let Some(cdc_options) = cdc_options else {
            return Err(ConfigError::CdcNotEnabled(table.clone()).into());
        };
        let Some(ttl) = cdc_options.get("ttl") else {
            return Err(ConfigError::MissingTtl(table.clone()).into());
        };

        match ttl.parse::<i64>() {
            // TTL of zero means the log rows never expire.
            Ok(0) => Ok(None),
            Ok(seconds) => Ok(Some(seconds)),
            Err(_) => Err(ConfigError::MalformedTtl(table.clone(), ttl.clone()).into()),
        }
    }
}
