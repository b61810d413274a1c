//! The master loop: discovers generations, builds the task set, publishes
//! it to the transport and advances once a generation is done.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cdc_types::{GenerationId, StreamID, TaskId, Timestamp};
use crate::config::DispatcherConfig;
use crate::generation::GenerationMetadata;
use crate::master_cql::MasterCql;
use crate::transport::MasterTransport;

/// Drives the generation lifecycle. One master runs per process; the
/// workers it coordinates are reached only through the transport.
pub struct Master {
    cql: Arc<dyn MasterCql>,
    transport: Arc<dyn MasterTransport>,
    config: DispatcherConfig,
    stop: watch::Receiver<bool>,
}

impl Master {
    pub fn new(
        cql: Arc<dyn MasterCql>,
        transport: Arc<dyn MasterTransport>,
        config: DispatcherConfig,
        stop: watch::Receiver<bool>,
    ) -> Master {
        Master {
            cql,
            transport,
            config,
            stop,
        }
    }

    /// Runs until stopped. Every failed iteration is logged and retried
    /// from the start after a back-off; errors never escape the loop.
    pub async fn run(mut self) -> anyhow::Result<()> {
        while !self.stopped() {
            if let Err(err) = self.run_until_error().await {
                warn!(
                    "Got an error inside the master loop: {:#}. Will retry after a back-off.",
                    err
                );
                self.sleep_or_stop(self.config.sleep_after_exception).await;
            }
        }
        Ok(())
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    // Sleeps for `duration` unless a stop request arrives first.
    // Returns true when the master should shut down.
    async fn sleep_or_stop(&mut self, duration: Duration) -> bool {
        if self.stopped() {
            return true;
        }
        tokio::select! {
            _ = sleep(duration) => false,
            // A dropped sender disables this branch instead of firing it.
            Ok(_) = self.stop.changed() => self.stopped(),
        }
    }

    // Resolves the generation to start from: the transport hint when there
    // is one, otherwise the first generation the cluster knows of, polled
    // until it appears. Returns None when stopped while waiting.
    async fn resolve_start(&mut self) -> anyhow::Result<Option<GenerationId>> {
        if let Some(generation_id) = self.transport.current_generation_id().await {
            debug!("Starting from the transport hint: {}", generation_id);
            return Ok(Some(generation_id));
        }
        loop {
            if let Some(generation_id) = self.cql.fetch_first_generation_id().await? {
                return Ok(Some(generation_id));
            }
            debug!("No CDC generation exists yet. Will look again soon.");
            if self
                .sleep_or_stop(self.config.sleep_before_first_generation)
                .await
            {
                return Ok(None);
            }
        }
    }

    // One task per (vnode, table), carrying every stream of that vnode.
    fn create_tasks(
        &self,
        generation: &GenerationMetadata,
    ) -> BTreeMap<TaskId, BTreeSet<StreamID>> {
        let mut tasks: BTreeMap<TaskId, BTreeSet<StreamID>> = BTreeMap::new();
        for stream in generation.streams() {
            for table in &self.config.tables {
                let task_id = TaskId::new(generation.id(), stream.vnode_id(), table.clone());
                tasks.entry(task_id).or_default().insert(stream.clone());
            }
        }
        tasks
    }

    async fn generation_done(
        &self,
        generation: &GenerationMetadata,
        tasks: &BTreeSet<TaskId>,
    ) -> anyhow::Result<bool> {
        let Some(end) = generation.end() else {
            return Ok(false);
        };

        if self.generation_ttl_expired(generation).await? {
            return Ok(true);
        }

        self.transport
            .are_tasks_fully_consumed_until(tasks, end)
            .await
    }

    // True when no configured table can still hold a row written inside
    // the generation: everything in it has expired, so the generation may
    // be skipped even without any recorded progress.
    async fn generation_ttl_expired(
        &self,
        generation: &GenerationMetadata,
    ) -> anyhow::Result<bool> {
        let Some(end) = generation.end() else {
            return Ok(false);
        };

        let now = self.config.clock.now();
        let ttl_fetches = self.config.tables.iter().map(|table| async move {
            // One bad table must not stall the master: a failed fetch
            // counts as TTL absent, which never expires the generation.
            match self.cql.fetch_table_ttl(table).await {
                Ok(ttl) => ttl,
                Err(err) => {
                    warn!("Error while fetching the TTL of {}: {:#}", table, err);
                    None
                }
            }
        });

        let last_visible = join_all(ttl_fetches)
            .await
            .into_iter()
            .map(|ttl| match ttl {
                Some(seconds) => now.plus_millis(-1000 * seconds),
                None => Timestamp::zero(),
            })
            .min()
            .unwrap_or_else(Timestamp::zero);

        Ok(last_visible > end)
    }

    async fn refresh_end(
        &self,
        generation: GenerationMetadata,
    ) -> anyhow::Result<GenerationMetadata> {
        match self.cql.fetch_generation_end(generation.id()).await? {
            Some(end) => Ok(generation.with_end(end)),
            None => Ok(generation),
        }
    }

    async fn next_generation(
        &self,
        generation: &GenerationMetadata,
    ) -> anyhow::Result<GenerationMetadata> {
        let Some(next_id) = generation.next_generation_id() else {
            anyhow::bail!("{} is done but its successor is unknown", generation);
        };
        self.cql.fetch_generation_metadata(next_id).await
    }

    async fn run_until_error(&mut self) -> anyhow::Result<()> {
        let Some(generation_id) = self.resolve_start().await? else {
            return Ok(());
        };
        let mut generation = self.cql.fetch_generation_metadata(generation_id).await?;
        let mut tasks = self.create_tasks(&generation);

        while !self.stopped() {
            // Fast-forward through generations that are already done, for
            // example after a long offline period.
            let mut task_ids: BTreeSet<TaskId> = tasks.keys().cloned().collect();
            while self.generation_done(&generation, &task_ids).await? {
                generation = self.next_generation(&generation).await?;
                tasks = self.create_tasks(&generation);
                task_ids = tasks.keys().cloned().collect();
            }

            info!(
                "Master found a new generation: {}. Will configure the workers.",
                generation.id()
            );
            for (task, streams) in &tasks {
                debug!("Created {} with {} streams", task, streams.len());
            }
            self.transport.configure_workers(tasks.clone()).await?;

            while !self.generation_done(&generation, &task_ids).await? {
                if self
                    .sleep_or_stop(self.config.sleep_before_generation_done)
                    .await
                {
                    return Ok(());
                }
                if !generation.is_closed() {
                    generation = self.refresh_end(generation).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::cdc_types::{StreamID, TableName, VNodeId};
    use crate::config::Clock;
    use crate::generation::GenerationMetadata;
    use crate::master_cql::ConfigError;

    const G0: i64 = 1_700_000_000_000;
    const G1: i64 = 1_700_000_600_000;

    struct ManualClock(AtomicI64);

    impl Clock for ManualClock {
        fn now(&self) -> Timestamp {
            Timestamp::from_millis(self.0.load(Ordering::SeqCst))
        }
    }

    fn stream_for_vnode(vnode: u64) -> StreamID {
        let mut id = vec![0u8; 8];
        id.extend_from_slice(&((vnode << 4) | 1).to_be_bytes());
        StreamID::new(id)
    }

    fn generation_at(start: i64, end: Option<i64>, vnodes: &[u64]) -> GenerationMetadata {
        GenerationMetadata::new(
            GenerationId(Timestamp::from_millis(start)),
            end.map(Timestamp::from_millis),
            end.map(|e| GenerationId(Timestamp::from_millis(e))),
            vnodes.iter().map(|&v| stream_for_vnode(v)).collect(),
        )
    }

    #[derive(Default)]
    struct MockCql {
        first: StdMutex<Option<GenerationId>>,
        generations: StdMutex<HashMap<GenerationId, GenerationMetadata>>,
        ttls: StdMutex<HashMap<TableName, anyhow::Result<Option<i64>>>>,
        first_calls: AtomicI64,
    }

    #[async_trait]
    impl MasterCql for MockCql {
        async fn fetch_first_generation_id(&self) -> anyhow::Result<Option<GenerationId>> {
            self.first_calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.first.lock().unwrap())
        }

        async fn fetch_generation_metadata(
            &self,
            id: GenerationId,
        ) -> anyhow::Result<GenerationMetadata> {
            self.generations
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown generation: {}", id))
        }

        async fn fetch_generation_end(
            &self,
            id: GenerationId,
        ) -> anyhow::Result<Option<Timestamp>> {
            Ok(self
                .generations
                .lock()
                .unwrap()
                .get(&id)
                .and_then(|g| g.end()))
        }

        async fn fetch_table_ttl(&self, table: &TableName) -> anyhow::Result<Option<i64>> {
            match self.ttls.lock().unwrap().get(table) {
                Some(Ok(ttl)) => Ok(*ttl),
                Some(Err(_)) => Err(ConfigError::CdcNotEnabled(table.clone()).into()),
                None => Ok(None),
            }
        }
    }

    #[derive(Default)]
    struct MockTransport {
        hint: Option<GenerationId>,
        configured: StdMutex<Vec<BTreeMap<TaskId, BTreeSet<StreamID>>>>,
        consumed_until: StdMutex<HashMap<GenerationId, bool>>,
    }

    #[async_trait]
    impl MasterTransport for MockTransport {
        async fn current_generation_id(&self) -> Option<GenerationId> {
            self.hint
        }

        async fn configure_workers(
            &self,
            tasks: BTreeMap<TaskId, BTreeSet<StreamID>>,
        ) -> anyhow::Result<()> {
            self.configured.lock().unwrap().push(tasks);
            Ok(())
        }

        async fn are_tasks_fully_consumed_until(
            &self,
            tasks: &BTreeSet<TaskId>,
            _until: Timestamp,
        ) -> anyhow::Result<bool> {
            let generation = tasks.iter().next().unwrap().generation;
            Ok(*self
                .consumed_until
                .lock()
                .unwrap()
                .get(&generation)
                .unwrap_or(&false))
        }
    }

    struct Harness {
        cql: Arc<MockCql>,
        transport: Arc<MockTransport>,
        stop: watch::Sender<bool>,
        master: Master,
    }

    fn harness(hint: Option<GenerationId>, now: i64) -> Harness {
        let cql = Arc::new(MockCql::default());
        let transport = Arc::new(MockTransport {
            hint,
            ..MockTransport::default()
        });
        let clock = Arc::new(ManualClock(AtomicI64::new(now)));

        let mut config =
            DispatcherConfig::new([TableName::new("ks", "t")].into_iter().collect());
        config.window_size_ms = 1000;
        config.sleep_before_first_generation = Duration::from_millis(5);
        config.sleep_after_exception = Duration::from_millis(5);
        config.sleep_before_generation_done = Duration::from_millis(5);
        config.clock = clock;

        let (stop, stop_rx) = watch::channel(false);
        let master = Master::new(cql.clone(), transport.clone(), config, stop_rx);
        Harness {
            cql,
            transport,
            stop,
            master,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition never became true"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_initial_generation_produces_one_task_per_vnode_and_table() {
        let h = harness(None, G0);
        *h.cql.first.lock().unwrap() =
            Some(GenerationId(Timestamp::from_millis(G0)));
        h.cql
            .generations
            .lock()
            .unwrap()
            .insert(
                GenerationId(Timestamp::from_millis(G0)),
                generation_at(G0, None, &[0, 1]),
            );

        let stop = h.stop.clone();
        let transport = h.transport.clone();
        let join = tokio::spawn(h.master.run());
        wait_for(|| !transport.configured.lock().unwrap().is_empty()).await;
        stop.send(true).unwrap();
        join.await.unwrap().unwrap();

        let configured = h.transport.configured.lock().unwrap();
        assert_eq!(configured.len(), 1);
        let tasks = &configured[0];
        assert_eq!(tasks.len(), 2);

        let table = TableName::new("ks", "t");
        let gen = GenerationId(Timestamp::from_millis(G0));
        let expected: BTreeMap<TaskId, BTreeSet<StreamID>> = [
            (
                TaskId::new(gen, VNodeId(0), table.clone()),
                [stream_for_vnode(0)].into_iter().collect(),
            ),
            (
                TaskId::new(gen, VNodeId(1), table),
                [stream_for_vnode(1)].into_iter().collect(),
            ),
        ]
        .into_iter()
        .collect();
        assert_eq!(*tasks, expected);
    }

    #[tokio::test]
    async fn test_streams_of_one_vnode_share_a_task() {
        let h = harness(None, G0);
        let gen = GenerationId(Timestamp::from_millis(G0));
        // Two streams of vnode 3, distinguished by their upper quadwords.
        let mut other = vec![1u8; 8];
        other.extend_from_slice(&((3u64 << 4) | 1).to_be_bytes());
        let mut metadata_streams: BTreeSet<StreamID> = [stream_for_vnode(3)].into();
        metadata_streams.insert(StreamID::new(other));
        let metadata = GenerationMetadata::new(gen, None, None, metadata_streams.clone());

        *h.cql.first.lock().unwrap() = Some(gen);
        h.cql.generations.lock().unwrap().insert(gen, metadata);

        let stop = h.stop.clone();
        let transport = h.transport.clone();
        let join = tokio::spawn(h.master.run());
        wait_for(|| !transport.configured.lock().unwrap().is_empty()).await;
        stop.send(true).unwrap();
        join.await.unwrap().unwrap();

        let configured = h.transport.configured.lock().unwrap();
        let tasks = &configured[0];
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[&TaskId::new(gen, VNodeId(3), TableName::new("ks", "t"))],
            metadata_streams
        );
    }

    #[tokio::test]
    async fn test_transport_hint_skips_discovery() {
        let g5 = GenerationId(Timestamp::from_millis(G1));
        let h = harness(Some(g5), G0);
        h.cql
            .generations
            .lock()
            .unwrap()
            .insert(g5, generation_at(G1, None, &[0]));

        let stop = h.stop.clone();
        let transport = h.transport.clone();
        let join = tokio::spawn(h.master.run());
        wait_for(|| !transport.configured.lock().unwrap().is_empty()).await;
        stop.send(true).unwrap();
        join.await.unwrap().unwrap();

        // Discovery was never needed, the hint named the generation.
        assert_eq!(h.cql.first_calls.load(Ordering::SeqCst), 0);
        let configured = h.transport.configured.lock().unwrap();
        assert_eq!(
            configured[0].keys().next().unwrap().generation,
            g5
        );
    }

    #[tokio::test]
    async fn test_ttl_expiry_makes_a_generation_done_without_progress() {
        // Generation closed at G0 + 1000, table TTL 60 s, now 61 s past the
        // end: nothing of the generation can still be visible.
        let h = harness(None, G0 + 1000 + 61_000);
        let generation = generation_at(G0, Some(G0 + 1000), &[0]);
        h.cql
            .ttls
            .lock()
            .unwrap()
            .insert(TableName::new("ks", "t"), Ok(Some(60)));

        assert!(h.master.generation_ttl_expired(&generation).await.unwrap());
        let task_ids = h
            .master
            .create_tasks(&generation)
            .keys()
            .cloned()
            .collect();
        // The transport has no progress at all, yet the generation is done.
        assert!(h.master.generation_done(&generation, &task_ids).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_ttl_never_expires_a_generation() {
        let h = harness(None, G0 + 100_000_000);
        let generation = generation_at(G0, Some(G0 + 1000), &[0]);
        h.cql
            .ttls
            .lock()
            .unwrap()
            .insert(TableName::new("ks", "t"), Ok(None));

        assert!(!h.master.generation_ttl_expired(&generation).await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_fetch_errors_are_localized() {
        // The table's TTL fetch fails; that must count as "no TTL" rather
        // than aborting the master iteration.
        let h = harness(None, G0 + 100_000_000);
        let generation = generation_at(G0, Some(G0 + 1000), &[0]);
        h.cql
            .ttls
            .lock()
            .unwrap()
            .insert(TableName::new("ks", "t"), Err(anyhow::anyhow!("boom")));

        assert!(!h.master.generation_ttl_expired(&generation).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_generation_is_never_done() {
        let h = harness(None, G0 + 100_000_000);
        let generation = generation_at(G0, None, &[0]);
        let task_ids = h
            .master
            .create_tasks(&generation)
            .keys()
            .cloned()
            .collect();
        assert!(!h.master.generation_done(&generation, &task_ids).await.unwrap());
    }

    #[tokio::test]
    async fn test_master_advances_once_workers_cross_the_end() {
        let h = harness(None, G0);
        let g0 = GenerationId(Timestamp::from_millis(G0));
        let g1 = GenerationId(Timestamp::from_millis(G1));
        *h.cql.first.lock().unwrap() = Some(g0);
        {
            let mut generations = h.cql.generations.lock().unwrap();
            generations.insert(g0, generation_at(G0, Some(G1), &[0]));
            generations.insert(g1, generation_at(G1, None, &[0, 1]));
        }

        let stop = h.stop.clone();
        let transport = h.transport.clone();
        let join = tokio::spawn(h.master.run());
        wait_for(|| !transport.configured.lock().unwrap().is_empty()).await;

        // The first generation is still being consumed.
        assert_eq!(transport.configured.lock().unwrap().len(), 1);

        // Workers cross the end of g0: the master must configure g1.
        transport.consumed_until.lock().unwrap().insert(g0, true);
        wait_for(|| transport.configured.lock().unwrap().len() >= 2).await;
        stop.send(true).unwrap();
        join.await.unwrap().unwrap();

        let configured = transport.configured.lock().unwrap();
        assert_eq!(
            configured[1].keys().next().unwrap().generation,
            g1
        );
        assert_eq!(configured[1].len(), 2);
    }

    #[tokio::test]
    async fn test_errors_are_retried_after_backoff() {
        // No generations known at first: fetching metadata fails, the
        // envelope retries, and a later iteration succeeds.
        let h = harness(Some(GenerationId(Timestamp::from_millis(G0))), G0);

        let stop = h.stop.clone();
        let transport = h.transport.clone();
        let cql = h.cql.clone();
        let join = tokio::spawn(h.master.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.configured.lock().unwrap().is_empty());

        cql.generations.lock().unwrap().insert(
            GenerationId(Timestamp::from_millis(G0)),
            generation_at(G0, None, &[0]),
        );
        wait_for(|| !transport.configured.lock().unwrap().is_empty()).await;
        stop.send(true).unwrap();
        join.await.unwrap().unwrap();
    }
}
