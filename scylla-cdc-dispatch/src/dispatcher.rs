//! The entry point wiring the master, the workers and the in-process
//! transport together.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use scylla::client::session::Session;
use tokio::sync::watch;

use crate::cdc_types::TableName;
use crate::checkpoints::CheckpointStore;
use crate::config::{Clock, DispatcherConfig, SystemClock};
use crate::consumer::ConsumerFactory;
use crate::local_transport::{LocalTransport, ProgressTracker};
use crate::master::Master;
use crate::master_cql::ScyllaMasterCql;
use crate::worker::Worker;
use crate::worker_cql::{ScyllaWorkerCql, WorkerCql};

/// Handle to a running dispatcher.
/// To create an instance please see the documentation of
/// [`CdcDispatcherBuilder`].
#[derive(Debug)]
pub struct CdcDispatcher {
    // Flipping the flag reaches the master at its next suspension point;
    // workers are cancelled when their task set is dropped with it.
    stop: watch::Sender<bool>,
}

impl CdcDispatcher {
    fn new(stop: watch::Sender<bool>) -> Self {
        CdcDispatcher { stop }
    }

    /// Requests a cooperative shutdown.
    pub fn stop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// CdcDispatcherBuilder is used to create new [`CdcDispatcher`] instances.
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use async_trait::async_trait;
/// # use scylla::client::session_builder::SessionBuilder;
/// # use scylla_cdc_dispatch::consumer::{Consumer, ConsumerFactory, RawChange};
/// # use scylla_cdc_dispatch::dispatcher::CdcDispatcherBuilder;
/// # async fn example() -> anyhow::Result<()> {
/// struct DummyConsumer;
///
/// #[async_trait]
/// impl Consumer for DummyConsumer {
///     async fn consume_cdc(&mut self, change: RawChange) -> anyhow::Result<()> {
///         // ... consume the received change ...
///         Ok(())
///     }
/// }
///
/// struct DummyConsumerFactory;
///
/// #[async_trait]
/// impl ConsumerFactory for DummyConsumerFactory {
///     async fn new_consumer(&self) -> Box<dyn Consumer> {
///         Box::new(DummyConsumer)
///     }
/// }
///
/// let session = Arc::new(
///     SessionBuilder::new()
///         .known_node("127.0.0.1:9042")
///         .build()
///         .await?,
/// );
/// let (dispatcher, handle) = CdcDispatcherBuilder::new()
///     .session(session)
///     .table("ks", "t")
///     .consumer_factory(Arc::new(DummyConsumerFactory))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct CdcDispatcherBuilder {
    session: Option<Arc<Session>>,
    tables: BTreeSet<TableName>,
    window_size: Duration,
    sleep_before_first_generation: Duration,
    sleep_after_exception: Duration,
    sleep_before_generation_done: Duration,
    consumer_factory: Option<Arc<dyn ConsumerFactory>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    clock: Arc<dyn Clock>,
}

impl CdcDispatcherBuilder {
    /// Creates a new builder with the default configuration.
    ///
    /// # Default configuration
    /// * window_size: 60 seconds
    /// * sleep_before_first_generation: 10 seconds
    /// * sleep_after_exception: 10 seconds
    /// * sleep_before_generation_done: 10 seconds
    /// * no checkpoint store: progress does not survive restarts
    pub fn new() -> CdcDispatcherBuilder {
        let defaults = DispatcherConfig::new(BTreeSet::new());
        CdcDispatcherBuilder {
            session: None,
            tables: BTreeSet::new(),
            window_size: Duration::from_millis(defaults.window_size_ms as u64),
            sleep_before_first_generation: defaults.sleep_before_first_generation,
            sleep_after_exception: defaults.sleep_after_exception,
            sleep_before_generation_done: defaults.sleep_before_generation_done,
            consumer_factory: None,
            checkpoint_store: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the session the dispatcher performs queries with.
    /// This is a required field for [`CdcDispatcherBuilder::build()`].
    pub fn session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Add a CDC-enabled base table to read. At least one table is
    /// required for [`CdcDispatcherBuilder::build()`].
    pub fn table(mut self, keyspace: &str, name: &str) -> Self {
        self.tables.insert(TableName::new(keyspace, name));
        self
    }

    /// Set the size of a read window.
    /// Default window size is 60 seconds.
    pub fn window_size(mut self, window_size: Duration) -> Self {
        self.window_size = window_size;
        self
    }

    /// Set the pause between retries while waiting for the first
    /// generation to appear.
    pub fn sleep_before_first_generation(mut self, duration: Duration) -> Self {
        self.sleep_before_first_generation = duration;
        self
    }

    /// Set the back-off applied after a failed master iteration or a
    /// failed worker window.
    pub fn sleep_after_exception(mut self, duration: Duration) -> Self {
        self.sleep_after_exception = duration;
        self
    }

    /// Set the cadence at which the master polls for generation
    /// completion.
    pub fn sleep_before_generation_done(mut self, duration: Duration) -> Self {
        self.sleep_before_generation_done = duration;
        self
    }

    /// Set the consumer factory used to create one consumer per task.
    /// This is a required field for [`CdcDispatcherBuilder::build()`].
    pub fn consumer_factory(mut self, consumer_factory: Arc<dyn ConsumerFactory>) -> Self {
        self.consumer_factory = Some(consumer_factory);
        self
    }

    /// Set the store progress is persisted to, making reads resume across
    /// process restarts.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Replace the wall clock, mainly useful in tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the dispatcher and starts its master in the background.
    /// Fails with an error message if a required field is missing.
    /// Currently required fields are the following:
    /// `session`, at least one `table`, `consumer_factory`.
    pub async fn build(
        self,
    ) -> anyhow::Result<(CdcDispatcher, RemoteHandle<anyhow::Result<()>>)> {
        if self.tables.is_empty() {
            return Err(anyhow::anyhow!(
                "failed to create the cdc dispatcher: missing table"
            ));
        }
        let consumer_factory = self.consumer_factory.ok_or_else(|| {
            anyhow::anyhow!("failed to create the cdc dispatcher: missing consumer factory")
        })?;
        let session = self.session.ok_or_else(|| {
            anyhow::anyhow!("failed to create the cdc dispatcher: missing session")
        })?;

        let config = DispatcherConfig {
            tables: self.tables.clone(),
            window_size_ms: self.window_size.as_millis() as i64,
            sleep_before_first_generation: self.sleep_before_first_generation,
            sleep_after_exception: self.sleep_after_exception,
            sleep_before_generation_done: self.sleep_before_generation_done,
            clock: self.clock,
        };

        let master_cql = Arc::new(ScyllaMasterCql::new(&session));
        let worker_cql = Arc::new(ScyllaWorkerCql::new(&session));
        worker_cql.prepare(&self.tables).await?;

        let tracker = Arc::new(ProgressTracker::new(self.checkpoint_store.clone()));
        let worker = Arc::new(Worker::new(
            worker_cql,
            tracker.clone(),
            consumer_factory,
            config.window_size_ms,
            config.sleep_after_exception,
            config.clock.clone(),
        ));
        let transport = Arc::new(LocalTransport::new(
            worker,
            tracker,
            self.checkpoint_store,
            config.window_size_ms,
            config.sleep_after_exception,
        ));

        let (stop_sender, stop_receiver) = watch::channel(false);
        let master = Master::new(master_cql, transport, config, stop_receiver);

        let (fut, handle) = async move { master.run().await }.remote_handle();
        tokio::task::spawn(fut);

        Ok((CdcDispatcher::new(stop_sender), handle))
    }
}

/// Create a [`CdcDispatcherBuilder`] with default configuration, same as
/// [`CdcDispatcherBuilder::new()`].
impl Default for CdcDispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
