//! In-process transport: one tokio task per configured [`TaskId`], progress
//! kept in memory and optionally written through to a checkpoint store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cdc_types::{GenerationId, StreamID, TaskId, Timestamp};
use crate::checkpoints::CheckpointStore;
use crate::task::{Task, TaskState};
use crate::transport::{MasterTransport, WorkerTransport};
use crate::worker::Worker;

/// The progress side of the local transport: the latest reported state of
/// every live task, written through to the checkpoint store when one is
/// attached.
pub struct ProgressTracker {
    states: RwLock<HashMap<TaskId, TaskState>>,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl ProgressTracker {
    pub fn new(store: Option<Arc<dyn CheckpointStore>>) -> ProgressTracker {
        ProgressTracker {
            states: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub async fn state_of(&self, task_id: &TaskId) -> Option<TaskState> {
        self.states.read().await.get(task_id).cloned()
    }

    async fn replace_all(&self, states: HashMap<TaskId, TaskState>) {
        *self.states.write().await = states;
    }
}

#[async_trait]
impl WorkerTransport for ProgressTracker {
    async fn report_progress(&self, task_id: &TaskId, state: &TaskState) -> anyhow::Result<()> {
        {
            let mut states = self.states.write().await;
            match states.get(task_id) {
                // Reports of tasks superseded by a newer generation are
                // discarded together with their map generation.
                None => return Ok(()),
                Some(known) if state.window_end() < known.window_end() => {
                    debug!(
                        "Ignoring a regressing progress report for {}: {} behind {}",
                        task_id, state, known
                    );
                    return Ok(());
                }
                Some(_) => {
                    states.insert(task_id.clone(), state.clone());
                }
            }
        }

        if let Some(store) = &self.store {
            store.save_progress(task_id, state).await?;
        }
        Ok(())
    }
}

/// [`MasterTransport`] implementation running every task inside the current
/// process.
pub struct LocalTransport {
    worker: Arc<Worker>,
    tracker: Arc<ProgressTracker>,
    store: Option<Arc<dyn CheckpointStore>>,
    window_size_ms: i64,
    retry_backoff: Duration,
    // Dropping a handle cancels its task at the next suspension point.
    running: Mutex<Vec<RemoteHandle<()>>>,
    current_generation: Mutex<Option<GenerationId>>,
}

impl LocalTransport {
    pub fn new(
        worker: Arc<Worker>,
        tracker: Arc<ProgressTracker>,
        store: Option<Arc<dyn CheckpointStore>>,
        window_size_ms: i64,
        retry_backoff: Duration,
    ) -> LocalTransport {
        LocalTransport {
            worker,
            tracker,
            store,
            window_size_ms,
            retry_backoff,
            running: Mutex::new(Vec::new()),
            current_generation: Mutex::new(None),
        }
    }

    fn spawn_task(&self, task: Task) -> RemoteHandle<()> {
        let worker = Arc::clone(&self.worker);
        let tracker = Arc::clone(&self.tracker);
        let backoff = self.retry_backoff;

        let (fut, handle) = async move {
            loop {
                // Each attempt resumes from the last reported state, so a
                // consumer failure never rewinds committed progress.
                let state = tracker
                    .state_of(&task.id)
                    .await
                    .unwrap_or_else(|| task.state.clone());
                let attempt = Task::new(task.id.clone(), task.streams.clone(), state);
                match worker.run_task(attempt).await {
                    Ok(()) => break,
                    Err(err) => {
                        warn!(
                            "{} failed: {:#}. Will restart it from its last reported state.",
                            task.id, err
                        );
                        sleep(backoff).await;
                    }
                }
            }
        }
        .remote_handle();
        tokio::spawn(fut);
        handle
    }
}

#[async_trait]
impl MasterTransport for LocalTransport {
    async fn current_generation_id(&self) -> Option<GenerationId> {
        if let Some(generation) = *self.current_generation.lock().await {
            return Some(generation);
        }
        let store = self.store.as_ref()?;
        match store.load_generation().await {
            Ok(generation) => generation,
            Err(err) => {
                warn!("Loading the saved generation failed: {:#}", err);
                None
            }
        }
    }

    async fn configure_workers(
        &self,
        tasks: BTreeMap<TaskId, BTreeSet<StreamID>>,
    ) -> anyhow::Result<()> {
        // Cancel the superseded task set before touching the progress map.
        self.running.lock().await.clear();

        let Some(generation) = tasks.keys().next().map(|id| id.generation) else {
            self.tracker.replace_all(HashMap::new()).await;
            return Ok(());
        };

        let mut initial_states = HashMap::new();
        for task_id in tasks.keys() {
            let saved = match &self.store {
                Some(store) => store.load_progress(task_id).await?,
                None => None,
            };
            let state = saved
                .unwrap_or_else(|| TaskState::create_initial(generation, self.window_size_ms));
            initial_states.insert(task_id.clone(), state);
        }
        self.tracker.replace_all(initial_states.clone()).await;

        *self.current_generation.lock().await = Some(generation);
        if let Some(store) = &self.store {
            if let Err(err) = store.save_generation(&generation).await {
                warn!("Saving the current generation failed: {:#}", err);
            }
        }

        let mut running = self.running.lock().await;
        for (task_id, streams) in tasks {
            let state = initial_states.remove(&task_id).unwrap();
            running.push(self.spawn_task(Task::new(task_id, streams, state)));
        }

        Ok(())
    }

    async fn are_tasks_fully_consumed_until(
        &self,
        tasks: &BTreeSet<TaskId>,
        until: Timestamp,
    ) -> anyhow::Result<bool> {
        for task_id in tasks {
            match self.tracker.state_of(task_id).await {
                Some(state) if state.has_passed(until) => continue,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}
