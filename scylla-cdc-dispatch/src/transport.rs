//! Ports through which the master hands work out and observes progress.
//!
//! A transport owns the distribution of tasks to workers and the durability
//! of their progress. The in-process implementation lives in
//! [`local_transport`](crate::local_transport); deployments that spread
//! workers over several processes plug in their own.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::cdc_types::{GenerationId, StreamID, TaskId, Timestamp};
use crate::task::TaskState;

/// The master's view of the transport.
#[async_trait]
pub trait MasterTransport: Send + Sync {
    /// A restart hint: when present, the master starts from this generation
    /// and skips initial discovery.
    async fn current_generation_id(&self) -> Option<GenerationId>;

    /// Delivers the authoritative task set of the current generation.
    /// Supersedes any previously configured set; progress of superseded
    /// tasks is discarded.
    async fn configure_workers(
        &self,
        tasks: BTreeMap<TaskId, BTreeSet<StreamID>>,
    ) -> anyhow::Result<()>;

    /// The completion oracle: true iff every task in `tasks` has durably
    /// progressed past `until`, that is, its window start lies strictly
    /// after it.
    async fn are_tasks_fully_consumed_until(
        &self,
        tasks: &BTreeSet<TaskId>,
        until: Timestamp,
    ) -> anyhow::Result<bool>;
}

/// The workers' view of the transport.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Records task progress. Reported at least once per state; transports
    /// may coalesce updates but must never let `window_end` regress.
    async fn report_progress(&self, task_id: &TaskId, state: &TaskState) -> anyhow::Result<()>;
}
