//! The per-task windowed polling state machine.
//!
//! A worker walks the CDC log of one task window by window. A window is
//! only read once it lies entirely in the past, is re-read from the last
//! consumed change on transient failures, and is left behind only when the
//! reader reported its permanent end.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::Clock;
use crate::consumer::{Consumer, ConsumerFactory};
use crate::task::Task;
use crate::transport::WorkerTransport;
use crate::worker_cql::WorkerCql;

// Failures of one window, split by who has to act on them: transient read
// problems are retried here, consumer failures abort the task.
enum WindowError {
    Cql(anyhow::Error),
    Consumer(anyhow::Error),
}

/// Runs the windowed polling loop for the tasks it is handed.
pub struct Worker {
    cql: Arc<dyn WorkerCql>,
    transport: Arc<dyn WorkerTransport>,
    consumer_factory: Arc<dyn ConsumerFactory>,
    window_size_ms: i64,
    sleep_after_exception: Duration,
    clock: Arc<dyn Clock>,
}

impl Worker {
    pub fn new(
        cql: Arc<dyn WorkerCql>,
        transport: Arc<dyn WorkerTransport>,
        consumer_factory: Arc<dyn ConsumerFactory>,
        window_size_ms: i64,
        sleep_after_exception: Duration,
        clock: Arc<dyn Clock>,
    ) -> Worker {
        Worker {
            cql,
            transport,
            consumer_factory,
            window_size_ms,
            sleep_after_exception,
            clock,
        }
    }

    /// Polls `task` until cancelled or until the consumer fails.
    ///
    /// Returns only on a consumer error; everything transient is retried
    /// in place. The caller decides whether a failed task is retried from
    /// its last persisted state.
    pub async fn run_task(&self, mut task: Task) -> anyhow::Result<()> {
        let mut consumer = self.consumer_factory.new_consumer().await;
        loop {
            // Do not read open windows: rows of the current millisecond may
            // still be in flight.
            self.wait_until_window_closed(&task).await;

            match self.read_window(&mut task, consumer.as_mut()).await {
                Ok(()) => {
                    task.state = task.state.move_to_next_window(self.window_size_ms);
                    self.report_progress(&task).await;
                }
                Err(WindowError::Cql(err)) => {
                    warn!(
                        "Reading a window of {} failed: {:#}. Will retry it from the last \
                         consumed change.",
                        task.id, err
                    );
                    sleep(self.sleep_after_exception).await;
                }
                Err(WindowError::Consumer(err)) => {
                    warn!("Consumer of {} failed: {:#}. Aborting the task.", task.id, err);
                    return Err(err);
                }
            }
        }
    }

    async fn wait_until_window_closed(&self, task: &Task) {
        loop {
            let now = self.clock.now();
            let window_end = task.state.window_end();
            if window_end <= now {
                return;
            }
            let remaining = window_end.timestamp_millis() - now.timestamp_millis();
            sleep(Duration::from_millis(remaining as u64)).await;
        }
    }

    async fn read_window(
        &self,
        task: &mut Task,
        consumer: &mut dyn Consumer,
    ) -> Result<(), WindowError> {
        let mut reader = self
            .cql
            .create_reader(task)
            .await
            .map_err(WindowError::Cql)?;

        loop {
            let change = reader.next_change().await.map_err(WindowError::Cql)?;
            let Some(change) = change else {
                debug!("Finished window [{}, {}) of {}",
                    task.state.window_start(), task.state.window_end(), task.id);
                return Ok(());
            };

            let change_id = change.change_id();
            if let Some(last) = task.state.last_consumed() {
                // Already delivered before a retry of this window.
                if change_id <= *last {
                    continue;
                }
            }

            consumer
                .consume_cdc(change)
                .await
                .map_err(WindowError::Consumer)?;
            task.state = task.state.update(change_id);
            self.report_progress(task).await;
        }
    }

    // Progress is reported after the consumer committed, so a lost report
    // only widens the at-least-once window; the in-memory cursor keeps the
    // consumer itself duplicate-free within this run.
    async fn report_progress(&self, task: &Task) {
        if let Err(err) = self.transport.report_progress(&task.id, &task.state).await {
            warn!("Reporting progress of {} failed: {:#}", task.id, err);
        }
    }
}
