//! Construction-time configuration and the injectable clock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::cdc_types::{TableName, Timestamp};

const SECOND_IN_MILLIS: u64 = 1_000;
pub(crate) const DEFAULT_WINDOW_SIZE_MS: i64 = 60 * SECOND_IN_MILLIS as i64;
pub(crate) const DEFAULT_SLEEP_BEFORE_FIRST_GENERATION: Duration =
    Duration::from_millis(10 * SECOND_IN_MILLIS);
pub(crate) const DEFAULT_SLEEP_AFTER_EXCEPTION: Duration =
    Duration::from_millis(10 * SECOND_IN_MILLIS);
pub(crate) const DEFAULT_SLEEP_BEFORE_GENERATION_DONE: Duration =
    Duration::from_millis(10 * SECOND_IN_MILLIS);

/// Source of wall-clock time. Everything in the library reads "now" through
/// this trait, which keeps window arithmetic deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(chrono::Local::now().timestamp_millis())
    }
}

/// Everything the coordination engine is constructed with.
#[derive(Clone)]
pub struct DispatcherConfig {
    /// The CDC-enabled base tables to read.
    pub tables: BTreeSet<TableName>,
    /// Size of a fresh read window in milliseconds.
    pub window_size_ms: i64,
    /// Pause between retries while waiting for the first generation to appear.
    pub sleep_before_first_generation: Duration,
    /// Back-off after a failed master iteration or worker window.
    pub sleep_after_exception: Duration,
    /// Cadence of the generation-done poll.
    pub sleep_before_generation_done: Duration,
    pub clock: Arc<dyn Clock>,
}

impl DispatcherConfig {
    /// A configuration with the default timings.
    pub fn new(tables: BTreeSet<TableName>) -> DispatcherConfig {
        DispatcherConfig {
            tables,
            window_size_ms: DEFAULT_WINDOW_SIZE_MS,
            sleep_before_first_generation: DEFAULT_SLEEP_BEFORE_FIRST_GENERATION,
            sleep_after_exception: DEFAULT_SLEEP_AFTER_EXCEPTION,
            sleep_before_generation_done: DEFAULT_SLEEP_BEFORE_GENERATION_DONE,
            clock: Arc::new(SystemClock),
        }
    }
}
