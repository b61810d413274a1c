//! Tasks and their windowed read state.

use std::collections::BTreeSet;
use std::fmt;

use scylla::value::CqlTimeuuid;

use crate::cdc_types::{ChangeId, GenerationId, StreamID, TaskId, Timestamp};
use crate::time_uuid;

/// One unit of work: every stream of one vnode, polled against one table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub streams: BTreeSet<StreamID>,
    pub state: TaskState,
}

impl Task {
    pub fn new(id: TaskId, streams: BTreeSet<StreamID>, state: TaskState) -> Task {
        Task { id, streams, state }
    }
}

/// The cursor of a task: the current window and the last change handed to
/// the consumer inside it.
///
/// States are values; every transition produces a new state and leaves the
/// previous one intact, so a retry can always re-run from the state it
/// started with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TaskState {
    window_start: Timestamp,
    window_end: Timestamp,
    last_consumed: Option<ChangeId>,
}

impl TaskState {
    pub fn new(
        window_start: Timestamp,
        window_end: Timestamp,
        last_consumed: Option<ChangeId>,
    ) -> TaskState {
        TaskState {
            window_start,
            window_end,
            last_consumed,
        }
    }

    /// The state every task of `generation` starts from: a fresh window
    /// spanning `window_size_ms` from the generation start.
    pub fn create_initial(generation: GenerationId, window_size_ms: i64) -> TaskState {
        let start = generation.start();
        TaskState {
            window_start: start,
            window_end: start.plus_millis(window_size_ms),
            last_consumed: None,
        }
    }

    pub fn window_start(&self) -> Timestamp {
        self.window_start
    }

    pub fn window_end(&self) -> Timestamp {
        self.window_end
    }

    pub fn last_consumed(&self) -> Option<&ChangeId> {
        self.last_consumed.as_ref()
    }

    /// Lower bound of the window query, exclusive.
    pub fn window_start_uuid(&self) -> CqlTimeuuid {
        time_uuid::start_of(self.window_start.timestamp_millis())
    }

    /// Upper bound of the window query, inclusive.
    ///
    /// Without the -1 every window would also cover the first millisecond
    /// of its successor and deliver those rows twice.
    pub fn window_end_uuid(&self) -> CqlTimeuuid {
        time_uuid::end_of(self.window_end.timestamp_millis() - 1)
    }

    /// True once this task's window has moved strictly past `t`.
    pub fn has_passed(&self, t: Timestamp) -> bool {
        self.window_start > t
    }

    /// The next window: starts where this one ended, fresh cursor.
    pub fn move_to_next_window(&self, next_window_size_ms: i64) -> TaskState {
        TaskState {
            window_start: self.window_end,
            window_end: self.window_end.plus_millis(next_window_size_ms),
            last_consumed: None,
        }
    }

    /// Records `seen` as consumed. The window does not move.
    pub fn update(&self, seen: ChangeId) -> TaskState {
        TaskState {
            window_start: self.window_start,
            window_end: self.window_end,
            last_consumed: Some(seen),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last_consumed {
            Some(last) => write!(
                f,
                "TaskState([{}, {}), consumed up to {})",
                self.window_start, self.window_end, last
            ),
            None => write!(
                f,
                "TaskState([{}, {}), nothing consumed)",
                self.window_start, self.window_end
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_uuid;

    const GEN_START: i64 = 1_700_000_000_000;
    const WINDOW: i64 = 1000;

    fn initial() -> TaskState {
        TaskState::create_initial(GenerationId(Timestamp::from_millis(GEN_START)), WINDOW)
    }

    fn change_at(millis: i64) -> ChangeId {
        ChangeId::new(StreamID::new(vec![7; 16]), time_uuid::start_of(millis))
    }

    #[test]
    fn test_initial_window_spans_from_generation_start() {
        let state = initial();
        assert_eq!(state.window_start(), Timestamp::from_millis(GEN_START));
        assert_eq!(state.window_end(), Timestamp::from_millis(GEN_START + WINDOW));
        assert_eq!(state.last_consumed(), None);
    }

    #[test]
    fn test_update_keeps_window_bounds() {
        let state = initial();
        let updated = state.update(change_at(GEN_START + 500));

        assert_eq!(updated.window_start(), state.window_start());
        assert_eq!(updated.window_end(), state.window_end());
        assert_eq!(updated.last_consumed(), Some(&change_at(GEN_START + 500)));
    }

    #[test]
    fn test_move_to_next_window_is_contiguous_and_fresh() {
        // The window advance of scenario: consume at +500 and +900, then move.
        let state = initial()
            .update(change_at(GEN_START + 500))
            .update(change_at(GEN_START + 900));
        assert_eq!(state.last_consumed(), Some(&change_at(GEN_START + 900)));

        let next = state.move_to_next_window(WINDOW);
        assert_eq!(next.window_start(), Timestamp::from_millis(GEN_START + 1000));
        assert_eq!(next.window_end(), Timestamp::from_millis(GEN_START + 2000));
        assert_eq!(next.last_consumed(), None);
    }

    #[test]
    fn test_window_end_is_strictly_monotone_across_states() {
        let mut state = initial();
        let mut previous_end = state.window_end();
        for _ in 0..5 {
            let next = state.move_to_next_window(WINDOW);
            assert!(next.window_end() > previous_end);
            assert_eq!(next.window_start(), previous_end);
            previous_end = next.window_end();
            state = next;
        }
    }

    #[test]
    fn test_has_passed_compares_the_window_start() {
        let state = initial();
        assert!(!state.has_passed(Timestamp::from_millis(GEN_START)));

        let next = state.move_to_next_window(WINDOW);
        assert!(next.has_passed(Timestamp::from_millis(GEN_START)));
        assert!(!next.has_passed(Timestamp::from_millis(GEN_START + WINDOW)));
    }

    #[test]
    fn test_window_uuid_bounds_do_not_overlap_the_next_window() {
        let state = initial();
        let next = state.move_to_next_window(WINDOW);
        // The inclusive end of one window sorts strictly before the
        // exclusive start of the next.
        assert!(state.window_end_uuid() < next.window_start_uuid());
        assert_eq!(
            time_uuid::embedded_millis(&state.window_end_uuid()),
            GEN_START + WINDOW - 1
        );
    }

    #[test]
    fn test_equality_is_structural() {
        let a = initial().update(change_at(GEN_START + 1));
        let b = initial().update(change_at(GEN_START + 1));
        assert_eq!(a, b);
        assert_ne!(a, initial());
    }
}
