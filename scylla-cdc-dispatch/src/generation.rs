//! Stream-generation metadata as observed by the master.

use std::collections::BTreeSet;
use std::fmt;

use crate::cdc_types::{GenerationId, StreamID, Timestamp};

/// One topology generation: the interval during which the stream set is
/// fixed. `end` and `next` appear together once a successor generation is
/// observed; until then the generation is open.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GenerationMetadata {
    id: GenerationId,
    end: Option<Timestamp>,
    next: Option<GenerationId>,
    streams: BTreeSet<StreamID>,
}

impl GenerationMetadata {
    pub fn new(
        id: GenerationId,
        end: Option<Timestamp>,
        next: Option<GenerationId>,
        streams: BTreeSet<StreamID>,
    ) -> GenerationMetadata {
        GenerationMetadata {
            id,
            end,
            next,
            streams,
        }
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    /// True once a successor generation has been observed.
    pub fn is_closed(&self) -> bool {
        self.end.is_some()
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.end
    }

    pub fn next_generation_id(&self) -> Option<GenerationId> {
        self.next
    }

    pub fn streams(&self) -> &BTreeSet<StreamID> {
        &self.streams
    }

    /// Returns this metadata closed at `end`. A generation ends exactly
    /// where its successor starts, so the successor id is implied.
    pub fn with_end(self, end: Timestamp) -> GenerationMetadata {
        GenerationMetadata {
            id: self.id,
            end: Some(end),
            next: Some(GenerationId(end)),
            streams: self.streams,
        }
    }
}

impl fmt::Display for GenerationMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "Generation([{}, {}))", self.id, end),
            None => write!(f, "Generation([{}, ...))", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_streams() -> BTreeSet<StreamID> {
        [StreamID::new(vec![1; 16]), StreamID::new(vec![2; 16])]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_open_generation_has_no_successor() {
        let gen = GenerationMetadata::new(
            GenerationId(Timestamp::from_millis(1000)),
            None,
            None,
            some_streams(),
        );
        assert!(!gen.is_closed());
        assert_eq!(gen.end(), None);
        assert_eq!(gen.next_generation_id(), None);
    }

    #[test]
    fn test_with_end_closes_and_names_the_successor() {
        let gen = GenerationMetadata::new(
            GenerationId(Timestamp::from_millis(1000)),
            None,
            None,
            some_streams(),
        );
        let end = Timestamp::from_millis(5000);
        let closed = gen.with_end(end);

        assert!(closed.is_closed());
        assert_eq!(closed.end(), Some(end));
        assert_eq!(closed.next_generation_id(), Some(GenerationId(end)));
        assert_eq!(closed.streams(), &some_streams());
    }
}
