//! Stable per-turn identifiers for chunked notifications.
//!
//! The peer streams assistant text and reasoning ("thought") text as bare
//! fragments with no shared identifier. To let the reducer merge fragments of
//! one logical message, the enricher hands out a fresh id the first time
//! either kind appears after a turn boundary and reuses it for subsequent
//! fragments of the same kind. A tool call starting or a new user message is
//! a turn boundary: both ids reset.

use uuid::Uuid;

/// Per-agent enrichment state. Lives as an explicit field on the managed
/// agent record and is only touched by the enrichment step.
#[derive(Debug, Default)]
pub struct EventEnricher {
    current_message_id: Option<String>,
    current_thought_id: Option<String>,
}

impl EventEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for the current assistant message, minted on first use.
    pub fn message_id(&mut self) -> String {
        self.current_message_id
            .get_or_insert_with(fresh_id)
            .clone()
    }

    /// Id for the current thought, minted on first use.
    pub fn thought_id(&mut self) -> String {
        self.current_thought_id
            .get_or_insert_with(fresh_id)
            .clone()
    }

    /// Turn boundary: the next fragment of either kind starts a new message.
    pub fn reset(&mut self) {
        self.current_message_id = None;
        self.current_thought_id = None;
    }
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_of_one_message_share_an_id() {
        let mut enricher = EventEnricher::new();
        let first = enricher.message_id();
        let second = enricher.message_id();
        assert_eq!(first, second);
    }

    #[test]
    fn message_and_thought_ids_are_independent() {
        let mut enricher = EventEnricher::new();
        let message = enricher.message_id();
        let thought = enricher.thought_id();
        assert_ne!(message, thought);

        // Interleaving kinds does not reset either id.
        assert_eq!(enricher.message_id(), message);
        assert_eq!(enricher.thought_id(), thought);
    }

    #[test]
    fn reset_mints_new_ids_for_both_kinds() {
        let mut enricher = EventEnricher::new();
        let message = enricher.message_id();
        let thought = enricher.thought_id();

        enricher.reset();

        assert_ne!(enricher.message_id(), message);
        assert_ne!(enricher.thought_id(), thought);
    }
}
