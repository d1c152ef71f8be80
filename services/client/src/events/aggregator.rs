//! Event aggregation state, folded between emissions.
//!
//! Two strategies: [`Aggregator::Null`] folds every push into one
//! accumulated event; [`Aggregator::FileId`] keeps one accumulated event per
//! file. A stream upgrades to per-file aggregation once a second
//! subscription arrives and downgrades when the last one is removed;
//! pending state carries over through both transitions.

use super::types::StreamEvent;
use std::collections::HashMap;

/// Accumulated totals across everything currently folded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub counter: u64,
    pub size: u64,
}

#[derive(Debug)]
pub enum Aggregator<E: StreamEvent> {
    Null(Option<E>),
    FileId(HashMap<String, E>),
}

impl<E: StreamEvent> Aggregator<E> {
    pub fn null() -> Self {
        Aggregator::Null(None)
    }

    /// Fold one event in. Identity pushes (counter 0) leave the state
    /// untouched, so `fold(e); fold(identity)` equals `fold(e)`.
    pub fn fold(&mut self, event: E) {
        if event.counter() == 0 {
            return;
        }
        match self {
            Aggregator::Null(slot) => match slot {
                Some(pending) => pending.merge(&event),
                None => *slot = Some(event),
            },
            Aggregator::FileId(map) => match map.get_mut(event.file_uuid()) {
                Some(pending) => pending.merge(&event),
                None => {
                    map.insert(event.file_uuid().to_owned(), event);
                }
            },
        }
    }

    /// Totals across the accumulated state, for the emission rule.
    pub fn totals(&self) -> Totals {
        match self {
            Aggregator::Null(slot) => slot.as_ref().map_or(Totals::default(), |e| Totals {
                counter: e.counter(),
                size: e.size(),
            }),
            Aggregator::FileId(map) => map.values().fold(Totals::default(), |acc, e| Totals {
                counter: acc.counter + e.counter(),
                size: acc.size + e.size(),
            }),
        }
    }

    /// Take every accumulated event, leaving the aggregator empty.
    pub fn drain(&mut self) -> Vec<E> {
        match self {
            Aggregator::Null(slot) => slot.take().into_iter().collect(),
            Aggregator::FileId(map) => {
                let mut events: Vec<E> = map.drain().map(|(_, e)| e).collect();
                // Deterministic emission order.
                events.sort_by(|a, b| a.file_uuid().cmp(b.file_uuid()));
                events
            }
        }
    }

    /// Switch to per-file aggregation, carrying pending state over.
    pub fn upgrade_to_file_id(&mut self) {
        if let Aggregator::Null(slot) = self {
            let mut map = HashMap::new();
            if let Some(pending) = slot.take() {
                map.insert(pending.file_uuid().to_owned(), pending);
            }
            *self = Aggregator::FileId(map);
        }
    }

    /// Switch back to single-slot aggregation, folding pending state
    /// together.
    pub fn downgrade_to_null(&mut self) {
        if let Aggregator::FileId(map) = self {
            let mut events: Vec<E> = map.drain().map(|(_, e)| e).collect();
            events.sort_by(|a, b| a.file_uuid().cmp(b.file_uuid()));
            let mut slot: Option<E> = None;
            for event in events {
                match &mut slot {
                    Some(pending) => pending.merge(&event),
                    None => slot = Some(event),
                }
            }
            *self = Aggregator::Null(slot);
        }
    }
}
