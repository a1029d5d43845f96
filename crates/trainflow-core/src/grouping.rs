use std::collections::BTreeMap;

use trainflow_parser::RawEvent;

use crate::trip::TripKey;

/// A normalized event tagged with its position in the ingestion order.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    pub sequence: usize,
    pub event: RawEvent,
}

pub type Grouping = BTreeMap<TripKey, Vec<SequencedEvent>>;

/// Partitions events by (train identifier, service date). Sequence numbers follow the
/// iteration order of `events`; nothing is dropped, duplicates included.
pub fn group_events(events: impl IntoIterator<Item = RawEvent>) -> Grouping {
    let mut grouping = Grouping::new();
    for (sequence, event) in events.into_iter().enumerate() {
        let key = TripKey::new(event.train_ident.clone(), event.service_date);
        grouping
            .entry(key)
            .or_default()
            .push(SequencedEvent { sequence, event });
    }
    grouping
}

pub fn event_count(grouping: &Grouping) -> usize {
    grouping.values().map(Vec::len).sum()
}
