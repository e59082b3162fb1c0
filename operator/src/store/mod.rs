//! The interruption event store: a process-wide, deduplicating,
//! cancellation-aware registry. Guarded by a plain `std::sync::Mutex` around
//! a `HashMap` -- every operation here is a short, non-async, CPU-only
//! critical section, so a lock-free map would be needless ceremony.

use chrono::{DateTime, Utc};
use nth_types::InterruptionEvent;
use std::collections::HashMap;
use std::sync::Mutex;

/// One entry per EventID. `event` is `None` for a tombstone: a cancel or
/// ignore that arrived before the event itself was ever added.
#[derive(Debug, Clone)]
struct Entry {
    event: Option<InterruptionEvent>,
    ignore: bool,
    in_progress: bool,
    processed: bool,
    drained: bool,
    node_processed: bool,
}

impl Default for Entry {
    fn default() -> Self {
        Entry {
            event: None,
            ignore: false,
            in_progress: false,
            processed: false,
            drained: false,
            node_processed: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct EventStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add(event): replaces only mutable ack-state fields if already
    /// present (never downgrades `in_progress`/`processed`); inserts fresh
    /// otherwise. A tombstone left by an earlier `cancel`/`ignore` is
    /// filled in with the event data but keeps its ignore/processed state.
    pub fn add(&self, event: InterruptionEvent) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&event.event_id) {
            Some(existing) if existing.event.is_some() => {
                let current = existing.event.as_mut().unwrap();
                current.ack = event.ack;
                current.description = event.description;
                current.end_time = event.end_time;
                current.state = event.state;
            }
            Some(existing) => {
                existing.event = Some(event);
            }
            None => {
                entries.insert(
                    event.event_id.clone(),
                    Entry {
                        event: Some(event),
                        ..Default::default()
                    },
                );
            }
        }
    }

    /// Cancel(eventID): marks ignore=true; if not yet in progress, also
    /// marks processed so the scheduler never dispatches it. Remembers the
    /// cancellation even if the event was never added (tombstone).
    pub fn cancel(&self, event: &InterruptionEvent) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(event.event_id.clone()).or_default();
        entry.ignore = true;
        if !entry.in_progress {
            entry.processed = true;
        }
        match &mut entry.event {
            Some(existing) => existing.state = event.state,
            None => entry.event = Some(event.clone()),
        }
    }

    /// Ignore(eventID): used on startup for the `event-id` label found on a
    /// previously-cordoned node, so it never re-triggers.
    pub fn ignore(&self, event_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(event_id.to_string()).or_default();
        entry.ignore = true;
        entry.processed = true;
    }

    /// GetActiveEvent + claim, performed atomically under one lock: the
    /// next event where `!ignore && !in_progress && !processed && now >=
    /// StartTime - leadTime`, ordered by StartTime then EventID. Marking
    /// `in_progress` here (rather than in a separate call) is what makes
    /// "once InProgress=true, no other worker may pick the same event"
    /// hold even though the dispatcher is single-threaded and could
    /// otherwise call GetActiveEvent and a later "claim" non-atomically.
    pub fn claim_next_active(&self, lead_time: chrono::Duration, now: DateTime<Utc>) -> Option<InterruptionEvent> {
        let mut entries = self.entries.lock().unwrap();
        let mut candidate: Option<(String, DateTime<Utc>)> = None;
        for (id, entry) in entries.iter() {
            if entry.ignore || entry.in_progress || entry.processed {
                continue;
            }
            let Some(event) = &entry.event else { continue };
            if now < event.start_time - lead_time {
                continue;
            }
            candidate = match candidate {
                None => Some((id.clone(), event.start_time)),
                Some((best_id, best_start)) => {
                    if event.start_time < best_start || (event.start_time == best_start && *id < best_id) {
                        Some((id.clone(), event.start_time))
                    } else {
                        Some((best_id, best_start))
                    }
                }
            };
        }
        let (id, _) = candidate?;
        let entry = entries.get_mut(&id).unwrap();
        entry.in_progress = true;
        entry.event.clone()
    }

    /// ShouldUncordon(nodeName): true iff every entry targeting this node
    /// is ignored/canceled (vacuously true if no entry targets it at all).
    pub fn should_uncordon(&self, node_name: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.values().all(|entry| match &entry.event {
            Some(event) if event.node_name == node_name => entry.ignore,
            _ => true,
        })
    }

    pub fn mark_processed(&self, event_id: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(event_id) {
            entry.processed = true;
        }
    }

    pub fn mark_drained(&self, event_id: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(event_id) {
            entry.drained = true;
        }
    }

    pub fn mark_node_processed(&self, event_id: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(event_id) {
            entry.node_processed = true;
        }
    }

    #[cfg(test)]
    fn is_in_progress(&self, event_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(event_id)
            .is_some_and(|e| e.in_progress)
    }

    #[cfg(test)]
    fn is_processed(&self, event_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(event_id)
            .is_some_and(|e| e.processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use nth_types::{AckState, EventState, Kind, MonitorKind};

    fn event(id: &str, node: &str, start: DateTime<Utc>) -> InterruptionEvent {
        InterruptionEvent {
            event_id: id.to_string(),
            kind: Kind::SpotItn,
            source: MonitorKind::SpotItnMetadata,
            node_name: node.to_string(),
            instance_id: None,
            provider_id: None,
            instance_type: None,
            autoscaling_group_name: None,
            state: EventState::Active,
            start_time: start,
            end_time: None,
            description: String::new(),
            code: None,
            is_managed: true,
            ack: AckState::None,
        }
    }

    #[test]
    fn dedup_adding_same_id_twice_does_not_reopen_a_processed_event() {
        let store = EventStore::new();
        let now = Utc::now();
        store.add(event("e1", "node-a", now - Duration::seconds(5)));
        let claimed = store.claim_next_active(Duration::zero(), now).unwrap();
        assert_eq!(claimed.event_id, "e1");
        store.mark_processed("e1");

        // The same monitor re-observes the same event (e.g. after a
        // restart) and calls Add again.
        store.add(event("e1", "node-a", now - Duration::seconds(5)));
        assert!(store.claim_next_active(Duration::zero(), now).is_none());
    }

    #[test]
    fn cancel_before_add_leaves_a_tombstone() {
        let store = EventStore::new();
        let now = Utc::now();
        let mut canceled = event("e2", "node-a", now);
        canceled.state = EventState::Canceled;
        store.cancel(&canceled);

        store.add(event("e2", "node-a", now - Duration::seconds(1)));
        assert!(store.claim_next_active(Duration::zero(), now).is_none());
    }

    #[test]
    fn cancel_during_drain_does_not_unclaim() {
        let store = EventStore::new();
        let now = Utc::now();
        store.add(event("e3", "node-a", now - Duration::seconds(1)));
        let claimed = store.claim_next_active(Duration::zero(), now).unwrap();
        assert!(store.is_in_progress("e3"));

        let mut canceled = claimed.clone();
        canceled.state = EventState::Canceled;
        store.cancel(&canceled);

        // still in progress: the in-flight drain is not aborted.
        assert!(store.is_in_progress("e3"));
        assert!(!store.is_processed("e3"), "cancel during drain must not force-complete it");
    }

    #[test]
    fn ordering_is_by_start_time_then_event_id() {
        let store = EventStore::new();
        let now = Utc::now();
        store.add(event("zzz", "node-a", now - Duration::seconds(10)));
        store.add(event("aaa", "node-b", now - Duration::seconds(10)));
        let claimed = store.claim_next_active(Duration::zero(), now).unwrap();
        assert_eq!(claimed.event_id, "aaa", "ties break by EventID ascending");
    }

    #[test]
    fn lead_time_defers_dispatch() {
        let store = EventStore::new();
        let now = Utc::now();
        store.add(event("e4", "node-a", now + Duration::seconds(30)));
        assert!(store.claim_next_active(Duration::seconds(10), now).is_none());
        assert!(store
            .claim_next_active(Duration::seconds(60), now)
            .is_some());
    }

    #[test]
    fn should_uncordon_true_when_no_entries_for_node() {
        let store = EventStore::new();
        assert!(store.should_uncordon("node-a"));
    }

    #[test]
    fn should_uncordon_false_while_another_non_ignored_event_targets_node() {
        let store = EventStore::new();
        let now = Utc::now();
        store.add(event("e5", "node-a", now));
        store.add(event("e6", "node-a", now));
        let mut canceled = event("e5", "node-a", now);
        canceled.state = EventState::Canceled;
        store.cancel(&canceled);

        assert!(!store.should_uncordon("node-a"), "e6 still non-ignored");
    }

    #[test]
    fn should_uncordon_true_once_every_event_for_node_is_ignored() {
        let store = EventStore::new();
        let now = Utc::now();
        store.add(event("e7", "node-a", now));
        let mut canceled = event("e7", "node-a", now);
        canceled.state = EventState::Canceled;
        store.cancel(&canceled);
        assert!(store.should_uncordon("node-a"));
    }

    #[test]
    fn worker_budget_at_most_one_claim_per_event() {
        let store = EventStore::new();
        let now = Utc::now();
        store.add(event("e8", "node-a", now - Duration::seconds(1)));
        assert!(store.claim_next_active(Duration::zero(), now).is_some());
        assert!(store.claim_next_active(Duration::zero(), now).is_none());
    }
}
