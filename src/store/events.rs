//! Persisted events.

use crate::core::event::WaterEvent;
use crate::core::window::TimeWindow;
use crate::readings::MeterId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Description stored when an event is flagged by hand without a reason.
pub const MANUAL_ANOMALY_DESCRIPTION: &str = "Manually flagged as anomaly";

/// Optional filters for listing events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Only events starting at or after this instant
    pub start_date: Option<DateTime<Utc>>,
    /// Only events starting before this instant
    pub end_date: Option<DateTime<Utc>>,
    pub category: Option<String>,
}

impl EventFilter {
    fn matches(&self, event: &WaterEvent) -> bool {
        self.start_date.map_or(true, |s| event.start_time >= s)
            && self.end_date.map_or(true, |e| event.start_time < e)
            && self
                .category
                .as_deref()
                .map_or(true, |c| event.category == c)
    }
}

/// Events keyed by id. Ids are assigned in insertion order and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStore {
    next_id: u64,
    events: BTreeMap<u64, WaterEvent>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self {
            next_id: 1,
            events: BTreeMap::new(),
        }
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an event under a fresh id and return the stored copy.
    pub fn insert(&mut self, mut event: WaterEvent) -> &WaterEvent {
        let id = self.next_id;
        self.next_id += 1;
        event.id = id;
        self.events.entry(id).or_insert(event)
    }

    pub fn get(&self, id: u64) -> Option<&WaterEvent> {
        self.events.get(&id)
    }

    /// A meter's events matching the filter, newest first.
    pub fn list(&self, meter: &MeterId, filter: &EventFilter) -> Vec<WaterEvent> {
        let mut events: Vec<WaterEvent> = self
            .events
            .values()
            .filter(|e| &e.meter_id == meter && filter.matches(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        events
    }

    /// A meter's events starting inside the window, oldest first.
    pub fn in_window(&self, meter: &MeterId, window: &TimeWindow) -> Vec<WaterEvent> {
        let mut events: Vec<WaterEvent> = self
            .events
            .values()
            .filter(|e| &e.meter_id == meter && window.contains(e.start_time))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.start_time, e.id));
        events
    }

    /// Relabel an event; a manual label carries full confidence.
    pub fn set_category(&mut self, id: u64, category: &str) -> Option<&WaterEvent> {
        let event = self.events.get_mut(&id)?;
        event.category = category.to_string();
        event.confidence = 100;
        Some(event)
    }

    pub fn set_anomaly_flag(
        &mut self,
        id: u64,
        anomaly: bool,
        reason: Option<&str>,
    ) -> Option<&WaterEvent> {
        let event = self.events.get_mut(&id)?;
        event.anomaly = anomaly;
        event.anomaly_description = if anomaly {
            Some(
                reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or(MANUAL_ANOMALY_DESCRIPTION)
                    .to_string(),
            )
        } else {
            None
        };
        Some(event)
    }

    /// Drop a meter's events that ended before `cutoff`.
    pub fn purge_before(&mut self, meter: &MeterId, cutoff: DateTime<Utc>) -> usize {
        let before = self.events.len();
        self.events
            .retain(|_, e| !(&e.meter_id == meter && e.end_time < cutoff));
        before - self.events.len()
    }

    pub fn remove_meter(&mut self, meter: &MeterId) -> usize {
        let before = self.events.len();
        self.events.retain(|_, e| &e.meter_id != meter);
        before - self.events.len()
    }

    pub fn count(&self, meter: &MeterId) -> usize {
        self.events.values().filter(|e| &e.meter_id == meter).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::UNCLASSIFIED;
    use chrono::{Duration, TimeZone};

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn event(meter: &str, start: i64, category: &str) -> WaterEvent {
        WaterEvent {
            id: 0,
            meter_id: MeterId::new(meter),
            start_time: at(start),
            end_time: at(start + 3),
            duration_seconds: 180,
            volume_ml: 1650,
            peak_flow_rate_ml_per_min: 600,
            avg_flow_rate_ml_per_min: 550,
            category: category.to_string(),
            confidence: 80,
            anomaly: false,
            anomaly_description: None,
            flow_data: Vec::new(),
        }
    }

    #[test]
    fn test_ids_are_sequential() {
        let mut store = EventStore::new();
        assert_eq!(store.insert(event("m1", 0, "toilet")).id, 1);
        assert_eq!(store.insert(event("m1", 10, "shower")).id, 2);
        assert_eq!(store.get(2).map(|e| e.category.as_str()), Some("shower"));
        assert!(store.get(3).is_none());
    }

    #[test]
    fn test_list_filters_and_orders() {
        let mut store = EventStore::new();
        store.insert(event("m1", 0, "toilet"));
        store.insert(event("m1", 10, "shower"));
        store.insert(event("m1", 20, "toilet"));
        store.insert(event("m2", 5, "toilet"));

        let meter = MeterId::new("m1");
        let all = store.list(&meter, &EventFilter::default());
        let starts: Vec<DateTime<Utc>> = all.iter().map(|e| e.start_time).collect();
        assert_eq!(starts, vec![at(20), at(10), at(0)]);

        let toilets = store.list(
            &meter,
            &EventFilter {
                category: Some("toilet".to_string()),
                ..EventFilter::default()
            },
        );
        assert_eq!(toilets.len(), 2);

        let ranged = store.list(
            &meter,
            &EventFilter {
                start_date: Some(at(5)),
                end_date: Some(at(20)),
                category: None,
            },
        );
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].category, "shower");
    }

    #[test]
    fn test_set_category_and_flag() {
        let mut store = EventStore::new();
        let id = store.insert(event("m1", 0, UNCLASSIFIED)).id;

        let updated = store.set_category(id, "faucet").unwrap();
        assert_eq!(updated.category, "faucet");
        assert_eq!(updated.confidence, 100);

        let flagged = store.set_anomaly_flag(id, true, None).unwrap();
        assert!(flagged.anomaly);
        assert_eq!(
            flagged.anomaly_description.as_deref(),
            Some(MANUAL_ANOMALY_DESCRIPTION)
        );

        let flagged = store.set_anomaly_flag(id, true, Some("Running at 3am")).unwrap();
        assert_eq!(flagged.anomaly_description.as_deref(), Some("Running at 3am"));

        let cleared = store.set_anomaly_flag(id, false, Some("ignored")).unwrap();
        assert!(!cleared.anomaly);
        assert!(cleared.anomaly_description.is_none());

        assert!(store.set_category(99, "faucet").is_none());
    }

    #[test]
    fn test_purge_and_remove_are_per_meter() {
        let mut store = EventStore::new();
        store.insert(event("m1", 0, "toilet"));
        store.insert(event("m1", 100, "toilet"));
        store.insert(event("m2", 0, "toilet"));

        let m1 = MeterId::new("m1");
        assert_eq!(store.purge_before(&m1, at(50)), 1);
        assert_eq!(store.count(&m1), 1);
        assert_eq!(store.remove_meter(&m1), 1);
        assert_eq!(store.count(&MeterId::new("m2")), 1);
    }
}
