//! Raw reading storage.

use crate::core::window::TimeWindow;
use crate::readings::{MeterId, Reading};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Readings per meter, each list sorted by timestamp with unique timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadingStore {
    meters: BTreeMap<MeterId, Vec<Reading>>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a reading. A reading at an existing timestamp replaces it.
    pub fn insert(&mut self, meter: &MeterId, reading: Reading) {
        let list = self.meters.entry(meter.clone()).or_default();
        match list.binary_search_by_key(&reading.timestamp, |r| r.timestamp) {
            Ok(i) => list[i] = reading,
            Err(i) => list.insert(i, reading),
        }
    }

    /// Readings with a timestamp in the window, in order.
    pub fn in_window(&self, meter: &MeterId, window: &TimeWindow) -> &[Reading] {
        let Some(list) = self.meters.get(meter) else {
            return &[];
        };
        let from = list.partition_point(|r| r.timestamp < window.start());
        let to = list.partition_point(|r| r.timestamp < window.end());
        &list[from..to]
    }

    pub fn last(&self, meter: &MeterId) -> Option<&Reading> {
        self.meters.get(meter).and_then(|list| list.last())
    }

    pub fn has_meter(&self, meter: &MeterId) -> bool {
        self.meters.contains_key(meter)
    }

    pub fn count(&self, meter: &MeterId) -> usize {
        self.meters.get(meter).map_or(0, Vec::len)
    }

    /// Drop readings older than `cutoff`. Returns how many were removed.
    pub fn purge_before(&mut self, meter: &MeterId, cutoff: DateTime<Utc>) -> usize {
        let Some(list) = self.meters.get_mut(meter) else {
            return 0;
        };
        let keep_from = list.partition_point(|r| r.timestamp < cutoff);
        list.drain(..keep_from);
        keep_from
    }

    /// Forget every reading of a meter. Returns how many were removed.
    pub fn remove_meter(&mut self, meter: &MeterId) -> usize {
        self.meters.remove(meter).map_or(0, |list| list.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    #[test]
    fn test_insert_keeps_order_and_last_wins() {
        let meter = MeterId::new("m1");
        let mut store = ReadingStore::new();
        store.insert(&meter, Reading::new(at(2), 20));
        store.insert(&meter, Reading::new(at(0), 0));
        store.insert(&meter, Reading::new(at(1), 10));
        store.insert(&meter, Reading::new(at(1), 15));

        let all = store.in_window(&meter, &TimeWindow::new(at(0), at(10)).unwrap());
        let values: Vec<u32> = all.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![0, 15, 20]);
        assert_eq!(store.last(&meter).map(|r| r.value), Some(20));
    }

    #[test]
    fn test_window_is_half_open() {
        let meter = MeterId::new("m1");
        let mut store = ReadingStore::new();
        for i in 0..5 {
            store.insert(&meter, Reading::new(at(i), 100));
        }
        let window = TimeWindow::new(at(1), at(3)).unwrap();
        assert_eq!(store.in_window(&meter, &window).len(), 2);
        assert!(store
            .in_window(&MeterId::new("other"), &window)
            .is_empty());
    }

    #[test]
    fn test_purge_before() {
        let meter = MeterId::new("m1");
        let mut store = ReadingStore::new();
        for i in 0..5 {
            store.insert(&meter, Reading::new(at(i), 100));
        }
        assert_eq!(store.purge_before(&meter, at(3)), 3);
        assert_eq!(store.count(&meter), 2);
        assert_eq!(store.remove_meter(&meter), 2);
        assert_eq!(store.count(&meter), 0);
    }
}
