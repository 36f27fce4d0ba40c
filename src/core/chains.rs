//! Detection of related consecutive events.
//!
//! Events separated by at most [`MAX_CHAIN_GAP_MINUTES`] are linked into a
//! run; a run is a chain when its categories follow one of a few known
//! household routines.

use crate::core::event::WaterEvent;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_CHAIN_GAP_MINUTES: i64 = 10;

const MORNING_ROUTINE: [&str; 3] = ["toilet", "shower", "faucet"];

/// The parts of an event chain detection looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLink {
    pub category: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl From<&WaterEvent> for ChainLink {
    fn from(event: &WaterEvent) -> Self {
        Self {
            category: event.category.clone(),
            start_time: event.start_time,
            end_time: event.end_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    MorningRoutine,
    Laundry,
    Dishwashing,
}

impl ChainType {
    fn explanation(&self) -> &'static str {
        match self {
            ChainType::MorningRoutine => "Bathroom fixtures used in sequence, typical of a morning routine.",
            ChainType::Laundry => "Several washing machine cycles in a row, typical of a laundry session.",
            ChainType::Dishwashing => "Sink use followed by the dishwasher, typical of cleaning up after a meal.",
        }
    }
}

/// Result of chain analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainAnalysis {
    pub is_chain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_type: Option<ChainType>,
    pub explanation: String,
}

impl ChainAnalysis {
    pub fn none() -> Self {
        Self {
            is_chain: false,
            chain_type: None,
            explanation: String::new(),
        }
    }

    fn found(chain_type: ChainType) -> Self {
        Self {
            is_chain: true,
            chain_type: Some(chain_type),
            explanation: chain_type.explanation().to_string(),
        }
    }
}

/// Look for the first known routine among the given events.
pub fn analyze_chain(links: &[ChainLink]) -> ChainAnalysis {
    if links.len() < 2 {
        return ChainAnalysis::none();
    }

    let mut sorted: Vec<&ChainLink> = links.iter().collect();
    sorted.sort_by_key(|l| l.start_time);

    let max_gap = Duration::minutes(MAX_CHAIN_GAP_MINUTES);
    let mut run: Vec<&str> = vec![sorted[0].category.as_str()];
    for pair in sorted.windows(2) {
        if pair[1].start_time - pair[0].end_time > max_gap {
            if let Some(chain_type) = match_routine(&run) {
                return ChainAnalysis::found(chain_type);
            }
            run.clear();
        }
        run.push(pair[1].category.as_str());
    }

    match_routine(&run)
        .map(ChainAnalysis::found)
        .unwrap_or_else(ChainAnalysis::none)
}

fn match_routine(run: &[&str]) -> Option<ChainType> {
    if run.len() < 2 {
        return None;
    }

    let routine_steps: Vec<usize> = run
        .iter()
        .filter_map(|c| MORNING_ROUTINE.iter().position(|step| step == c))
        .collect();
    if routine_steps.windows(2).any(|w| w[0] < w[1]) {
        return Some(ChainType::MorningRoutine);
    }

    if run.iter().filter(|c| **c == "washing_machine").count() >= 2 {
        return Some(ChainType::Laundry);
    }

    let first_faucet = run.iter().position(|c| *c == "faucet");
    if first_faucet.is_some_and(|i| run[i + 1..].contains(&"dishwasher")) {
        return Some(ChainType::Dishwashing);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn link(category: &str, start_min: i64, end_min: i64) -> ChainLink {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 6, 30, 0).unwrap();
        ChainLink {
            category: category.to_string(),
            start_time: base + Duration::minutes(start_min),
            end_time: base + Duration::minutes(end_min),
        }
    }

    #[test]
    fn test_single_event_is_not_a_chain() {
        assert_eq!(analyze_chain(&[link("toilet", 0, 1)]), ChainAnalysis::none());
        assert!(!analyze_chain(&[]).is_chain);
    }

    #[test]
    fn test_morning_routine() {
        let result = analyze_chain(&[
            link("shower", 3, 12),
            link("toilet", 0, 1),
            link("faucet", 14, 15),
        ]);
        assert!(result.is_chain);
        assert_eq!(result.chain_type, Some(ChainType::MorningRoutine));
        assert!(!result.explanation.is_empty());
    }

    #[test]
    fn test_routine_out_of_order_is_not_a_chain() {
        let result = analyze_chain(&[link("shower", 0, 10), link("toilet", 12, 13)]);
        assert!(!result.is_chain);
    }

    #[test]
    fn test_large_gap_breaks_the_run() {
        let result = analyze_chain(&[link("toilet", 0, 1), link("shower", 30, 40)]);
        assert!(!result.is_chain);
    }

    #[test]
    fn test_laundry_and_dishwashing() {
        let laundry = analyze_chain(&[
            link("washing_machine", 0, 40),
            link("washing_machine", 45, 90),
        ]);
        assert_eq!(laundry.chain_type, Some(ChainType::Laundry));

        let dishes = analyze_chain(&[link("faucet", 0, 2), link("dishwasher", 5, 50)]);
        assert_eq!(dishes.chain_type, Some(ChainType::Dishwashing));
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(ChainAnalysis::found(ChainType::Laundry)).unwrap();
        assert_eq!(json["isChain"], true);
        assert_eq!(json["chainType"], "laundry");
    }
}
