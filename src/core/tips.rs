//! Conservation tips.
//!
//! Tips are selected from a static rule table keyed by category share. The
//! table is walked in order, so its order is the priority order. At most
//! [`MAX_TIPS`] tips are returned and at least one general tip is always
//! appended.

use crate::core::aggregator::CategoryUsage;
use serde::{Deserialize, Serialize};

/// Upper bound on returned tips.
pub const MAX_TIPS: usize = 5;

/// Upper bound on general tips appended after the matched ones.
const MAX_GENERAL_TIPS: usize = 2;

/// A human-readable conservation tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Category the tip targets, or "general"
    #[serde(rename = "type")]
    pub kind: String,
    /// 1 is the most important
    pub priority: u8,
}

struct TipRule {
    category: &'static str,
    /// Share of the category base (percent) that must be exceeded
    min_share: f64,
    id: &'static str,
    title: &'static str,
    description: &'static str,
}

const RULES: &[TipRule] = &[
    TipRule {
        category: "leak",
        min_share: 0.0,
        id: "leak-repair",
        title: "Fix Detected Leaks",
        description: "Continuous low flow was detected. Check toilets, faucets and visible pipes; a running toilet alone can waste hundreds of liters a day.",
    },
    TipRule {
        category: "toilet",
        min_share: 25.0,
        id: "toilet-dual-flush",
        title: "Install a Dual-Flush Toilet",
        description: "Toilets account for a large share of your usage. A dual-flush toilet or tank insert can cut flush volume by a third or more.",
    },
    TipRule {
        category: "shower",
        min_share: 30.0,
        id: "shower-shorter",
        title: "Take Shorter Showers",
        description: "Showers are your largest use. Cutting one minute per shower or fitting a low-flow head saves several liters every day.",
    },
    TipRule {
        category: "irrigation",
        min_share: 20.0,
        id: "irrigation-schedule",
        title: "Water Early or Late",
        description: "Irrigate before sunrise or after sunset to reduce evaporation, and skip watering after rain.",
    },
    TipRule {
        category: "washing_machine",
        min_share: 15.0,
        id: "laundry-full-loads",
        title: "Run Full Laundry Loads",
        description: "Run the washing machine only with full loads and use the eco cycle where available.",
    },
    TipRule {
        category: "dishwasher",
        min_share: 10.0,
        id: "dishwasher-full-loads",
        title: "Fill the Dishwasher",
        description: "Run the dishwasher only when full and skip pre-rinsing dishes under the tap.",
    },
    TipRule {
        category: "faucet",
        min_share: 20.0,
        id: "faucet-aerators",
        title: "Fit Faucet Aerators",
        description: "Faucet use is high. Aerators reduce flow without lowering pressure, and turning the tap off while brushing helps too.",
    },
];

const GENERAL_TIPS: &[(&str, &str, &str)] = &[
    (
        "general-check-leaks",
        "Check for Leaks",
        "Regularly check faucets, toilets and pipes for leaks. Even small leaks waste significant amounts of water.",
    ),
    (
        "general-daily-habits",
        "Save Water Daily",
        "Small changes in daily habits add up to significant water savings over time.",
    ),
];

/// Select tips for a category breakdown.
pub fn generate_tips(categories: &[CategoryUsage]) -> Vec<Recommendation> {
    let share = |name: &str| {
        categories
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.percentage)
    };

    let mut tips: Vec<Recommendation> = RULES
        .iter()
        .filter(|rule| share(rule.category).is_some_and(|s| s > rule.min_share))
        .take(MAX_TIPS - 1)
        .map(|rule| Recommendation {
            id: rule.id.to_string(),
            title: rule.title.to_string(),
            description: rule.description.to_string(),
            kind: rule.category.to_string(),
            priority: 0,
        })
        .collect();

    let general = MAX_GENERAL_TIPS.min(MAX_TIPS - tips.len());
    tips.extend(
        GENERAL_TIPS
            .iter()
            .take(general)
            .map(|(id, title, description)| Recommendation {
                id: id.to_string(),
                title: title.to_string(),
                description: description.to_string(),
                kind: "general".to_string(),
                priority: 0,
            }),
    );

    for (i, tip) in tips.iter_mut().enumerate() {
        tip.priority = (i + 1) as u8;
    }
    tips
}

/// Clean up an externally generated tip list.
///
/// Tips without a title or description are dropped, priorities are clamped
/// to 1..=5 and the list is capped at [`MAX_TIPS`]. Returns `None` when
/// nothing usable is left.
pub fn validate_recommendations(tips: Vec<Recommendation>) -> Option<Vec<Recommendation>> {
    let valid: Vec<Recommendation> = tips
        .into_iter()
        .filter(|t| !t.title.trim().is_empty() && !t.description.trim().is_empty())
        .take(MAX_TIPS)
        .map(|mut t| {
            t.priority = t.priority.clamp(1, MAX_TIPS as u8);
            if t.kind.trim().is_empty() {
                t.kind = "general".to_string();
            }
            t
        })
        .collect();

    if valid.is_empty() {
        None
    } else {
        Some(valid)
    }
}
