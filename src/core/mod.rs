//! Core functionality of the water usage agent.
//!
//! This module contains:
//! - The event model and per-meter segmentation of reading streams
//! - Query windows and chart granularity
//! - Usage aggregation and display formatting
//! - Conservation tips and event-chain detection

pub mod aggregator;
pub mod chains;
pub mod event;
pub mod format;
pub mod segmenter;
pub mod tips;
pub mod window;

// Re-export commonly used types
pub use aggregator::{aggregate, AggregateOptions, CategoryUsage, FlowPoint, UsageSummary};
pub use chains::{analyze_chain, ChainAnalysis, ChainLink, ChainType};
pub use event::{ClosedEvent, OpenEvent, WaterEvent};
pub use format::{format_event, FormattedEvent};
pub use segmenter::{segment_readings, MeterSegmenter, SegmentError, SegmentStep};
pub use tips::{generate_tips, Recommendation};
pub use window::{Granularity, QueryError, TimeWindow};
