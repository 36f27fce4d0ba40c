//! Meter readings: the raw input of the engine.

pub mod io;
pub mod types;

pub use io::{read_file, InputError, InputFormat};
pub use types::{flow_rate_ml_per_min, rates, FlowSample, MeterId, Reading};
