//! Background services.

pub mod stale_runs;

pub use stale_runs::StaleRunDetector;
