//! Diagnostic statistics

pub mod metrics;

pub use metrics::{CacheStats, MultiplexerStats};
