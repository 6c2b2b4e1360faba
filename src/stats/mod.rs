//! Statistics snapshots

pub mod metrics;

pub use metrics::{ConsumerStats, ServerStats, StreamStats};
