pub mod metrics;

pub use metrics::{collect_metrics, compare, Metrics};
