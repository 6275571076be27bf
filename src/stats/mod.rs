pub mod aggregator;
pub mod types;

pub use aggregator::StatsAggregator;
pub use types::{GatewayStats, HourlyStat, ProviderCounters, ProviderStats, Totals};
