pub mod attempt;
pub mod health;
pub mod registry;
pub mod router;

pub use health::{Admission, HealthTracker, ProviderHealth};
pub use registry::ProviderRegistry;
pub use router::{RouteOutcome, Router};
