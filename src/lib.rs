mod config;
mod constants;
mod errors;
mod machine;
mod metrics;
mod registry;
mod snapshot;
pub mod utils;

pub use config::*;
pub use errors::*;
pub use machine::*;
pub use metrics::*;
pub use registry::*;
pub use snapshot::*;
pub use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
//-----------------------------------------------------------
// Autometrics
/// autometrics: https://docs.autometrics.dev/rust/adding-alerts-and-slos
use autometrics::objectives::Objective;
use autometrics::objectives::ObjectiveLatency;
use autometrics::objectives::ObjectivePercentile;
const API_SLO: Objective = Objective::new("api")
    .success_rate(ObjectivePercentile::P99_9)
    .latency(ObjectiveLatency::Ms10, ObjectivePercentile::P99);
