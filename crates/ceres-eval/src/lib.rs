//! Evaluator-side infrastructure for the search core.
//!
//! [`gateway::DeviceGateway`] fronts one or more device evaluators:
//! serialised access, least-loaded routing, minimum-batch padding and timing
//! statistics. [`cache::CachingEvaluator`] is a decorator that remembers
//! evaluations across searches. Both implement `BatchedEvaluator`, so they
//! stack in any order under the search driver.

pub mod cache;
pub mod gateway;

#[cfg(test)]
mod test_stub;

pub use cache::{CacheStats, CachingEvaluator, EvalCache};
pub use gateway::{DeviceGateway, GatewayStats};
