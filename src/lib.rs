//! Policy promotion pipeline.
//!
//! Decides whether a candidate trading policy is safe and effective enough to
//! replace the active one: walk-forward out-of-sample evaluation, friction
//! stress replay, safety thresholds, and a rolling approval history backed by
//! a versioned policy registry.

pub mod artifacts;
pub mod audit;
pub mod candidate;
pub mod cli;
pub mod config;
pub mod friction;
pub mod gate;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod safety;
pub mod series;
pub mod sim;
pub mod stress;
pub mod synthetic;
pub mod tournament;
pub mod walk_forward;
