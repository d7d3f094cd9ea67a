pub mod cli;
pub mod engine_metrics;
pub mod generator;
pub mod heartbeat;
pub mod orders;
pub mod registry;
pub mod session;
pub mod task;
