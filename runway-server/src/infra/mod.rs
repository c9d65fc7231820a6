pub mod config;
pub mod daemon;
pub mod shutdown;
pub mod startup;
pub mod telemetry;
