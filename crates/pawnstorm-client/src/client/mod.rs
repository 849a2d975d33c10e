pub mod config;
pub mod connection;
pub mod directory;
pub mod orchestrator;
pub mod telemetry;
