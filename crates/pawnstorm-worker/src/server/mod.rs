pub mod config;
pub mod heartbeat;
pub mod listener;
pub mod session;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;
