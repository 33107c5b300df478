//! Power settings daemon library - exposes modules for testing.

pub mod backup;
pub mod clock;
pub mod config;
pub mod mqtt;
pub mod power;
pub mod registry;
pub mod routes;
pub mod server;
pub mod startup;
pub mod status;
pub mod telemetry;
pub mod update;
