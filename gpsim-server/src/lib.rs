//! gpsim Server Library
//!
//! Exposes server components for integration testing.

pub mod api;
pub mod config;
pub mod jobs;
pub mod run;
pub mod sessions;
pub mod settings;
pub mod state;
pub mod telemetry;
pub mod ws;
