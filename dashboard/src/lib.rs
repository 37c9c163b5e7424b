//! Live telemetry dashboard: relays MQTT sensor readings to push-stream viewers
//! and answers historical and statistics queries over the readings store.

pub mod config;
pub mod errors;
pub mod history;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod relay;
pub mod rest;
pub mod store;
pub mod stream;
pub mod validate;

pub use errors::{Error, Result};
