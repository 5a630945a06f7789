//! Shared, token-authenticated MQTT link for IoT Core style device brokers.
//!
//! [`mqtt::ConnectionManager`] owns the single broker session of a device and
//! multiplexes it between owners; [`config::LinkConfig`] builds one from a TOML
//! file.

pub mod config;
pub mod error;
pub mod mqtt;
pub mod persistence;

mod util;

pub use error::{BridgeError, Result};
