//! Telemetry acquisition engine for OBD2 vehicles
//!
//! A single channel task owns the adapter. It cycles through the parameter
//! registry, publishes decoded values into a shared cache, and serves
//! on-demand diagnostic commands between transactions. Readers take
//! consistent snapshots of the cache at any rate without touching the
//! channel.

pub mod cache;
pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod elm327;
pub mod engine;
pub mod error;
pub mod health;
pub mod registry;
mod thread_util;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Snapshot, ValueCache};
pub use channel::{
    ChannelAdapter, Command, ConnectionStatus, DeviceStatus, Payload, Protocol, Reply,
    TransportError,
};
pub use config::{EngineConfig, LogLevel};
pub use diagnostics::{Answer, Dtc, FuelStatus, FuelSystemState, MonitorStatus};
pub use elm327::Elm327Channel;
pub use engine::Engine;
pub use error::EngineError;
pub use health::ConnectionHealth;
pub use registry::{Parameter, ParameterId, ParameterRegistry};
