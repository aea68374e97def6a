//! modpoller - register polling engine
//!
//! Polls Modbus devices in batched range reads, decodes raw words into typed
//! values, computes derived values and serves them over HTTP and MQTT.

pub mod api;
pub mod config;
pub mod decode;
pub mod derive;
pub mod device;
pub mod error;
pub mod modbus;
pub mod mqtt;
pub mod planner;
pub mod register;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use decode::Value;
pub use device::{Device, Gateway};
pub use register::{Bank, PollTier, RegisterDescriptor};
pub use store::{RegisterUpdate, Snapshot, Status};
