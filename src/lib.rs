//! Simulated temperature sensor for an MQTT based IoT hub.
//!
//! The device publishes one reading per second and pauses when it receives a
//! `{"command":"pause","duration":<ms>}` cloud-to-device message.

pub mod client;
pub mod command;
pub mod config;
pub mod connection_string;
pub mod error;
pub mod packet;
pub mod pause;
pub mod producer;
pub mod telemetry;
pub mod transport;
