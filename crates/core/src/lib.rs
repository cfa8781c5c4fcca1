//! Shared building blocks for the domain-event broker.
//!
//! This crate holds the error taxonomy and the configuration surface. It does
//! no IO; the transport crate is the only place that talks to a broker.

pub mod config;
pub mod error;

pub use config::{BrokerAddress, BrokerConfig, DEFAULT_BROKER_URL, DEFAULT_EXCHANGE};
pub use error::{BrokerError, BrokerResult, ConfigError};
