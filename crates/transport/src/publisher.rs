//! Publishing events to the main exchange.

use std::ops::{Deref, DerefMut};

use herald_core::{BrokerConfig, BrokerResult, DEFAULT_EXCHANGE};
use herald_events::DomainEvent;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::broker::MessageProperties;
use crate::connection::ConnectionManager;
use crate::endpoint::Endpoint;

/// Sends messages to the main topic exchange as persistent messages.
///
/// No publisher confirms are awaited; the broker's durability contract is
/// the only guarantee.
#[derive(Debug)]
pub struct Publisher {
    conn: ConnectionManager,
}

impl Publisher {
    pub fn connect(
        endpoint: impl Into<Endpoint>,
        exchange: impl Into<String>,
    ) -> BrokerResult<Self> {
        Ok(Self {
            conn: ConnectionManager::connect(endpoint, exchange)?,
        })
    }

    /// Connect to the publish-side broker of `config`.
    pub fn from_config(config: &BrokerConfig) -> BrokerResult<Self> {
        Self::connect(config.publisher_address(), config.exchange.clone())
    }

    /// Publish raw bytes with `routing_key`.
    pub fn publish(&mut self, message: &[u8], routing_key: &str) -> BrokerResult<()> {
        let Some(io) = self.conn.io("publish")? else {
            return Ok(());
        };
        io.runtime.block_on(io.channel.publish(
            io.exchange,
            routing_key,
            message,
            &MessageProperties::persistent_json(),
        ))?;
        debug!(
            exchange = io.exchange,
            routing_key,
            bytes = message.len(),
            "message published"
        );
        Ok(())
    }

    /// Serialize and publish an event under its own routing key.
    pub fn send(&mut self, event: &DomainEvent) -> BrokerResult<()> {
        let body = event.to_json_bytes()?;
        self.publish(&body, event.routing_key())
    }
}

impl Deref for Publisher {
    type Target = ConnectionManager;

    fn deref(&self) -> &ConnectionManager {
        &self.conn
    }
}

impl DerefMut for Publisher {
    fn deref_mut(&mut self) -> &mut ConnectionManager {
        &mut self.conn
    }
}

/// Build an event and publish it to the default exchange over a
/// short-lived connection.
///
/// Returns the event so callers can correlate by `uuid_string`. With a
/// disabled endpoint nothing is sent and the event is still returned.
pub fn publish_event(
    endpoint: impl Into<Endpoint>,
    routing_key: impl Into<String>,
    data: JsonValue,
) -> BrokerResult<DomainEvent> {
    publish_event_to(endpoint, DEFAULT_EXCHANGE, DomainEvent::new(routing_key, data))
}

/// Publish a prepared event to `exchange` over a short-lived connection.
pub fn publish_event_to(
    endpoint: impl Into<Endpoint>,
    exchange: &str,
    event: DomainEvent,
) -> BrokerResult<DomainEvent> {
    let body = event.to_json_bytes()?;
    let mut publisher = Publisher::connect(endpoint, exchange)?;
    publisher.publish(&body, event.routing_key())?;
    publisher.disconnect()?;
    Ok(event)
}
