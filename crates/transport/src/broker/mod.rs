//! Broker seam.
//!
//! The engine talks to a broker through two traits:
//!
//! - [`Connector`] opens a connection and hands back its single [`Channel`].
//! - [`Channel`] exposes the AMQP 0-9-1 operations the engine needs: exchange
//!   and queue declaration, bindings, publish, consume, get, ack and reject.
//!
//! Every `Channel` method takes `&mut self`. A channel is never shared: the
//! thread that owns the connection manager is the only one that drives it,
//! and worker threads reach it only by posting intents to that thread.
//!
//! Implementations:
//! - [`amqp::AmqpConnector`]: `lapin` client for RabbitMQ-compatible brokers.
//! - [`in_memory::InMemoryBroker`]: single-process broker for tests and dev.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use herald_core::BrokerResult;

pub mod amqp;
pub mod in_memory;

/// `delivery_mode` value for messages the broker must persist.
pub const PERSISTENT: u8 = 2;

/// Message header table (`x-death` and friends).
pub type Headers = BTreeMap<String, HeaderValue>;

/// A header field value, reduced to what the engine needs to read and carry.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Seconds since the Unix epoch.
    Timestamp(u64),
    Array(Vec<HeaderValue>),
    Table(Headers),
    Void,
}

impl HeaderValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[HeaderValue]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Headers> {
        match self {
            Self::Table(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    /// Delete the exchange once its last binding is removed.
    pub auto_delete: bool,
}

impl ExchangeOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Broker-specific queue arguments, passed through verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-message-ttl` in milliseconds
    pub message_ttl: Option<u32>,
    /// `x-expires` in milliseconds
    pub expires: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: QueueArguments,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    pub fn with_arguments(mut self, arguments: QueueArguments) -> Self {
        self.arguments = arguments;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Basic properties carried with a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
    /// Per-message TTL in milliseconds, as a decimal string.
    pub expiration: Option<String>,
    pub headers: Option<Headers>,
}

impl MessageProperties {
    /// Persistent JSON message without headers.
    pub fn persistent_json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            delivery_mode: Some(PERSISTENT),
            ..Self::default()
        }
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.as_ref().and_then(|h| h.get(key))
    }
}

/// A message handed out by a consumer or a get.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or reject this delivery.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Result of a get: the message plus how many are left behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub delivery: Delivery,
    pub message_count: u32,
}

/// Deliveries of one consumer. Ends when the broker cancels the consumer.
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connect and open the connection's channel.
    ///
    /// Network and authentication failures map to `BrokerUnavailable`.
    async fn open(&self) -> BrokerResult<Box<dyn Channel>>;
}

/// One broker channel, owned by exactly one connection manager.
#[async_trait]
pub trait Channel: Send {
    async fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BrokerResult<()>;

    async fn declare_queue(&mut self, name: &str, options: &QueueOptions)
    -> BrokerResult<QueueState>;

    /// Passive declare: `None` when the queue does not exist.
    ///
    /// Must not break this channel when the queue is missing.
    async fn inspect_queue(&mut self, name: &str) -> BrokerResult<Option<QueueState>>;

    async fn delete_queue(&mut self, name: &str) -> BrokerResult<()>;

    async fn bind_queue(&mut self, queue: &str, exchange: &str, binding_key: &str)
    -> BrokerResult<()>;

    /// Limit unacknowledged deliveries per consumer created afterwards.
    async fn set_prefetch(&mut self, count: u16) -> BrokerResult<()>;

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()>;

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    /// Fetch one message without a consumer.
    async fn get(&mut self, queue: &str) -> BrokerResult<Option<Fetched>>;

    async fn ack(&mut self, delivery_tag: u64) -> BrokerResult<()>;

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    /// Close the channel and its connection. Unacked deliveries are requeued
    /// by the broker.
    async fn close(&mut self) -> BrokerResult<()>;
}
