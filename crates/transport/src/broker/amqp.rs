//! AMQP 0-9-1 adapter on top of `lapin`.

use std::fmt;

use async_trait::async_trait;
use futures::StreamExt;
use herald_core::{BrokerAddress, BrokerError, BrokerResult};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, ByteArray, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tracing::debug;

use super::{
    Channel, Connector, Delivery, DeliveryStream, ExchangeKind, ExchangeOptions, Fetched,
    HeaderValue, Headers, MessageProperties, QueueArguments, QueueOptions, QueueState,
};

const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
const ARG_MESSAGE_TTL: &str = "x-message-ttl";
const ARG_EXPIRES: &str = "x-expires";

/// Connects to a RabbitMQ-compatible broker by URL.
#[derive(Clone)]
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl fmt::Debug for AmqpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConnector")
            .field("url", &BrokerAddress::amqp(self.url.clone()).to_string())
            .finish()
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn open(&self) -> BrokerResult<Box<dyn Channel>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::unavailable(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::unavailable(e.to_string()))?;
        debug!(channel_id = channel.id(), "amqp channel opened");
        Ok(Box::new(AmqpChannel {
            connection,
            channel,
        }))
    }
}

/// A `lapin` connection with its one working channel.
pub struct AmqpChannel {
    connection: Connection,
    channel: lapin::Channel,
}

fn protocol(err: lapin::Error) -> BrokerError {
    BrokerError::protocol(err.to_string())
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BrokerResult<()> {
        let kind = match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(protocol)
    }

    async fn declare_queue(
        &mut self,
        name: &str,
        options: &QueueOptions,
    ) -> BrokerResult<QueueState> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(&options.arguments),
            )
            .await
            .map_err(protocol)?;
        Ok(QueueState {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn inspect_queue(&mut self, name: &str) -> BrokerResult<Option<QueueState>> {
        // A failed passive declare closes the channel it ran on.
        let probe = self.connection.create_channel().await.map_err(protocol)?;
        let result = probe
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        match result {
            Ok(queue) => {
                let _ = probe.close(200, "probe done").await;
                Ok(Some(QueueState {
                    message_count: queue.message_count(),
                    consumer_count: queue.consumer_count(),
                }))
            }
            Err(lapin::Error::ProtocolError(err)) => {
                debug!(queue = name, error = %err, "passive declare failed");
                Ok(None)
            }
            Err(err) => Err(protocol(err)),
        }
    }

    async fn delete_queue(&mut self, name: &str) -> BrokerResult<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(protocol)
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)
    }

    async fn set_prefetch(&mut self, count: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(protocol)
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(protocol)?
            .await
            .map_err(protocol)?;
        Ok(())
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)?;
        Ok(consumer
            .map(|item| item.map(from_lapin_delivery).map_err(protocol))
            .boxed())
    }

    async fn get(&mut self, queue: &str) -> BrokerResult<Option<Fetched>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions::default())
            .await
            .map_err(protocol)?;
        Ok(message.map(|m| Fetched {
            message_count: m.message_count,
            delivery: from_lapin_delivery(m.delivery),
        }))
    }

    async fn ack(&mut self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(protocol)
    }

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(protocol)
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.connection
            .close(200, "normal shutdown")
            .await
            .map_err(protocol)
    }
}

fn queue_arguments(args: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(dlx) = &args.dead_letter_exchange {
        table.insert(
            ARG_DEAD_LETTER_EXCHANGE.into(),
            AMQPValue::LongString(dlx.as_str().into()),
        );
    }
    if let Some(ttl) = args.message_ttl {
        table.insert(ARG_MESSAGE_TTL.into(), AMQPValue::LongLongInt(i64::from(ttl)));
    }
    if let Some(expires) = args.expires {
        table.insert(ARG_EXPIRES.into(), AMQPValue::LongLongInt(i64::from(expires)));
    }
    table
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        props = props.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(mode) = properties.delivery_mode {
        props = props.with_delivery_mode(mode);
    }
    if let Some(expiration) = &properties.expiration {
        props = props.with_expiration(ShortString::from(expiration.clone()));
    }
    if let Some(headers) = &properties.headers {
        props = props.with_headers(to_field_table(headers));
    }
    props
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        delivery_mode: *props.delivery_mode(),
        expiration: props.expiration().as_ref().map(|s| s.as_str().to_string()),
        headers: props.headers().as_ref().map(from_field_table),
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
        HeaderValue::Timestamp(v) => AMQPValue::Timestamp(*v),
        HeaderValue::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        HeaderValue::Table(table) => AMQPValue::FieldTable(to_field_table(table)),
        HeaderValue::Void => AMQPValue::Void,
    }
}

fn from_amqp_value(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::DecimalValue(d) => {
            HeaderValue::Float(f64::from(d.value) / 10f64.powi(i32::from(d.scale)))
        }
        AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_string()),
        AMQPValue::LongString(v) => {
            HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(values) => {
            HeaderValue::Array(values.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::Timestamp(v) => HeaderValue::Timestamp(*v),
        AMQPValue::FieldTable(table) => HeaderValue::Table(from_field_table(table)),
        AMQPValue::ByteArray(v) => HeaderValue::Bytes(v.as_slice().to_vec()),
        AMQPValue::Void => HeaderValue::Void,
    }
}
