//! In-memory broker (tests/dev).
//!
//! Implements the subset of AMQP 0-9-1 semantics the engine relies on, inside
//! one process:
//!
//! - topic (`*`, `#`), direct and fanout exchanges, plus the default exchange
//! - per-queue `x-message-ttl`, per-message `expiration` and `x-expires`
//! - `x-dead-letter-exchange` with RabbitMQ-style `x-death` bookkeeping
//! - per-consumer prefetch, get, ack, reject with or without requeue
//! - exclusive and auto-delete queues, auto-delete exchanges
//!
//! Expiry is evaluated lazily: on every broker operation and whenever a
//! waiting consumer reaches the next message deadline.
//!
//! ## Usage
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let mut subscriber = Subscriber::connect(broker.clone(), DEFAULT_EXCHANGE)?;
//! let mut publisher = Publisher::connect(broker.clone(), DEFAULT_EXCHANGE)?;
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use herald_core::{BrokerError, BrokerResult};
use tokio::sync::Notify;
use tracing::debug;

use super::{
    Channel, Connector, Delivery, DeliveryStream, ExchangeKind, ExchangeOptions, Fetched,
    HeaderValue, Headers, MessageProperties, QueueOptions, QueueState,
};

const EXPIRED: &str = "expired";
const REJECTED: &str = "rejected";

/// Upper bound on cascading expiry passes within one sweep.
const MAX_SWEEP_PASSES: usize = 16;

/// Handle to a shared in-process broker. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, ChannelState>,
    next_channel: u64,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    auto_delete: bool,
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    key: String,
}

#[derive(Debug)]
struct Queue {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<Stored>,
    consumers: Vec<ConsumerSlot>,
    last_used: Instant,
}

#[derive(Debug)]
struct Stored {
    message: Message,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Clone)]
struct ConsumerSlot {
    channel: u64,
    tag: String,
    prefetch: Option<u16>,
}

#[derive(Debug, Default)]
struct ChannelState {
    prefetch: Option<u16>,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer: Option<String>,
    stored: Stored,
}

enum Next {
    Ready(Delivery),
    Wait(Option<Instant>),
    Cancelled,
}

fn not_found(what: &str, name: &str) -> BrokerError {
    BrokerError::protocol(format!("NOT_FOUND - no {what} '{name}'"))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Topic exchange matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

impl Queue {
    fn new(options: QueueOptions, owner: Option<u64>, now: Instant) -> Self {
        Self {
            options,
            owner,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            last_used: now,
        }
    }

    fn state(&self) -> QueueState {
        QueueState {
            message_count: self.messages.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    fn push(&mut self, message: Message, now: Instant) {
        let queue_ttl = self.options.arguments.message_ttl.map(u64::from);
        let message_ttl = message
            .properties
            .expiration
            .as_deref()
            .and_then(|raw| raw.parse::<u64>().ok());
        let ttl = match (queue_ttl, message_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.messages.push_back(Stored {
            message,
            expires_at: ttl.map(|ms| now + Duration::from_millis(ms)),
        });
    }

    fn head_expired(&self, now: Instant) -> bool {
        self.messages
            .front()
            .and_then(|m| m.expires_at)
            .is_some_and(|at| at <= now)
    }

    fn idle_expired(&self, now: Instant) -> bool {
        let Some(expires) = self.options.arguments.expires else {
            return false;
        };
        self.consumers.is_empty()
            && now.duration_since(self.last_used) >= Duration::from_millis(u64::from(expires))
    }

    fn locked_by_other(&self, channel: u64) -> bool {
        self.owner.is_some_and(|owner| owner != channel)
    }
}

fn record_death(message: &mut Message, queue: &str, reason: &str) {
    let exchange = message.exchange.clone();
    let routing_key = message.routing_key.clone();
    let headers = message.properties.headers.get_or_insert_with(Headers::new);
    let mut deaths = match headers.remove("x-death") {
        Some(HeaderValue::Array(entries)) => entries,
        _ => Vec::new(),
    };

    let existing = deaths.iter().position(|entry| {
        entry.as_table().is_some_and(|t| {
            t.get("queue").and_then(HeaderValue::as_str) == Some(queue)
                && t.get("reason").and_then(HeaderValue::as_str) == Some(reason)
        })
    });

    let entry = match existing {
        Some(index) => {
            let mut entry = deaths.remove(index);
            if let HeaderValue::Table(table) = &mut entry {
                let count = table.get("count").and_then(HeaderValue::as_i64).unwrap_or(0) + 1;
                table.insert("count".into(), HeaderValue::Int(count));
                table.insert("time".into(), HeaderValue::Timestamp(unix_now()));
            }
            entry
        }
        None => {
            let mut table = Headers::new();
            table.insert("count".into(), HeaderValue::Int(1));
            table.insert("reason".into(), HeaderValue::String(reason.to_string()));
            table.insert("queue".into(), HeaderValue::String(queue.to_string()));
            table.insert("time".into(), HeaderValue::Timestamp(unix_now()));
            table.insert("exchange".into(), HeaderValue::String(exchange));
            table.insert(
                "routing-keys".into(),
                HeaderValue::Array(vec![HeaderValue::String(routing_key)]),
            );
            HeaderValue::Table(table)
        }
    };
    deaths.insert(0, entry);
    headers.insert("x-death".into(), HeaderValue::Array(deaths));

    if let Some(expiration) = message.properties.expiration.take() {
        if let Some(headers) = message.properties.headers.as_mut() {
            headers.insert("original-expiration".into(), HeaderValue::String(expiration));
        }
    }
}

impl State {
    fn sweep(&mut self, now: Instant) {
        for _ in 0..MAX_SWEEP_PASSES {
            let mut expired = Vec::new();
            let mut names: Vec<&String> = self.queues.keys().collect();
            names.sort();
            let names: Vec<String> = names.into_iter().cloned().collect();

            for name in &names {
                let Some(queue) = self.queues.get_mut(name) else {
                    continue;
                };
                while queue.head_expired(now) {
                    if let Some(stored) = queue.messages.pop_front() {
                        expired.push((
                            name.clone(),
                            queue.options.arguments.dead_letter_exchange.clone(),
                            stored.message,
                        ));
                    }
                }
            }

            let idle: Vec<String> = names
                .into_iter()
                .filter(|name| self.queues.get(name).is_some_and(|q| q.idle_expired(now)))
                .collect();
            for name in idle {
                debug!(queue = %name, "queue expired");
                self.remove_queue(&name);
            }

            if expired.is_empty() {
                return;
            }
            for (queue, dlx, message) in expired {
                self.dead_letter(&queue, dlx.as_deref(), message, EXPIRED, now);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(|q| q.messages.front().and_then(|m| m.expires_at))
            .min()
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: Message,
        now: Instant,
    ) -> BrokerResult<usize> {
        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let ex = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| not_found("exchange", exchange))?;
            let mut names: Vec<String> = ex
                .bindings
                .iter()
                .filter(|b| match ex.kind {
                    ExchangeKind::Topic => topic_matches(&b.key, routing_key),
                    ExchangeKind::Direct => b.key == routing_key,
                    ExchangeKind::Fanout => true,
                })
                .map(|b| b.queue.clone())
                .collect();
            names.sort();
            names.dedup();
            names
        };

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.push(message.clone(), now);
            }
        }
        Ok(targets.len())
    }

    fn dead_letter(
        &mut self,
        queue: &str,
        dlx: Option<&str>,
        mut message: Message,
        reason: &str,
        now: Instant,
    ) {
        let Some(dlx) = dlx else {
            debug!(queue, reason, "message dropped (no dead-letter exchange)");
            return;
        };
        record_death(&mut message, queue, reason);
        message.exchange = dlx.to_string();
        message.redelivered = false;
        let routing_key = message.routing_key.clone();
        if let Err(err) = self.route(dlx, &routing_key, message, now) {
            debug!(queue, dlx, error = %err, "dead-letter exchange missing; message dropped");
        }
    }

    fn remove_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_none() {
            return;
        }
        let mut emptied = Vec::new();
        for (exchange_name, exchange) in &mut self.exchanges {
            let before = exchange.bindings.len();
            exchange.bindings.retain(|b| b.queue != name);
            if exchange.auto_delete && before > 0 && exchange.bindings.is_empty() {
                emptied.push(exchange_name.clone());
            }
        }
        for exchange in emptied {
            debug!(exchange = %exchange, "auto-delete exchange removed");
            self.exchanges.remove(&exchange);
        }
    }

    fn take_delivery_tag(&mut self, channel: u64) -> BrokerResult<(u64, &mut ChannelState)> {
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or(BrokerError::Disconnected)?;
        state.next_tag += 1;
        Ok((state.next_tag, state))
    }

    fn next_for_consumer(&mut self, channel: u64, queue: &str, tag: &str, now: Instant) -> Next {
        self.sweep(now);
        let deadline = self.next_deadline();

        let State {
            queues, channels, ..
        } = self;
        let Some(channel_state) = channels.get_mut(&channel) else {
            return Next::Cancelled;
        };
        let Some(q) = queues.get_mut(queue) else {
            return Next::Cancelled;
        };
        let Some(slot) = q
            .consumers
            .iter()
            .find(|c| c.channel == channel && c.tag == tag)
        else {
            return Next::Cancelled;
        };

        if let Some(limit) = slot.prefetch.filter(|n| *n > 0) {
            let outstanding = channel_state
                .unacked
                .values()
                .filter(|u| u.consumer.as_deref() == Some(tag))
                .count();
            if outstanding >= usize::from(limit) {
                return Next::Wait(deadline);
            }
        }

        let Some(stored) = q.messages.pop_front() else {
            return Next::Wait(deadline);
        };
        channel_state.next_tag += 1;
        let delivery_tag = channel_state.next_tag;
        let delivery = Delivery {
            delivery_tag,
            exchange: stored.message.exchange.clone(),
            routing_key: stored.message.routing_key.clone(),
            redelivered: stored.message.redelivered,
            properties: stored.message.properties.clone(),
            body: stored.message.body.clone(),
        };
        channel_state.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue.to_string(),
                consumer: Some(tag.to_string()),
                stored,
            },
        );
        Next::Ready(delivery)
    }

    fn close_channel(&mut self, channel: u64) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };

        for (_, unacked) in state.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut stored = unacked.stored;
                stored.message.redelivered = true;
                queue.messages.push_front(stored);
            }
        }

        let mut doomed = Vec::new();
        for (name, queue) in &mut self.queues {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != channel);
            let lost_consumers = queue.consumers.len() < before;
            if queue.owner == Some(channel)
                || (queue.options.auto_delete && lost_consumers && queue.consumers.is_empty())
            {
                doomed.push(name.clone());
            }
        }
        for name in doomed {
            debug!(queue = %name, "exclusive/auto-delete queue removed");
            self.remove_queue(&name);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<T>(&self, op: impl FnOnce(&mut State, Instant) -> T) -> T {
        let result = {
            let mut state = self.lock();
            let now = Instant::now();
            state.sweep(now);
            op(&mut state, now)
        };
        self.changed.notify_waiters();
        result
    }

    async fn next_delivery(&self, channel: u64, queue: &str, tag: &str) -> Option<Delivery> {
        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();

            let next = self.lock().next_for_consumer(channel, queue, tag, Instant::now());
            match next {
                Next::Ready(delivery) => return Some(delivery),
                Next::Cancelled => return None,
                Next::Wait(Some(deadline)) => {
                    let deadline = tokio::time::Instant::from_std(deadline);
                    tokio::select! {
                        _ = &mut changed => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Next::Wait(None) => changed.await,
            }
        }
    }
}

struct ConsumerCursor {
    shared: Arc<Shared>,
    channel: u64,
    queue: String,
    tag: String,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.shared.update(|state, _| state.queues.contains_key(name))
    }

    /// Number of ready messages, `None` if the queue does not exist.
    pub fn queue_size(&self, name: &str) -> Option<u32> {
        self.shared
            .update(|state, _| state.queues.get(name).map(|q| q.messages.len() as u32))
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.shared.update(|state, _| state.exchanges.contains_key(name))
    }

    /// Declared options of a queue.
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.shared
            .update(|state, _| state.queues.get(name).map(|q| q.options.clone()))
    }

    /// `(queue, binding key)` pairs bound to an exchange.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.shared.update(|state, _| {
            state
                .exchanges
                .get(exchange)
                .map(|ex| {
                    ex.bindings
                        .iter()
                        .map(|b| (b.queue.clone(), b.key.clone()))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Names of all queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .update(|state, _| state.queues.keys().cloned().collect());
        names.sort();
        names
    }

    /// Remove and return the head of a queue (get + ack in one step).
    pub fn pop_message(&self, name: &str) -> Option<(MessageProperties, Vec<u8>)> {
        self.shared.update(|state, now| {
            let queue = state.queues.get_mut(name)?;
            queue.last_used = now;
            queue
                .messages
                .pop_front()
                .map(|stored| (stored.message.properties, stored.message.body))
        })
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn open(&self) -> BrokerResult<Box<dyn Channel>> {
        let id = self.shared.update(|state, _| {
            state.next_channel += 1;
            let id = state.next_channel;
            state.channels.insert(id, ChannelState::default());
            id
        });
        Ok(Box::new(InMemoryChannel {
            shared: Arc::clone(&self.shared),
            id,
            closed: false,
        }))
    }
}

/// Channel on an [`InMemoryBroker`]. Dropping it closes it.
#[derive(Debug)]
pub struct InMemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    closed: bool,
}

impl InMemoryChannel {
    fn update<T>(&self, op: impl FnOnce(&mut State, Instant) -> BrokerResult<T>) -> BrokerResult<T> {
        if self.closed {
            return Err(BrokerError::Disconnected);
        }
        self.shared.update(op)
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        if !self.closed {
            let id = self.id;
            self.shared.update(|state, _| state.close_channel(id));
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BrokerResult<()> {
        self.update(|state, _| {
            if let Some(existing) = state.exchanges.get(name) {
                if existing.kind != kind {
                    return Err(BrokerError::protocol(format!(
                        "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}'"
                    )));
                }
                return Ok(());
            }
            state.exchanges.insert(
                name.to_string(),
                Exchange {
                    kind,
                    auto_delete: options.auto_delete,
                    bindings: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn declare_queue(
        &mut self,
        name: &str,
        options: &QueueOptions,
    ) -> BrokerResult<QueueState> {
        let channel = self.id;
        self.update(|state, now| {
            if let Some(queue) = state.queues.get_mut(name) {
                if queue.locked_by_other(channel) {
                    return Err(BrokerError::protocol(format!(
                        "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{name}'"
                    )));
                }
                queue.last_used = now;
                return Ok(queue.state());
            }
            let owner = options.exclusive.then_some(channel);
            let queue = Queue::new(options.clone(), owner, now);
            let queue_state = queue.state();
            state.queues.insert(name.to_string(), queue);
            Ok(queue_state)
        })
    }

    async fn inspect_queue(&mut self, name: &str) -> BrokerResult<Option<QueueState>> {
        self.update(|state, _| Ok(state.queues.get(name).map(Queue::state)))
    }

    async fn delete_queue(&mut self, name: &str) -> BrokerResult<()> {
        self.update(|state, _| {
            state.remove_queue(name);
            Ok(())
        })
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> BrokerResult<()> {
        self.update(|state, _| {
            if !state.queues.contains_key(queue) {
                return Err(not_found("queue", queue));
            }
            let ex = state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| not_found("exchange", exchange))?;
            let binding = Binding {
                queue: queue.to_string(),
                key: binding_key.to_string(),
            };
            if !ex.bindings.contains(&binding) {
                ex.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn set_prefetch(&mut self, count: u16) -> BrokerResult<()> {
        let channel = self.id;
        self.update(|state, _| {
            let channel_state = state
                .channels
                .get_mut(&channel)
                .ok_or(BrokerError::Disconnected)?;
            channel_state.prefetch = Some(count);
            Ok(())
        })
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            body: body.to_vec(),
            redelivered: false,
        };
        self.update(|state, now| {
            let routed = state.route(exchange, routing_key, message, now)?;
            if routed == 0 {
                debug!(exchange, routing_key, "message unroutable; dropped");
            }
            Ok(())
        })
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let channel = self.id;
        self.update(|state, now| {
            let prefetch = state
                .channels
                .get(&channel)
                .ok_or(BrokerError::Disconnected)?
                .prefetch;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| not_found("queue", queue))?;
            if q.locked_by_other(channel) {
                return Err(BrokerError::protocol(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{queue}'"
                )));
            }
            if q
                .consumers
                .iter()
                .any(|c| c.channel == channel && c.tag == consumer_tag)
            {
                return Err(BrokerError::protocol(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
                )));
            }
            q.consumers.push(ConsumerSlot {
                channel,
                tag: consumer_tag.to_string(),
                prefetch,
            });
            q.last_used = now;
            Ok(())
        })?;

        let cursor = ConsumerCursor {
            shared: Arc::clone(&self.shared),
            channel,
            queue: queue.to_string(),
            tag: consumer_tag.to_string(),
        };
        Ok(futures::stream::unfold(cursor, |cursor| async move {
            let delivery = cursor
                .shared
                .next_delivery(cursor.channel, &cursor.queue, &cursor.tag)
                .await?;
            Some((Ok(delivery), cursor))
        })
        .boxed())
    }

    async fn get(&mut self, queue: &str) -> BrokerResult<Option<Fetched>> {
        let channel = self.id;
        self.update(|state, now| {
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| not_found("queue", queue))?;
            q.last_used = now;
            let Some(stored) = q.messages.pop_front() else {
                return Ok(None);
            };
            let message_count = q.messages.len() as u32;

            let (delivery_tag, channel_state) = state.take_delivery_tag(channel)?;
            let delivery = Delivery {
                delivery_tag,
                exchange: stored.message.exchange.clone(),
                routing_key: stored.message.routing_key.clone(),
                redelivered: stored.message.redelivered,
                properties: stored.message.properties.clone(),
                body: stored.message.body.clone(),
            };
            channel_state.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue.to_string(),
                    consumer: None,
                    stored,
                },
            );
            Ok(Some(Fetched {
                delivery,
                message_count,
            }))
        })
    }

    async fn ack(&mut self, delivery_tag: u64) -> BrokerResult<()> {
        let channel = self.id;
        self.update(|state, _| {
            state
                .channels
                .get_mut(&channel)
                .ok_or(BrokerError::Disconnected)?
                .unacked
                .remove(&delivery_tag)
                .map(|_| ())
                .ok_or_else(|| {
                    BrokerError::protocol(format!(
                        "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                    ))
                })
        })
    }

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let channel = self.id;
        self.update(|state, now| {
            let unacked = state
                .channels
                .get_mut(&channel)
                .ok_or(BrokerError::Disconnected)?
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| {
                    BrokerError::protocol(format!(
                        "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                    ))
                })?;

            let Some(queue) = state.queues.get_mut(&unacked.queue) else {
                return Ok(());
            };
            if requeue {
                let mut stored = unacked.stored;
                stored.message.redelivered = true;
                queue.messages.push_front(stored);
            } else {
                let dlx = queue.options.arguments.dead_letter_exchange.clone();
                state.dead_letter(
                    &unacked.queue,
                    dlx.as_deref(),
                    unacked.stored.message,
                    REJECTED,
                    now,
                );
            }
            Ok(())
        })
    }

    async fn close(&mut self) -> BrokerResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let id = self.id;
        self.shared.update(|state, _| state.close_channel(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueArguments;

    async fn channel(broker: &InMemoryBroker) -> Box<dyn Channel> {
        broker.open().await.unwrap()
    }

    fn death_count(props: &MessageProperties) -> i64 {
        props
            .header("x-death")
            .and_then(HeaderValue::as_array)
            .and_then(|d| d.first())
            .and_then(HeaderValue::as_table)
            .and_then(|t| t.get("count"))
            .and_then(HeaderValue::as_i64)
            .unwrap_or(0)
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("user.*", "user.registered"));
        assert!(!topic_matches("user.*", "user.registered.twice"));
        assert!(!topic_matches("user.*", "user"));
        assert!(topic_matches("user.#", "user"));
        assert!(topic_matches("user.#", "user.a.b"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.created", "order.line.created"));
        assert!(topic_matches("*.created", "order.created"));
        assert!(!topic_matches("test.one", "test.two"));
    }

    #[tokio::test]
    async fn routes_through_topic_exchange() {
        let broker = InMemoryBroker::new();
        let mut ch = channel(&broker).await;
        ch.declare_exchange("events", ExchangeKind::Topic, ExchangeOptions::durable())
            .await
            .unwrap();
        ch.declare_queue("users", &QueueOptions::durable()).await.unwrap();
        ch.bind_queue("users", "events", "user.*").await.unwrap();
        ch.bind_queue("users", "events", "user.registered").await.unwrap();

        let props = MessageProperties::persistent_json();
        ch.publish("events", "user.registered", b"{}", &props).await.unwrap();
        ch.publish("events", "order.placed", b"{}", &props).await.unwrap();

        // Two matching bindings still yield a single copy.
        assert_eq!(broker.queue_size("users"), Some(1));
        assert!(ch.publish("missing", "x", b"{}", &props).await.is_err());
    }

    #[tokio::test]
    async fn get_reports_remaining_and_reject_requeues_at_head() {
        let broker = InMemoryBroker::new();
        let mut ch = channel(&broker).await;
        ch.declare_queue("q", &QueueOptions::durable()).await.unwrap();
        let props = MessageProperties::default();
        ch.publish("", "q", b"first", &props).await.unwrap();
        ch.publish("", "q", b"second", &props).await.unwrap();

        let fetched = ch.get("q").await.unwrap().unwrap();
        assert_eq!(fetched.message_count, 1);
        assert_eq!(fetched.delivery.body, b"first");
        ch.reject(fetched.delivery.delivery_tag, true).await.unwrap();

        let again = ch.get("q").await.unwrap().unwrap();
        assert_eq!(again.delivery.body, b"first");
        assert!(again.delivery.redelivered);
        ch.ack(again.delivery.delivery_tag).await.unwrap();
        assert!(ch.ack(again.delivery.delivery_tag).await.is_err());
        assert_eq!(broker.queue_size("q"), Some(1));
    }

    #[tokio::test]
    async fn expired_messages_dead_letter_with_x_death() {
        let broker = InMemoryBroker::new();
        let mut ch = channel(&broker).await;
        ch.declare_exchange("retry", ExchangeKind::Topic, ExchangeOptions::default())
            .await
            .unwrap();
        ch.declare_queue("work", &QueueOptions::durable()).await.unwrap();
        ch.bind_queue("work", "retry", "#").await.unwrap();
        ch.declare_queue(
            "delay",
            &QueueOptions::durable().with_arguments(QueueArguments {
                dead_letter_exchange: Some("retry".into()),
                message_ttl: Some(20),
                expires: None,
            }),
        )
        .await
        .unwrap();

        let mut props = MessageProperties::persistent_json();
        for expected in 1..=2 {
            ch.publish("", "delay", b"{}", &props).await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
            let (delivered, _) = broker.pop_message("work").unwrap();
            assert_eq!(death_count(&delivered), expected);
            props = delivered;
        }
        assert_eq!(broker.queue_size("delay"), Some(0));
    }

    #[tokio::test]
    async fn consumer_respects_prefetch() {
        let broker = InMemoryBroker::new();
        let mut ch = channel(&broker).await;
        ch.declare_queue("q", &QueueOptions::durable()).await.unwrap();
        ch.set_prefetch(1).await.unwrap();
        let mut stream = ch.consume("q", "c1").await.unwrap();

        let props = MessageProperties::default();
        ch.publish("", "q", b"1", &props).await.unwrap();
        ch.publish("", "q", b"2", &props).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(30), stream.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the ack");

        ch.ack(first.delivery_tag).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"2");
    }

    #[tokio::test]
    async fn closing_requeues_unacked_and_drops_owned_queues() {
        let broker = InMemoryBroker::new();
        let mut owner = channel(&broker).await;
        let options = QueueOptions {
            exclusive: true,
            ..QueueOptions::default()
        };
        owner.declare_queue("mine", &options).await.unwrap();
        let auto = QueueOptions {
            auto_delete: true,
            ..QueueOptions::default()
        };
        owner.declare_queue("auto", &auto).await.unwrap();
        owner.declare_queue("kept", &QueueOptions::durable()).await.unwrap();

        let mut other = channel(&broker).await;
        assert!(other.declare_queue("mine", &options).await.is_err());

        owner.publish("", "kept", b"x", &MessageProperties::default()).await.unwrap();
        let _auto = owner.consume("auto", "a").await.unwrap();
        let fetched = owner.get("kept").await.unwrap().unwrap();
        assert_eq!(fetched.message_count, 0);

        owner.close().await.unwrap();
        assert!(!broker.queue_exists("mine"));
        assert!(!broker.queue_exists("auto"));
        assert_eq!(broker.queue_size("kept"), Some(1));
        assert!(owner.get("kept").await.is_err());
    }

    #[tokio::test]
    async fn idle_queue_expires_and_takes_auto_delete_exchange() {
        let broker = InMemoryBroker::new();
        let mut ch = channel(&broker).await;
        ch.declare_exchange(
            "delay-ex",
            ExchangeKind::Topic,
            ExchangeOptions {
                durable: true,
                auto_delete: true,
            },
        )
        .await
        .unwrap();
        ch.declare_queue(
            "delay",
            &QueueOptions::durable().with_arguments(QueueArguments {
                expires: Some(20),
                ..QueueArguments::default()
            }),
        )
        .await
        .unwrap();
        ch.bind_queue("delay", "delay-ex", "#").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!broker.queue_exists("delay"));
        assert!(!broker.exchange_exists("delay-ex"));
    }
}
