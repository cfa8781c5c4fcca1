//! Handler registration and the consumption loop.
//!
//! `register` declares a registration's topology and starts a consumer with
//! prefetch 1. `start_consuming` then blocks the calling thread, which acts
//! as the IO thread: it receives deliveries, decodes them, and hands them to
//! the single worker thread one at a time. The worker reports back through a
//! completion channel and only the IO thread touches the broker channel.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{BoxStream, SelectAll};
use herald_core::{BrokerConfig, BrokerError, BrokerResult};
use herald_events::{DomainEvent, Handler, HandlerResult};
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::broker::{Channel, Delivery, DeliveryStream};
use crate::connection::ConnectionManager;
use crate::endpoint::Endpoint;
use crate::retry::{DelayQueueCache, Disposition, retry_count, schedule_retry};
use crate::topology::{self, Topology};
use crate::worker::{Completion, Job, WorkerPool};

const WORKER_THREAD: &str = "herald-worker";

/// How a handler is attached to the broker.
///
/// `name` is the work queue name and the prefix of every derived broker
/// object. Queues are durable by default; retries are off
/// (`max_retries = 0`) and there is no dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOptions {
    name: String,
    binding_keys: Vec<String>,
    dead_letter: bool,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    max_retries: u32,
}

impl RegistrationOptions {
    pub fn new<I, K>(name: impl Into<String>, binding_keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            name: name.into(),
            binding_keys: binding_keys.into_iter().map(Into::into).collect(),
            dead_letter: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
            max_retries: 0,
        }
    }

    /// Declare `<name>-dlx` / `<name>-dl` and route rejected messages there.
    pub fn with_dead_letter(mut self, dead_letter: bool) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding_keys(&self) -> &[String] {
        &self.binding_keys
    }

    pub fn dead_letter(&self) -> bool {
        self.dead_letter
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn topology(&self) -> Topology {
        Topology::new(self.name.clone())
    }
}

struct Registration {
    topology: Topology,
    handler: Handler,
    max_retries: u32,
    deliveries: Option<DeliveryStream>,
}

#[derive(Debug, Default)]
struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Ends a running `start_consuming` from any thread, including from inside
/// a handler.
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: Arc<StopSignal>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.signal.request();
    }
}

/// Consumes events for one or more registrations.
///
/// Handlers of all registrations share one worker thread, so at most one
/// handler runs at any time.
pub struct Subscriber {
    conn: ConnectionManager,
    registrations: Vec<Registration>,
    delay_queues: DelayQueueCache,
    stop: Arc<StopSignal>,
    stop_on_interrupt: bool,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues: Vec<&str> = self
            .registrations
            .iter()
            .map(|r| r.topology.work_queue())
            .collect();
        f.debug_struct("Subscriber")
            .field("conn", &self.conn)
            .field("queues", &queues)
            .field("stop_on_interrupt", &self.stop_on_interrupt)
            .finish()
    }
}

impl Subscriber {
    pub fn connect(
        endpoint: impl Into<Endpoint>,
        exchange: impl Into<String>,
    ) -> BrokerResult<Self> {
        Ok(Self {
            conn: ConnectionManager::connect(endpoint, exchange)?,
            registrations: Vec::new(),
            delay_queues: DelayQueueCache::new(),
            stop: Arc::new(StopSignal::default()),
            stop_on_interrupt: false,
        })
    }

    /// Connect to the consume-side broker of `config`.
    pub fn from_config(config: &BrokerConfig) -> BrokerResult<Self> {
        Self::connect(config.subscriber_address(), config.exchange.clone())
    }

    /// Declare the registration's topology and start its consumer.
    ///
    /// Names must be unique per subscriber. A failure part-way leaves the
    /// objects declared so far in place.
    pub fn register<F>(&mut self, handler: F, options: RegistrationOptions) -> BrokerResult<()>
    where
        F: Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static,
    {
        if self
            .registrations
            .iter()
            .any(|r| r.topology.work_queue() == options.name())
        {
            return Err(BrokerError::DuplicateRegistration(options.name().to_string()));
        }
        let Some(io) = self.conn.io("register")? else {
            return Ok(());
        };

        let deliveries = io.runtime.block_on(async {
            topology::declare_registration(io.channel, io.exchange, &options).await?;
            io.channel.set_prefetch(1).await?;
            io.channel.consume(options.name(), options.name()).await
        })?;
        info!(
            queue = options.name(),
            binding_keys = ?options.binding_keys(),
            dead_letter = options.dead_letter(),
            max_retries = options.max_retries(),
            "handler registered"
        );

        self.registrations.push(Registration {
            topology: options.topology(),
            handler: Arc::new(handler),
            max_retries: options.max_retries(),
            deliveries: Some(deliveries),
        });
        Ok(())
    }

    /// Also stop consuming on Ctrl-C. Off by default.
    ///
    /// Once a loop has listened for Ctrl-C the process keeps catching it
    /// after the loop ends, so only binaries that own the process should
    /// turn this on.
    pub fn stop_on_interrupt(&mut self, enabled: bool) -> &mut Self {
        self.stop_on_interrupt = enabled;
        self
    }

    pub fn interrupts_stop(&self) -> bool {
        self.stop_on_interrupt
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            signal: Arc::clone(&self.stop),
        }
    }

    /// Block consuming until stopped or `timeout` elapses, then disconnect.
    ///
    /// A zero `timeout` means no timeout, same as `None`.
    ///
    /// A loop-level error also disconnects and is returned. Deliveries that
    /// were not settled by then are requeued by the broker.
    pub fn start_consuming(&mut self, timeout: Option<Duration>) -> BrokerResult<()> {
        let Self {
            conn,
            registrations,
            delay_queues,
            stop,
            stop_on_interrupt,
        } = self;
        let timeout = timeout.filter(|t| !t.is_zero());
        let Some(io) = conn.io("start_consuming")? else {
            return Ok(());
        };

        let (completions_tx, mut completions) = unbounded_channel();
        let worker = WorkerPool::spawn(WORKER_THREAD, completions_tx)?;
        let streams = registrations.iter_mut().enumerate().filter_map(|(idx, r)| {
            r.deliveries
                .take()
                .map(|stream| stream.map(move |d| (idx, d)).boxed())
        });
        let deliveries = futures::stream::select_all(streams);
        info!(
            consumers = deliveries.len(),
            timeout_secs = timeout.map(|t| t.as_secs_f64()),
            "consuming"
        );

        let consume = ConsumeLoop {
            channel: io.channel,
            registrations: &registrations[..],
            worker: &worker,
            delay_queues,
            in_flight: HashMap::new(),
            backlog: VecDeque::new(),
            busy: false,
        };
        let result = io
            .runtime
            .block_on(consume.run(
            deliveries,
            &mut completions,
            &**stop,
            *stop_on_interrupt,
            timeout,
        ));

        // Joins the worker; a handler still running finishes first.
        drop(worker);
        if let Err(err) = &result {
            error!(error = %err, "consumption loop failed");
        }
        let closed = conn.disconnect();
        result.and(closed)
    }

    /// Stop a consumption loop and close the connection.
    pub fn stop_consuming(&mut self) -> BrokerResult<()> {
        self.stop.request();
        self.conn.disconnect()
    }
}

impl Deref for Subscriber {
    type Target = ConnectionManager;

    fn deref(&self) -> &ConnectionManager {
        &self.conn
    }
}

impl DerefMut for Subscriber {
    fn deref_mut(&mut self) -> &mut ConnectionManager {
        &mut self.conn
    }
}

type TaggedDeliveries = SelectAll<BoxStream<'static, (usize, BrokerResult<Delivery>)>>;

struct InFlight {
    registration: usize,
    delivery: Delivery,
}

struct ConsumeLoop<'a> {
    channel: &'a mut dyn Channel,
    registrations: &'a [Registration],
    worker: &'a WorkerPool,
    delay_queues: &'a mut DelayQueueCache,
    in_flight: HashMap<u64, InFlight>,
    /// Jobs waiting for the worker to become free.
    backlog: VecDeque<Job>,
    busy: bool,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ConsumeLoop<'_> {
    async fn run(
        mut self,
        mut deliveries: TaggedDeliveries,
        completions: &mut UnboundedReceiver<Completion>,
        stop: &StopSignal,
        stop_on_interrupt: bool,
        timeout: Option<Duration>,
    ) -> BrokerResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut consumers_open = !deliveries.is_empty();
        // Not polled unless enabled, so no signal handler gets installed.
        let mut watch_interrupt = stop_on_interrupt;
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);

        loop {
            if stop.requested() {
                info!("stop requested");
                return Ok(());
            }
            if !consumers_open && self.in_flight.is_empty() {
                warn!("no consumers left");
                return Ok(());
            }

            tokio::select! {
                _ = stop.notify.notified() => {}
                _ = sleep_until_deadline(deadline) => {
                    info!("consume timeout elapsed");
                    return Ok(());
                }
                signal = &mut interrupt, if watch_interrupt => match signal {
                    Ok(()) => {
                        info!("interrupted");
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(error = %err, "cannot listen for interrupts");
                        watch_interrupt = false;
                    }
                },
                Some(completion) = completions.recv() => self.settle(completion).await?,
                next = deliveries.next(), if consumers_open => match next {
                    Some((idx, Ok(delivery))) => self.dispatch(idx, delivery).await?,
                    Some((_, Err(err))) => return Err(err),
                    None => consumers_open = false,
                },
            }
        }
    }

    async fn dispatch(&mut self, idx: usize, delivery: Delivery) -> BrokerResult<()> {
        let registrations = self.registrations;
        let registration = &registrations[idx];
        let queue = registration.topology.work_queue();
        let delivery_tag = delivery.delivery_tag;

        let mut event = match DomainEvent::from_slice(&delivery.body) {
            Ok(event) => event,
            Err(err) => {
                error!(queue, delivery_tag, error = %err, "discarding undecodable message");
                return self.channel.reject(delivery_tag, false).await;
            }
        };
        event.set_retries(retry_count(delivery.properties.headers.as_ref()));
        debug!(
            queue,
            delivery_tag,
            event_id = event.uuid_string(),
            routing_key = event.routing_key(),
            retries = event.retries(),
            "event received"
        );

        let job = Job {
            delivery_tag,
            queue: queue.to_string(),
            handler: Arc::clone(&registration.handler),
            max_retries: registration.max_retries,
            event,
        };
        self.in_flight.insert(
            delivery_tag,
            InFlight {
                registration: idx,
                delivery,
            },
        );
        if self.busy {
            self.backlog.push_back(job);
        } else {
            self.worker.submit(job)?;
            self.busy = true;
        }
        Ok(())
    }

    async fn settle(&mut self, completion: Completion) -> BrokerResult<()> {
        match self.backlog.pop_front() {
            Some(job) => self.worker.submit(job)?,
            None => self.busy = false,
        }

        let Some(InFlight {
            registration,
            delivery,
        }) = self.in_flight.remove(&completion.delivery_tag)
        else {
            warn!(delivery_tag = completion.delivery_tag, "completion for unknown delivery");
            return Ok(());
        };
        let tag = delivery.delivery_tag;

        match completion.disposition {
            Disposition::Ack => self.channel.ack(tag).await,
            Disposition::Reject => self.channel.reject(tag, false).await,
            Disposition::Retry { delay } => {
                let topology = &self.registrations[registration].topology;
                schedule_retry(self.channel, self.delay_queues, topology, &delivery, delay).await?;
                self.channel.ack(tag).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use herald_core::DEFAULT_EXCHANGE;

    use super::*;
    use crate::broker::in_memory::InMemoryBroker;

    #[test]
    fn options_default_to_durable_without_retries() {
        let options = RegistrationOptions::new("billing", ["order.*"]);
        assert!(options.durable());
        assert!(!options.exclusive());
        assert!(!options.auto_delete());
        assert!(!options.dead_letter());
        assert_eq!(options.max_retries(), 0);
        assert_eq!(options.binding_keys(), ["order.*".to_string()]);
    }

    #[test]
    fn interrupt_handling_is_off_by_default() {
        let broker = InMemoryBroker::new();
        let mut subscriber = Subscriber::connect(&broker, DEFAULT_EXCHANGE).unwrap();
        assert!(!subscriber.interrupts_stop());
        subscriber.stop_on_interrupt(true);
        assert!(subscriber.interrupts_stop());
    }

    #[test]
    fn duplicate_names_are_refused() {
        let broker = InMemoryBroker::new();
        let mut subscriber = Subscriber::connect(&broker, DEFAULT_EXCHANGE).unwrap();
        subscriber
            .register(|_| Ok(()), RegistrationOptions::new("dup", ["a.*"]))
            .unwrap();
        let err = subscriber
            .register(|_| Ok(()), RegistrationOptions::new("dup", ["b.*"]))
            .unwrap_err();
        assert_eq!(err, BrokerError::DuplicateRegistration("dup".into()));
    }

    #[test]
    fn disabled_subscriber_registers_and_consumes_nothing() {
        let mut subscriber = Subscriber::connect(Endpoint::Disabled, DEFAULT_EXCHANGE).unwrap();
        subscriber
            .register(|_| Ok(()), RegistrationOptions::new("q", ["#"]))
            .unwrap();
        subscriber.start_consuming(None).unwrap();
        subscriber.stop_consuming().unwrap();
    }

    #[test]
    fn stop_before_start_returns_immediately() {
        let broker = InMemoryBroker::new();
        let mut subscriber = Subscriber::connect(&broker, DEFAULT_EXCHANGE).unwrap();
        subscriber
            .register(|_| Ok(()), RegistrationOptions::new("idle", ["#"]))
            .unwrap();
        subscriber.stop_handle().stop();
        subscriber.start_consuming(None).unwrap();
        assert!(!subscriber.is_open());
    }
}
