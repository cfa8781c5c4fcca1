//! Broker objects derived from a registration's queue name.
//!
//! | name | kind | purpose |
//! |---|---|---|
//! | `<name>` | queue | work queue, bound to the main exchange |
//! | `<name>-retry` | topic exchange | re-entry into the work queue |
//! | `<name>-delay-<ms>` | queue + topic exchange | TTL hop for one delay value |
//! | `<name>-dlx` / `<name>-dl` | topic exchange / queue | dead letters (optional) |
//!
//! A delay queue holds messages for `<ms>` milliseconds, then dead-letters
//! them into `<name>-retry`. It expires `<ms> + 10s` after its last
//! declaration, which takes its auto-delete exchange with it.

use std::time::Duration;

use herald_core::BrokerResult;
use tracing::debug;

use crate::broker::{Channel, ExchangeKind, ExchangeOptions, QueueArguments, QueueOptions};
use crate::subscriber::RegistrationOptions;

/// How long an idle delay queue outlives its message TTL.
pub const DELAY_QUEUE_GRACE: Duration = Duration::from_secs(10);

const GRACE_MS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topology {
    name: String,
}

impl Topology {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn work_queue(&self) -> &str {
        &self.name
    }

    pub fn retry_exchange(&self) -> String {
        format!("{}-retry", self.name)
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}-dlx", self.name)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}-dl", self.name)
    }

    /// Shared name of the delay queue and its exchange.
    pub fn delay_name(&self, delay_ms: u32) -> String {
        format!("{}-delay-{}", self.name, delay_ms)
    }

    pub fn delay_queue_options(&self, delay_ms: u32) -> QueueOptions {
        QueueOptions::durable().with_arguments(QueueArguments {
            dead_letter_exchange: Some(self.retry_exchange()),
            message_ttl: Some(delay_ms),
            expires: Some(delay_ms.saturating_add(GRACE_MS)),
        })
    }
}

/// Delay rounded to whole milliseconds, capped so `ttl + grace` fits the
/// broker's range.
pub fn delay_millis(delay: Duration) -> u32 {
    let max = u32::MAX - GRACE_MS;
    let ms = delay.as_nanos().saturating_add(500_000) / 1_000_000;
    u32::try_from(ms).map_or(max, |ms| ms.min(max))
}

async fn bind_all(
    channel: &mut dyn Channel,
    queue: &str,
    exchange: &str,
    binding_keys: &[String],
) -> BrokerResult<()> {
    for key in binding_keys {
        channel.bind_queue(queue, exchange, key).await?;
    }
    Ok(())
}

/// Declare and bind everything a registration needs, in order:
/// dead-letter exchange and queue (if requested), work queue, retry exchange.
///
/// Objects declared before a failure are left in place.
pub(crate) async fn declare_registration(
    channel: &mut dyn Channel,
    main_exchange: &str,
    options: &RegistrationOptions,
) -> BrokerResult<()> {
    let topology = options.topology();
    let keys = options.binding_keys();
    let mut arguments = QueueArguments::default();

    if options.dead_letter() {
        let exchange = topology.dead_letter_exchange();
        let queue = topology.dead_letter_queue();
        channel
            .declare_exchange(&exchange, ExchangeKind::Topic, ExchangeOptions::durable())
            .await?;
        channel.declare_queue(&queue, &QueueOptions::durable()).await?;
        bind_all(channel, &queue, &exchange, keys).await?;
        arguments.dead_letter_exchange = Some(exchange);
    }

    let work_queue = QueueOptions {
        durable: options.durable(),
        exclusive: options.exclusive(),
        auto_delete: options.auto_delete(),
        arguments,
    };
    channel.declare_queue(topology.work_queue(), &work_queue).await?;
    bind_all(channel, topology.work_queue(), main_exchange, keys).await?;

    // Declared even without retries so replayed dead letters have a way back.
    let retry_exchange = topology.retry_exchange();
    channel
        .declare_exchange(&retry_exchange, ExchangeKind::Topic, ExchangeOptions::durable())
        .await?;
    bind_all(channel, topology.work_queue(), &retry_exchange, keys).await?;

    debug!(queue = topology.work_queue(), binding_keys = ?keys, "registration topology declared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Connector;
    use crate::broker::in_memory::InMemoryBroker;

    #[test]
    fn names_derive_from_queue_name() {
        let t = Topology::new("billing");
        assert_eq!(t.work_queue(), "billing");
        assert_eq!(t.retry_exchange(), "billing-retry");
        assert_eq!(t.dead_letter_exchange(), "billing-dlx");
        assert_eq!(t.dead_letter_queue(), "billing-dl");
        assert_eq!(t.delay_name(300), "billing-delay-300");
    }

    #[test]
    fn delay_queue_arguments() {
        let options = Topology::new("billing").delay_queue_options(100);
        assert!(options.durable);
        assert_eq!(options.arguments.dead_letter_exchange.as_deref(), Some("billing-retry"));
        assert_eq!(options.arguments.message_ttl, Some(100));
        assert_eq!(options.arguments.expires, Some(10_100));
    }

    #[test]
    fn delay_millis_rounds_and_caps() {
        assert_eq!(delay_millis(Duration::from_secs_f64(0.3)), 300);
        assert_eq!(delay_millis(Duration::from_micros(1_499)), 1);
        assert_eq!(delay_millis(Duration::from_micros(1_500)), 2);
        assert_eq!(delay_millis(Duration::from_secs(u64::MAX)), u32::MAX - GRACE_MS);
    }

    #[tokio::test]
    async fn declares_dead_letter_and_retry_topology() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.open().await.unwrap();
        channel
            .declare_exchange("domain-events", ExchangeKind::Topic, ExchangeOptions::durable())
            .await
            .unwrap();

        let options = RegistrationOptions::new("billing", ["order.*", "refund.issued"])
            .with_dead_letter(true);
        declare_registration(channel.as_mut(), "domain-events", &options)
            .await
            .unwrap();

        let work = broker.queue_options("billing").unwrap();
        assert_eq!(work.arguments.dead_letter_exchange.as_deref(), Some("billing-dlx"));
        assert!(broker.queue_exists("billing-dl"));

        let expected = vec![
            ("billing".to_string(), "order.*".to_string()),
            ("billing".to_string(), "refund.issued".to_string()),
        ];
        assert_eq!(broker.bindings("domain-events"), expected);
        assert_eq!(broker.bindings("billing-retry"), expected);
        assert_eq!(broker.bindings("billing-dlx").len(), 2);
    }

    #[tokio::test]
    async fn without_dead_letter_only_retry_exchange_is_added() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.open().await.unwrap();
        channel
            .declare_exchange("domain-events", ExchangeKind::Topic, ExchangeOptions::durable())
            .await
            .unwrap();

        let options = RegistrationOptions::new("audit", ["#"]).with_auto_delete(true);
        declare_registration(channel.as_mut(), "domain-events", &options)
            .await
            .unwrap();

        let work = broker.queue_options("audit").unwrap();
        assert!(work.auto_delete);
        assert_eq!(work.arguments.dead_letter_exchange, None);
        assert!(!broker.queue_exists("audit-dl"));
        assert!(broker.exchange_exists("audit-retry"));
    }

    #[tokio::test]
    async fn failed_bind_fails_the_registration() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.open().await.unwrap();
        let options = RegistrationOptions::new("orphan", ["a.b"]);
        assert!(
            declare_registration(channel.as_mut(), "missing-exchange", &options)
                .await
                .is_err()
        );
        // Partial topology stays behind.
        assert!(broker.queue_exists("orphan"));
    }
}
