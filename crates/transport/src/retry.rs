//! Retry and dead-letter semantics.
//!
//! The engine keeps no timers. A retry republishes the message into a
//! per-delay TTL queue; when the TTL runs out the broker dead-letters it into
//! the registration's retry exchange, which routes it back to the work
//! queue. Each hop through a delay queue adds to the broker-maintained
//! `x-death` header, which is where the retry count comes from.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use herald_core::BrokerResult;
use herald_events::{HandlerError, HandlerResult};
use tracing::debug;

use crate::broker::{Channel, Delivery, ExchangeKind, ExchangeOptions, HeaderValue, Headers};
use crate::topology::{DELAY_QUEUE_GRACE, Topology, delay_millis};

/// Safety margin before a cached delay queue is treated as possibly expired.
const FRESHNESS_MARGIN: Duration = Duration::from_secs(1);

/// What the IO thread does with a delivery once its handler has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Republish through the delay queue for `delay`, then ack.
    Retry { delay: Duration },
    /// Reject without requeue: dead-letter queue if configured, else dropped.
    Reject,
}

/// Map a handler result to a disposition.
///
/// A retry request is honoured while `retries < max_retries`; after that
/// the message is rejected like any other failure.
pub fn decide(result: &HandlerResult, retries: u32, max_retries: u32) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(HandlerError::Retry { delay }) if retries < max_retries => {
            Disposition::Retry { delay: *delay }
        }
        Err(HandlerError::Retry { .. }) | Err(HandlerError::Failure(_)) => Disposition::Reject,
    }
}

/// Number of delay-queue hops recorded in the `x-death` header.
///
/// Counts entries with reason `expired`, using their `count` field when the
/// broker maintains one and one per entry otherwise.
pub fn retry_count(headers: Option<&Headers>) -> u32 {
    let Some(deaths) = headers
        .and_then(|h| h.get("x-death"))
        .and_then(HeaderValue::as_array)
    else {
        return 0;
    };

    let total: i64 = deaths
        .iter()
        .filter_map(HeaderValue::as_table)
        .filter(|entry| entry.get("reason").and_then(HeaderValue::as_str) == Some("expired"))
        .map(|entry| {
            entry
                .get("count")
                .and_then(HeaderValue::as_i64)
                .unwrap_or(1)
                .max(0)
        })
        .sum();
    u32::try_from(total).unwrap_or(u32::MAX)
}

/// Remembers which delay exchanges were recently declared and bound.
///
/// Keyed by (registration, delay in ms). The delay queue itself is
/// re-declared on every retry to reset its expiry; its exchange and binding
/// are only re-declared once the queue may have expired in between.
/// Entries whose queue the broker has already expired are dropped.
#[derive(Debug, Default)]
pub struct DelayQueueCache {
    declared: HashMap<(String, u32), Instant>,
}

impl DelayQueueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a queue declaration at `now`; returns whether the exchange
    /// and binding must be declared as well.
    pub fn touch(&mut self, registration: &str, delay_ms: u32, now: Instant) -> bool {
        self.declared
            .retain(|(_, ms), at| now.saturating_duration_since(*at) < queue_lifetime(*ms));
        let previous = self.declared.insert((registration.to_string(), delay_ms), now);
        match previous {
            None => true,
            Some(at) => {
                now.saturating_duration_since(at) + FRESHNESS_MARGIN >= queue_lifetime(delay_ms)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }
}

fn queue_lifetime(delay_ms: u32) -> Duration {
    Duration::from_millis(u64::from(delay_ms)) + DELAY_QUEUE_GRACE
}

/// Republish `delivery` through the delay queue for `delay`.
///
/// Original routing key and properties are kept so the broker keeps
/// counting in `x-death`.
pub async fn schedule_retry(
    channel: &mut dyn Channel,
    cache: &mut DelayQueueCache,
    topology: &Topology,
    delivery: &Delivery,
    delay: Duration,
) -> BrokerResult<()> {
    let delay_ms = delay_millis(delay);
    let name = topology.delay_name(delay_ms);

    channel
        .declare_queue(&name, &topology.delay_queue_options(delay_ms))
        .await?;
    if cache.touch(topology.work_queue(), delay_ms, Instant::now()) {
        let options = ExchangeOptions {
            durable: true,
            auto_delete: true,
        };
        channel
            .declare_exchange(&name, ExchangeKind::Topic, options)
            .await?;
        channel.bind_queue(&name, &name, "#").await?;
    }
    channel
        .publish(&name, &delivery.routing_key, &delivery.body, &delivery.properties)
        .await?;

    debug!(
        queue = topology.work_queue(),
        delay_queue = %name,
        routing_key = %delivery.routing_key,
        "message parked for retry"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::in_memory::InMemoryBroker;
    use crate::broker::{Connector, MessageProperties};

    fn death(reason: &str, queue: &str, count: Option<i64>) -> HeaderValue {
        let mut entry = Headers::new();
        entry.insert("reason".into(), HeaderValue::String(reason.into()));
        entry.insert("queue".into(), HeaderValue::String(queue.into()));
        if let Some(count) = count {
            entry.insert("count".into(), HeaderValue::Int(count));
        }
        HeaderValue::Table(entry)
    }

    fn headers(deaths: Vec<HeaderValue>) -> Headers {
        let mut headers = Headers::new();
        headers.insert("x-death".into(), HeaderValue::Array(deaths));
        headers
    }

    #[test]
    fn decide_maps_outcomes() {
        let retry = Err(HandlerError::retry(Duration::from_millis(100)));
        assert_eq!(decide(&Ok(()), 0, 0), Disposition::Ack);
        assert_eq!(
            decide(&retry, 2, 3),
            Disposition::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(decide(&retry, 3, 3), Disposition::Reject);
        assert_eq!(decide(&retry, 0, 0), Disposition::Reject);
        assert_eq!(decide(&Err(HandlerError::msg("boom")), 0, 5), Disposition::Reject);
    }

    #[test]
    fn retry_count_reads_x_death() {
        assert_eq!(retry_count(None), 0);
        assert_eq!(retry_count(Some(&Headers::new())), 0);

        let h = headers(vec![death("expired", "q-delay-100", Some(3))]);
        assert_eq!(retry_count(Some(&h)), 3);

        // Varying delays keep counting across delay queues.
        let h = headers(vec![
            death("expired", "q-delay-300", Some(1)),
            death("expired", "q-delay-100", Some(2)),
        ]);
        assert_eq!(retry_count(Some(&h)), 3);

        // Rejections into the dead-letter queue are not retries.
        let h = headers(vec![
            death("rejected", "q", Some(1)),
            death("expired", "q-delay-100", Some(1)),
        ]);
        assert_eq!(retry_count(Some(&h)), 1);

        // Brokers without a count field append one entry per hop.
        let h = headers(vec![
            death("expired", "q-delay-100", None),
            death("expired", "q-delay-100", None),
        ]);
        assert_eq!(retry_count(Some(&h)), 2);
    }

    #[test]
    fn cache_redeclares_binding_only_when_stale() {
        let mut cache = DelayQueueCache::new();
        let start = Instant::now();
        assert!(cache.touch("q", 100, start));
        assert!(!cache.touch("q", 100, start + Duration::from_secs(5)));
        assert!(cache.touch("q", 200, start));
        // 10.1s lifetime minus margin, measured from the last touch at 5s.
        assert!(cache.touch("q", 100, start + Duration::from_secs(15)));
        // The 200ms queue expired at 10.2s and is gone.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_delays_are_pruned() {
        let mut cache = DelayQueueCache::new();
        let start = Instant::now();
        for delay_ms in 0..10_000 {
            cache.touch("q", delay_ms, start);
        }
        assert_eq!(cache.len(), 10_000);

        let next_day = start + Duration::from_secs(24 * 60 * 60);
        assert!(cache.touch("q", 5, next_day));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn schedule_retry_parks_message_in_delay_queue() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.open().await.unwrap();
        let topology = Topology::new("q");
        channel
            .declare_exchange("q-retry", ExchangeKind::Topic, ExchangeOptions::durable())
            .await
            .unwrap();

        let delivery = Delivery {
            delivery_tag: 1,
            exchange: "domain-events".into(),
            routing_key: "user.registered".into(),
            redelivered: false,
            properties: MessageProperties::persistent_json(),
            body: b"{}".to_vec(),
        };
        let mut cache = DelayQueueCache::new();
        schedule_retry(
            channel.as_mut(),
            &mut cache,
            &topology,
            &delivery,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert_eq!(broker.queue_size("q-delay-60000"), Some(1));
        assert_eq!(
            broker.bindings("q-delay-60000"),
            vec![("q-delay-60000".to_string(), "#".to_string())]
        );
        let (props, body) = broker.pop_message("q-delay-60000").unwrap();
        assert_eq!(props, delivery.properties);
        assert_eq!(body, delivery.body);
    }
}
