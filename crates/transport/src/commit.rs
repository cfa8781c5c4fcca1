//! Publishing deferred until the caller's transaction commits.

use herald_core::{BrokerConfig, BrokerResult};
use herald_events::DomainEvent;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::publisher::Publisher;

/// Events waiting for a commit.
///
/// `commit` publishes everything over one connection; `rollback` drops it.
/// Events are built when deferred, so their ids are known right away.
#[derive(Debug)]
pub struct CommitBuffer {
    endpoint: Endpoint,
    exchange: String,
    pending: Vec<DomainEvent>,
}

impl CommitBuffer {
    pub fn new(endpoint: impl Into<Endpoint>, exchange: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            exchange: exchange.into(),
            pending: Vec::new(),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.publisher_address(), config.exchange.clone())
    }

    /// Build an event and hold it until commit.
    pub fn defer(&mut self, routing_key: impl Into<String>, data: JsonValue) -> &DomainEvent {
        self.defer_event(DomainEvent::new(routing_key, data))
    }

    pub fn defer_event(&mut self, event: DomainEvent) -> &DomainEvent {
        self.pending.push(event);
        &self.pending[self.pending.len() - 1]
    }

    pub fn pending(&self) -> &[DomainEvent] {
        &self.pending
    }

    /// Publish all pending events in order.
    ///
    /// On failure the events not yet published stay pending, so the commit
    /// can be retried.
    pub fn commit(&mut self) -> BrokerResult<Vec<DomainEvent>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let mut publisher = Publisher::connect(self.endpoint.clone(), self.exchange.clone())?;
        let events = std::mem::take(&mut self.pending);

        let mut published = Vec::with_capacity(events.len());
        let mut events = events.into_iter();
        while let Some(event) = events.next() {
            if let Err(err) = publisher.send(&event) {
                self.pending.push(event);
                self.pending.extend(events);
                warn!(
                    error = %err,
                    published = published.len(),
                    pending = self.pending.len(),
                    "commit interrupted"
                );
                return Err(err);
            }
            published.push(event);
        }
        publisher.disconnect()?;
        debug!(count = published.len(), "deferred events published");
        Ok(published)
    }

    /// Drop all pending events; returns how many were dropped.
    pub fn rollback(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            debug!(count = dropped, "deferred events discarded");
        }
        dropped
    }
}

impl Drop for CommitBuffer {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                pending = self.pending.len(),
                "commit buffer dropped with unpublished events"
            );
        }
    }
}
