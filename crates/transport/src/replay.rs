//! Moving dead-lettered messages back into the live flow.
//!
//! The replayer pulls messages from `<name>-dl` with a plain get, one at a
//! time, and asks a decision function what to do with each one. It needs no
//! running subscriber: replayed messages go to `<name>-retry`, which routes
//! them back into the work queue.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use herald_core::{BrokerConfig, BrokerError, BrokerResult};
use herald_events::DomainEvent;
use tracing::{info, warn};

use crate::broker::{Fetched, MessageProperties};
use crate::connection::ConnectionManager;
use crate::endpoint::Endpoint;
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDecision {
    /// Republish to the retry exchange, then remove from the dead-letter queue.
    Retry,
    /// Remove from the dead-letter queue.
    Discard,
    /// Put back at the head of the dead-letter queue.
    Leave,
}

impl FromStr for ReplayDecision {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "retry" | "replay" => Ok(Self::Retry),
            "d" | "discard" => Ok(Self::Discard),
            "l" | "leave" => Ok(Self::Leave),
            _ => Err(BrokerError::invalid_decision(s.trim())),
        }
    }
}

impl fmt::Display for ReplayDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Retry => "retry",
            Self::Discard => "discard",
            Self::Leave => "leave",
        })
    }
}

/// A message fetched from a dead-letter queue, handed to the decision
/// function.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Work queue the message was dead-lettered from.
    pub queue: String,
    pub delivery_tag: u64,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    /// Messages left in the dead-letter queue behind this one.
    pub remaining: u32,
}

impl DeadLetter {
    fn new(queue: &str, fetched: Fetched) -> Self {
        let Fetched {
            delivery,
            message_count,
        } = fetched;
        Self {
            queue: queue.to_string(),
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key,
            properties: delivery.properties,
            body: delivery.body,
            remaining: message_count,
        }
    }

    /// Decode the body as an event.
    pub fn event(&self) -> BrokerResult<DomainEvent> {
        DomainEvent::from_slice(&self.body)
    }
}

/// Default decision: replay everything.
pub fn always_retry(_: &DeadLetter) -> BrokerResult<ReplayDecision> {
    Ok(ReplayDecision::Retry)
}

#[derive(Debug)]
pub struct Replayer {
    conn: ConnectionManager,
}

impl Replayer {
    pub fn connect(
        endpoint: impl Into<Endpoint>,
        exchange: impl Into<String>,
    ) -> BrokerResult<Self> {
        Ok(Self {
            conn: ConnectionManager::connect(endpoint, exchange)?,
        })
    }

    /// Dead letters live on the consume side.
    pub fn from_config(config: &BrokerConfig) -> BrokerResult<Self> {
        Self::connect(config.subscriber_address(), config.exchange.clone())
    }

    /// Handle one message from `<queue>-dl` and return how many were left
    /// behind it at fetch time. An empty queue returns 0 without calling
    /// `decide`.
    ///
    /// If `decide` fails the message is put back and the error returned.
    pub fn replay_one<F>(&mut self, queue: &str, decide: F) -> BrokerResult<u32>
    where
        F: FnOnce(&DeadLetter) -> BrokerResult<ReplayDecision>,
    {
        let Some(io) = self.conn.io("replay")? else {
            return Ok(0);
        };
        let topology = Topology::new(queue);
        let dead_letter_queue = topology.dead_letter_queue();

        let Some(fetched) = io.runtime.block_on(io.channel.get(&dead_letter_queue))? else {
            return Ok(0);
        };
        let letter = DeadLetter::new(queue, fetched);
        let tag = letter.delivery_tag;

        let decision = match decide(&letter) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(
                    queue = %dead_letter_queue,
                    error = %err,
                    "no valid replay decision; message left in place"
                );
                io.runtime.block_on(io.channel.reject(tag, true))?;
                return Err(err);
            }
        };

        io.runtime.block_on(async {
            match decision {
                ReplayDecision::Retry => {
                    io.channel
                        .publish(
                            &topology.retry_exchange(),
                            &letter.routing_key,
                            &letter.body,
                            &MessageProperties::persistent_json(),
                        )
                        .await?;
                    io.channel.ack(tag).await
                }
                ReplayDecision::Discard => io.channel.ack(tag).await,
                ReplayDecision::Leave => io.channel.reject(tag, true).await,
            }
        })?;
        info!(
            queue,
            routing_key = %letter.routing_key,
            %decision,
            remaining = letter.remaining,
            "dead letter handled"
        );
        Ok(letter.remaining)
    }

    /// Replay until the dead-letter queue reports nothing left.
    ///
    /// Bounded by the count seen on the first fetch, so messages that are
    /// left in place are visited at most once.
    pub fn replay_all<F>(&mut self, queue: &str, mut decide: F) -> BrokerResult<u32>
    where
        F: FnMut(&DeadLetter) -> BrokerResult<ReplayDecision>,
    {
        let mut remaining = self.replay_one(queue, &mut decide)?;
        let mut budget = remaining;
        while remaining > 0 && budget > 0 {
            remaining = self.replay_one(queue, &mut decide)?;
            budget -= 1;
        }
        Ok(remaining)
    }
}

impl Deref for Replayer {
    type Target = ConnectionManager;

    fn deref(&self) -> &ConnectionManager {
        &self.conn
    }
}

impl DerefMut for Replayer {
    fn deref_mut(&mut self) -> &mut ConnectionManager {
        &mut self.conn
    }
}
