//! Connection manager.
//!
//! Owns one broker connection and its channel, plus the single-threaded
//! runtime that drives them. The thread calling into the manager is the IO
//! thread: every channel operation runs there via `block_on`, and nothing
//! else ever touches the channel.
//!
//! Lifecycle: `connect` opens the connection and declares the main topic
//! exchange (durable, never auto-deleted). `disconnect` closes it; after
//! that the manager is dead and every broker operation fails with
//! `Disconnected`. Reconnecting means building a new manager.
//!
//! With a disabled endpoint every broker-touching operation logs at debug
//! level and returns without doing anything.

use herald_core::{BrokerError, BrokerResult};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use crate::broker::{Channel, ExchangeKind, ExchangeOptions, QueueState};
use crate::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disabled,
    Open,
    Closed,
}

/// Runtime and channel borrowed together for one broker round-trip.
pub(crate) struct Io<'a> {
    pub runtime: &'a Runtime,
    pub channel: &'a mut dyn Channel,
    pub exchange: &'a str,
}

pub struct ConnectionManager {
    exchange: String,
    runtime: Runtime,
    channel: Option<Box<dyn Channel>>,
    state: State,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("exchange", &self.exchange)
            .field("state", &self.state)
            .finish()
    }
}

impl ConnectionManager {
    /// Connect and declare the main topic exchange.
    ///
    /// Fails with `BrokerUnavailable` when the broker cannot be reached.
    pub fn connect(
        endpoint: impl Into<Endpoint>,
        exchange: impl Into<String>,
    ) -> BrokerResult<Self> {
        let endpoint = endpoint.into();
        let exchange = exchange.into();
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BrokerError::unavailable(format!("failed to start io runtime: {e}")))?;

        let Some(connector) = endpoint.connector() else {
            debug!(exchange = %exchange, "no broker configured; connection is disabled");
            return Ok(Self {
                exchange,
                runtime,
                channel: None,
                state: State::Disabled,
            });
        };

        let channel = runtime.block_on(async {
            let mut channel = connector.open().await?;
            channel
                .declare_exchange(&exchange, ExchangeKind::Topic, ExchangeOptions::durable())
                .await?;
            Ok::<_, BrokerError>(channel)
        })?;
        info!(broker = %endpoint, exchange = %exchange, "connected to broker");

        Ok(Self {
            exchange,
            runtime,
            channel: Some(channel),
            state: State::Open,
        })
    }

    /// Name of the main topic exchange.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn is_disabled(&self) -> bool {
        self.state == State::Disabled
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Borrow runtime and channel for `op`.
    ///
    /// `Ok(None)` means the manager is disabled and the caller should return
    /// without doing anything.
    pub(crate) fn io(&mut self, op: &'static str) -> BrokerResult<Option<Io<'_>>> {
        match self.state {
            State::Disabled => {
                debug!(op, "no broker configured; operation is deactivated");
                Ok(None)
            }
            State::Closed => Err(BrokerError::Disconnected),
            State::Open => match self.channel.as_mut() {
                Some(channel) => Ok(Some(Io {
                    runtime: &self.runtime,
                    channel: &mut **channel,
                    exchange: &self.exchange,
                })),
                None => Err(BrokerError::Disconnected),
            },
        }
    }

    /// Close the connection. Idempotent; the manager stays dead afterwards.
    pub fn disconnect(&mut self) -> BrokerResult<()> {
        match self.state {
            State::Disabled => {
                debug!("no broker configured; disconnect is deactivated");
                Ok(())
            }
            State::Closed => Ok(()),
            State::Open => {
                self.state = State::Closed;
                if let Some(mut channel) = self.channel.take() {
                    self.runtime.block_on(channel.close())?;
                }
                info!(exchange = %self.exchange, "disconnected from broker");
                Ok(())
            }
        }
    }

    /// Whether a queue exists (passive declare). `false` when disabled.
    pub fn queue_exists(&mut self, name: &str) -> BrokerResult<bool> {
        Ok(self.inspect_queue(name)?.is_some())
    }

    /// Ready messages in a queue, `None` if it does not exist or when disabled.
    pub fn queue_size(&mut self, name: &str) -> BrokerResult<Option<u32>> {
        Ok(self.inspect_queue(name)?.map(|q| q.message_count))
    }

    fn inspect_queue(&mut self, name: &str) -> BrokerResult<Option<QueueState>> {
        let Some(io) = self.io("inspect_queue")? else {
            return Ok(None);
        };
        io.runtime.block_on(io.channel.inspect_queue(name))
    }

    pub fn delete_queue(&mut self, name: &str) -> BrokerResult<()> {
        let Some(io) = self.io("delete_queue")? else {
            return Ok(());
        };
        io.runtime.block_on(io.channel.delete_queue(name))?;
        debug!(queue = name, "queue deleted");
        Ok(())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.state != State::Open {
            return;
        }
        // block_on panics inside another runtime; leave the socket to the OS then.
        if tokio::runtime::Handle::try_current().is_ok() {
            warn!(
                exchange = %self.exchange,
                "connection manager dropped inside a runtime; not closing"
            );
            return;
        }
        if let Err(err) = self.disconnect() {
            warn!(error = %err, "failed to close broker connection");
        }
    }
}
