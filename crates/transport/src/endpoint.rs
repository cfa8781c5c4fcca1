//! Where a connection manager connects to.

use std::fmt;
use std::sync::Arc;

use herald_core::BrokerAddress;

use crate::broker::Connector;
use crate::broker::amqp::AmqpConnector;
use crate::broker::in_memory::InMemoryBroker;

/// Broker endpoint handed to publishers, subscribers and replayers.
#[derive(Clone)]
pub enum Endpoint {
    /// AMQP URL, connected through `lapin`.
    Amqp(String),
    /// Any other connector, e.g. an [`InMemoryBroker`].
    Connector(Arc<dyn Connector>),
    /// No broker: broker-touching operations log and return.
    Disabled,
}

impl Endpoint {
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    pub(crate) fn connector(&self) -> Option<Arc<dyn Connector>> {
        match self {
            Self::Amqp(url) => Some(Arc::new(AmqpConnector::new(url.clone()))),
            Self::Connector(connector) => Some(Arc::clone(connector)),
            Self::Disabled => None,
        }
    }
}

impl From<BrokerAddress> for Endpoint {
    fn from(address: BrokerAddress) -> Self {
        match address {
            BrokerAddress::Amqp(url) => Self::Amqp(url),
            BrokerAddress::Disabled => Self::Disabled,
        }
    }
}

impl From<&BrokerAddress> for Endpoint {
    fn from(address: &BrokerAddress) -> Self {
        Self::from(address.clone())
    }
}

impl From<InMemoryBroker> for Endpoint {
    fn from(broker: InMemoryBroker) -> Self {
        Self::Connector(Arc::new(broker))
    }
}

impl From<&InMemoryBroker> for Endpoint {
    fn from(broker: &InMemoryBroker) -> Self {
        Self::from(broker.clone())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amqp(url) => f
                .debug_tuple("Amqp")
                .field(&BrokerAddress::amqp(url.clone()).to_string())
                .finish(),
            Self::Connector(connector) => f.debug_tuple("Connector").field(connector).finish(),
            Self::Disabled => f.write_str("Disabled"),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amqp(url) => write!(f, "{}", BrokerAddress::amqp(url.clone())),
            Self::Connector(_) => f.write_str("custom connector"),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}
