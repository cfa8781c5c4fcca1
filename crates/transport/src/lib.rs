//! Domain-event delivery over an AMQP broker.
//!
//! - [`Publisher`] sends events to the main topic exchange.
//! - [`Subscriber`] registers handlers on named queues and runs the
//!   consumption loop: one IO thread owns the broker channel, one worker
//!   thread runs handlers, completions travel back as intents.
//! - Retries use broker-side TTL queues (`<name>-delay-<ms>`) that
//!   dead-letter into `<name>-retry`; exhausted or failed messages go to
//!   `<name>-dl` when the registration asks for a dead-letter queue.
//! - [`Replayer`] moves dead-lettered messages back into the live flow.
//! - [`CommitBuffer`] defers publishing until the caller's transaction commits.
//!
//! The public API is blocking. Broker access goes through the [`broker`]
//! seam, implemented for AMQP (`lapin`) and by an in-memory broker used for
//! tests and local development.

pub mod broker;
pub mod commit;
pub mod connection;
pub mod endpoint;
pub mod publisher;
pub mod replay;
pub mod retry;
pub mod subscriber;
pub mod topology;
pub mod worker;

pub use broker::in_memory::InMemoryBroker;
pub use commit::CommitBuffer;
pub use connection::ConnectionManager;
pub use endpoint::Endpoint;
pub use publisher::{Publisher, publish_event, publish_event_to};
pub use replay::{DeadLetter, ReplayDecision, Replayer, always_retry};
pub use subscriber::{RegistrationOptions, StopHandle, Subscriber};
pub use topology::Topology;
