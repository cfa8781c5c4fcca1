//! The domain event and its wire codec.
//!
//! This crate is pure data: no broker access, no threads. The transport crate
//! moves the bytes produced here; handlers receive the values parsed here.

pub mod event;
pub mod handler;

pub use event::DomainEvent;
pub use handler::{DEFAULT_RETRY_DELAY, Handler, HandlerError, HandlerResult};
