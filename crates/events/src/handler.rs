//! Event handler capability.
//!
//! A handler is a plain function of one event. Returning `Ok(())`
//! acknowledges the message. Returning [`HandlerError::Retry`] asks for a
//! delayed redelivery; anything else (including a panic) is a failure and
//! sends the message to the dead-letter queue, or drops it when the
//! registration has none.
//!
//! Any `std::error::Error` converts into a failure, so handlers can use `?`:
//!
//! ```ignore
//! fn on_registered(event: &DomainEvent) -> HandlerResult {
//!     let id: u64 = event.data()["user_id"].to_string().parse()?;
//!     if !mailer_ready() {
//!         return Err(HandlerError::retry(Duration::from_secs(30)));
//!     }
//!     send_welcome_mail(id);
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::DomainEvent;

/// Delay used by [`HandlerError::retry_later`].
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// What a handler reports back when it did not succeed.
pub enum HandlerError {
    /// Redeliver the event after `delay`. Broker TTLs have millisecond resolution.
    Retry { delay: Duration },
    /// The event could not be processed.
    Failure(anyhow::Error),
}

pub type HandlerResult = Result<(), HandlerError>;

/// Shared, thread-safe handler as stored by a subscriber.
pub type Handler = Arc<dyn Fn(&DomainEvent) -> HandlerResult + Send + Sync>;

impl HandlerError {
    pub fn retry(delay: Duration) -> Self {
        Self::Retry { delay }
    }

    /// Retry after `secs` seconds; negative or non-finite values mean "now".
    pub fn retry_after_secs(secs: f64) -> Self {
        Self::Retry {
            delay: Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO),
        }
    }

    pub fn retry_later() -> Self {
        Self::retry(DEFAULT_RETRY_DELAY)
    }

    pub fn failure(err: impl Into<anyhow::Error>) -> Self {
        Self::Failure(err.into())
    }

    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failure(anyhow::Error::msg(message))
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::Failure(anyhow::Error::new(err))
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry { delay } => f.debug_struct("Retry").field("delay", delay).finish(),
            Self::Failure(err) => f.debug_tuple("Failure").field(err).finish(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry { delay } => write!(f, "retry requested in {:.3}s", delay.as_secs_f64()),
            Self::Failure(err) => write!(f, "handler failed: {err:#}"),
        }
    }
}
