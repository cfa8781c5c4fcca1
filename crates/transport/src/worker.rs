//! Single-slot handler worker.
//!
//! Handlers run on one dedicated thread, one event at a time, no matter how
//! many registrations a subscriber has. The worker never sees the broker
//! channel: it turns each handler result into a [`Disposition`] and posts a
//! [`Completion`] back to the IO thread, which performs the ack, retry or
//! reject.
//!
//! A panicking handler counts as a failed one.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use herald_core::{BrokerError, BrokerResult};
use herald_events::{DomainEvent, Handler, HandlerError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

use crate::retry::{self, Disposition};

/// One handler invocation.
pub(crate) struct Job {
    pub delivery_tag: u64,
    pub queue: String,
    pub handler: Handler,
    pub max_retries: u32,
    pub event: DomainEvent,
}

/// Intent posted back to the IO thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub delivery_tag: u64,
    pub disposition: Disposition,
}

/// Owns the worker thread. Dropping it lets the current handler finish and
/// joins the thread.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    jobs: Option<mpsc::Sender<Job>>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(name: &str, completions: UnboundedSender<Completion>) -> BrokerResult<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(jobs_rx, completions))
            .map_err(|e| BrokerError::Worker(e.to_string()))?;
        Ok(Self {
            jobs: Some(jobs_tx),
            join: Some(join),
        })
    }

    pub fn submit(&self, job: Job) -> BrokerResult<()> {
        self.jobs
            .as_ref()
            .ok_or_else(|| BrokerError::Worker("worker is shut down".into()))?
            .send(job)
            .map_err(|_| BrokerError::Worker("worker thread has exited".into()))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn worker_loop(jobs: mpsc::Receiver<Job>, completions: UnboundedSender<Completion>) {
    while let Ok(job) = jobs.recv() {
        let completion = Completion {
            delivery_tag: job.delivery_tag,
            disposition: run_job(&job),
        };
        if completions.send(completion).is_err() {
            debug!(delivery_tag = job.delivery_tag, "io loop gone; completion dropped");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run the handler and decide what happens to the message.
pub(crate) fn run_job(job: &Job) -> Disposition {
    let event = &job.event;
    let result = panic::catch_unwind(AssertUnwindSafe(|| (job.handler)(event)))
        .unwrap_or_else(|payload| {
            Err(HandlerError::msg(format!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
    let disposition = retry::decide(&result, event.retries(), job.max_retries);

    match (&result, disposition) {
        (Ok(()), _) => debug!(
            queue = %job.queue,
            event_id = event.uuid_string(),
            routing_key = event.routing_key(),
            "event handled"
        ),
        (Err(HandlerError::Retry { delay }), Disposition::Retry { .. }) => info!(
            queue = %job.queue,
            event_id = event.uuid_string(),
            routing_key = event.routing_key(),
            retries = event.retries(),
            delay_secs = delay.as_secs_f64(),
            "retry ({}) consuming event in {:.1}s",
            event.retries(),
            delay.as_secs_f64()
        ),
        (Err(HandlerError::Retry { .. }), _) => error!(
            queue = %job.queue,
            event_id = event.uuid_string(),
            routing_key = event.routing_key(),
            error = %BrokerError::retries_exhausted(event.routing_key(), job.max_retries),
            "event has been dead-lettered or discarded"
        ),
        (Err(HandlerError::Failure(err)), _) => {
            let reason = format!("{err:#}");
            error!(
                queue = %job.queue,
                event_id = event.uuid_string(),
                routing_key = event.routing_key(),
                error = %reason,
                "event has been dead-lettered or discarded"
            )
        }
    }
    disposition
}
