use std::time::Duration;

use anyhow::Result;
use herald_core::BrokerConfig;
use herald_events::DomainEvent;
use herald_transport::{Publisher, RegistrationOptions, Replayer, Subscriber, always_retry};
use serde_json::Value as JsonValue;
use structopt::StructOpt;
use tracing::info;

use crate::prompt::Prompt;

#[derive(Debug, StructOpt)]
pub struct ReplayOptions {
    /// Replay all events in the dead-letter queue
    #[structopt(long = "all")]
    pub replay_all: bool,

    /// Ask for the desired action for each event
    #[structopt(long)]
    pub interactive: bool,

    /// Seconds to wait for an answer before leaving the event in place
    #[structopt(long, default_value = "30")]
    pub prompt_timeout: u64,

    /// Subscriber queue names
    #[structopt(required = true)]
    pub queues: Vec<String>,
}

#[derive(Debug, StructOpt)]
pub struct PublishOptions {
    pub routing_key: String,

    /// Event data as any JSON value
    #[structopt(default_value = "{}", parse(try_from_str = serde_json::from_str))]
    pub data: JsonValue,

    #[structopt(long)]
    pub object_id: Option<String>,
}

#[derive(Debug, StructOpt)]
pub struct ListenOptions {
    /// Queue name
    pub name: String,

    #[structopt(required = true)]
    pub binding_keys: Vec<String>,

    #[structopt(long)]
    pub dead_letter: bool,

    #[structopt(long, default_value = "0")]
    pub max_retries: u32,

    /// Stop after this many seconds
    #[structopt(long)]
    pub timeout: Option<f64>,
}

pub fn replay(config: &BrokerConfig, options: ReplayOptions) -> Result<()> {
    let mut replayer = Replayer::from_config(config)?;
    let mut prompt = options
        .interactive
        .then(|| Prompt::stdin(Duration::from_secs(options.prompt_timeout)));

    for queue in &options.queues {
        let remaining = match (prompt.as_mut(), options.replay_all) {
            (Some(prompt), true) => replayer.replay_all(queue, |letter| prompt.ask(letter))?,
            (Some(prompt), false) => replayer.replay_one(queue, |letter| prompt.ask(letter))?,
            (None, true) => replayer.replay_all(queue, always_retry)?,
            (None, false) => replayer.replay_one(queue, always_retry)?,
        };
        println!("{remaining} dead-lettered events remaining for {queue}");
    }
    replayer.disconnect()?;
    Ok(())
}

pub fn publish(config: &BrokerConfig, options: PublishOptions) -> Result<()> {
    let mut event = DomainEvent::new(options.routing_key, options.data);
    if let Some(id) = options.object_id {
        event = event.with_domain_object_id(id);
    }

    let mut publisher = Publisher::from_config(config)?;
    publisher.send(&event)?;
    publisher.disconnect()?;
    println!("{}", event.uuid_string());
    Ok(())
}

pub fn listen(config: &BrokerConfig, options: ListenOptions) -> Result<()> {
    let timeout = options
        .timeout
        .map(Duration::try_from_secs_f64)
        .transpose()?;

    let mut subscriber = Subscriber::from_config(config)?;
    subscriber.stop_on_interrupt(true);
    subscriber.register(
        |event: &DomainEvent| {
            info!(event_id = event.uuid_string(), %event, "event received");
            println!(" [x] {}:{}", event.routing_key(), event.data());
            Ok(())
        },
        RegistrationOptions::new(options.name, options.binding_keys)
            .with_dead_letter(options.dead_letter)
            .with_max_retries(options.max_retries),
    )?;
    subscriber.start_consuming(timeout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn publish_accepts_any_json_value() {
        let config = BrokerConfig::disabled();
        for data in [json!([1, 2, 3]), json!("text"), json!(null), json!({"a": 1})] {
            let options = PublishOptions {
                routing_key: "test.publish".into(),
                data,
                object_id: None,
            };
            publish(&config, options).unwrap();
        }
    }
}
