use anyhow::Result;
use herald_core::BrokerConfig;
use structopt::StructOpt;

mod commands;
mod prompt;

use crate::commands::{ListenOptions, PublishOptions, ReplayOptions};

#[derive(Debug, StructOpt)]
#[structopt(name = "herald", about = "Publish, consume and replay domain events.")]
struct MainOptions {
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Move dead-lettered events back into their subscriber queues
    Replay(ReplayOptions),

    /// Publish one event to the main exchange
    Publish(PublishOptions),

    /// Register a handler that logs every event it receives
    Listen(ListenOptions),
}

fn main() -> Result<()> {
    let options = MainOptions::from_args();
    herald_observability::init();
    let config = BrokerConfig::from_env()?;

    match options.cmd {
        Command::Replay(options) => commands::replay(&config, options),
        Command::Publish(options) => commands::publish(&config, options),
        Command::Listen(options) => commands::listen(&config, options),
    }
}
