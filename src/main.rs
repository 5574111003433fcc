//! CLI for nsqlink
//!
//! Subcommands:
//! - `publish`: send one message (optionally deferred) to a topic
//! - `subscribe`: print every message of a topic until Ctrl-C
//! - `create-topic`: create a topic through nsqlookupd

use std::sync::Arc;

use clap::Parser;
use nsqlink::broker::{BrokerClient, ClientOptions, HandlerFn};
use nsqlink::config::{Settings, load_config};
use nsqlink::message::MessageEnvelope;
use nsqlink::utils::error::HandlerError;
use nsqlink::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "nsqlink")]
enum Command {
    /// Publish a message to a topic
    Publish {
        topic: String,
        message: String,
        /// Hold the message back for this many milliseconds
        #[arg(long)]
        defer_ms: Option<i64>,
    },
    /// Print messages from a topic until interrupted
    Subscribe { topic: String },
    /// Create a topic through nsqlookupd
    CreateTopic { topic: String },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.log_level);

    if let Err(e) = run(cmd, &settings).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cmd: Command, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let client = BrokerClient::new(ClientOptions::from(settings));

    match cmd {
        Command::Publish {
            topic,
            message,
            defer_ms,
        } => {
            client.init(settings).await?;
            match defer_ms {
                Some(ms) => {
                    client
                        .deferred_publish(&topic, chrono::Duration::milliseconds(ms), message.as_bytes())
                        .await?
                }
                None => client.publish(&topic, message.as_bytes()).await?,
            }
            info!("Published to {}", topic);
        }
        Command::Subscribe { topic } => {
            client.init(settings).await?;
            let handler = HandlerFn::new(|queue: String, message: MessageEnvelope| async move {
                match message.data() {
                    Some(data) => println!("[{queue}] {}", String::from_utf8_lossy(data)),
                    None => println!("[{queue}] <null>"),
                }
                Ok::<(), HandlerError>(())
            });
            client.subscribe(&topic, Arc::new(handler)).await?;
            info!("Subscribed to {}. Press Ctrl-C to stop.", topic);

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received. Exiting gracefully.");
        }
        Command::CreateTopic { topic } => {
            client.resolve_endpoints(settings);
            client.create_topic(&topic).await?;
            info!("Created topic {}", topic);
        }
    }

    client.close().await?;
    Ok(())
}
