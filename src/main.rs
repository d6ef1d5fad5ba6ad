use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use typed_kafka::config::{env_lookup, KEY_KAFKA_TOPICS_CONFIG};
use typed_kafka::logging::init_logging;
use typed_kafka::{AuthNegotiator, KafkaTopicsConfig};

#[derive(Parser, Debug)]
#[command(name = "typed-kafka")]
#[command(about = "Validates a Kafka topics configuration document", long_about = None)]
struct Args {
    /// Read the topics document from this file instead of KAFKA_TOPICS_CONFIG
    #[arg(short, long, value_name = "FILE")]
    file: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    let topics = match &args.file {
        Some(path) => {
            info!("Loading topics configuration from {:?}", path);
            KafkaTopicsConfig::from_file(path, env_lookup)
                .with_context(|| format!("failed to load {}", path.display()))
        }
        None => {
            info!("Loading topics configuration from {}", KEY_KAFKA_TOPICS_CONFIG);
            KafkaTopicsConfig::from_env()
                .with_context(|| format!("failed to resolve {}", KEY_KAFKA_TOPICS_CONFIG))
        }
    };
    let topics = match topics {
        Ok(topics) => topics,
        Err(e) => {
            error!("Invalid topics configuration: {:#}", e);
            return Err(e);
        }
    };

    let negotiator = AuthNegotiator::default();
    let mut keys: Vec<&str> = topics.topics().map(|(key, _)| key).collect();
    keys.sort_unstable();

    for key in keys {
        let cfg = topics.topic(key)?;
        // Building client options checks the mechanism without dialing.
        let options = negotiator
            .build_client_options(&cfg)
            .with_context(|| format!("kafka topic {}", key))?;
        info!(
            topic_key = %key,
            topic = %cfg.physical_topic(),
            brokers = ?cfg.brokers(),
            username = %cfg.username(),
            consumer_group = cfg.consumer_group_id().unwrap_or("-"),
            mechanism = options.mechanism_name(),
            "Topic configuration"
        );
    }

    info!(topics = topics.len(), "Topics configuration is valid");
    Ok(())
}
