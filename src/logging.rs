//! Tracing setup and the bridge from broker-client log lines into `tracing`.

use rdkafka::config::RDKafkaLogLevel;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs the global subscriber: JSON lines or human-readable output,
/// filtered by `RUST_LOG` unless `verbose` is set.
///
/// Calling it twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("typed_kafka=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("typed_kafka=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Level a librdkafka log line is emitted at.
pub fn client_log_level(level: RDKafkaLogLevel) -> Level {
    match level {
        RDKafkaLogLevel::Emerg
        | RDKafkaLogLevel::Alert
        | RDKafkaLogLevel::Critical
        | RDKafkaLogLevel::Error => Level::ERROR,
        RDKafkaLogLevel::Warning => Level::WARN,
        RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => Level::INFO,
        RDKafkaLogLevel::Debug => Level::DEBUG,
    }
}

/// Re-emits one librdkafka log line, tagged with the client it came from.
pub fn forward_client_log(client: &str, level: RDKafkaLogLevel, facility: &str, message: &str) {
    let level = client_log_level(level);
    if level == Level::ERROR {
        error!(client = %client, facility = %facility, "{}", message);
    } else if level == Level::WARN {
        warn!(client = %client, facility = %facility, "{}", message);
    } else if level == Level::INFO {
        info!(client = %client, facility = %facility, "{}", message);
    } else {
        debug!(client = %client, facility = %facility, "{}", message);
    }
}
