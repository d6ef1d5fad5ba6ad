//! Error types and result handling for typed-kafka.
//!
//! This module defines the main error type [`Error`], the setup-time
//! sub-errors [`ConfigError`] and [`AuthError`], and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use typed_kafka::{ConfigError, Error, Result};
//!
//! fn build_consumer() -> Result<()> {
//!     Err(ConfigError::MissingGroup {
//!         topic_key: "orders".to_string(),
//!     }
//!     .into())
//! }
//!
//! match build_consumer() {
//!     Ok(()) => println!("Consumer running"),
//!     Err(Error::Config(e)) => eprintln!("Fix your configuration: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for typed-kafka operations.
///
/// Setup-time failures (`Config`, `Auth`, initial `Connection`) are returned
/// synchronously and must stop startup. Steady-state failures inside the
/// consume loop are logged and contained; they only surface through this type
/// when a producer call fails.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incomplete topic configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Credential exchange failure or unsupported mechanism.
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Kafka client error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding messages.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload could not be decoded into the consumer's payload type.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// I/O error, typically from reading a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Broker unreachable or connection setup failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The client was closed underneath the caller.
    ///
    /// The consumer loop treats this as a clean termination signal.
    #[error("Client closed")]
    Closed,

    /// A user callback reported failure.
    #[error("Callback error: {0}")]
    Callback(String),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },
}

/// Configuration errors. Always fatal to the affected topic's setup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The topics document is not a JSON object of topic descriptors.
    #[error("malformed topics configuration: {0}")]
    Malformed(#[source] serde_json::Error),

    /// No usable secret for the topic. `var_name` is empty when neither
    /// `password` nor `passwordEnvVar` was supplied, or when the literal
    /// password is empty.
    #[error("kafka topic {topic_key}: password {} is empty", describe_var(.var_name))]
    MissingSecret { topic_key: String, var_name: String },

    /// Both `password` and `passwordEnvVar` were supplied.
    #[error("kafka topic {topic_key}: exactly one of password or passwordEnvVar must be set")]
    AmbiguousSecret { topic_key: String },

    /// A consumer was requested for a topic without a consumer group.
    #[error("kafka topic {topic_key}: consumer group is missing or empty")]
    MissingGroup { topic_key: String },

    /// `authType` is not one of `plain`, `scram-sha-256`, `scram-sha-512`.
    #[error("kafka topic {topic_key}: unknown auth type {value:?}")]
    UnknownAuthType { topic_key: String, value: String },

    /// The `brokers` list is empty.
    #[error("kafka topic {topic_key}: no brokers configured")]
    NoBrokers { topic_key: String },

    /// A required descriptor field (`topic` or `username`) is missing or empty.
    #[error("kafka topic {topic_key}: {field} is missing or empty")]
    MissingField {
        topic_key: String,
        field: &'static str,
    },

    /// The application asked for a topic key that is not configured.
    #[error("kafka topic {0} is not configured")]
    UnknownTopic(String),
}

fn describe_var(var_name: &str) -> String {
    if var_name.is_empty() {
        "value".to_string()
    } else {
        format!("environment variable {}", var_name)
    }
}

/// Credential exchange errors. Never downgraded to a weaker mechanism.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("unsupported SASL mechanism {0}")]
    UnsupportedMechanism(String),

    #[error("invalid server message: {0}")]
    InvalidServerMessage(String),

    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,

    #[error("server signature verification failed")]
    ServerSignatureMismatch,

    #[error("credentials rejected: {0}")]
    Rejected(String),

    #[error("authentication did not complete before the server finished the exchange")]
    Incomplete,

    #[error("mechanism used out of order: {0}")]
    InvalidState(&'static str),
}

/// A record payload that could not be decoded.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure reported by a non-JSON codec.
    #[error("invalid payload: {0}")]
    Other(String),
}

/// A convenient Result type alias for typed-kafka operations.
///
/// This is equivalent to `std::result::Result<T, typed_kafka::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_secret_messages() {
        let err = ConfigError::MissingSecret {
            topic_key: "t1".to_string(),
            var_name: "ORDERS_PW".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "kafka topic t1: password environment variable ORDERS_PW is empty"
        );

        let err = ConfigError::MissingSecret {
            topic_key: "t1".to_string(),
            var_name: String::new(),
        };
        assert_eq!(err.to_string(), "kafka topic t1: password value is empty");
    }

    #[test]
    fn test_config_error_converts() {
        let err: Error = ConfigError::UnknownTopic("audit".to_string()).into();
        assert!(matches!(err, Error::Config(ConfigError::UnknownTopic(_))));
        assert_eq!(
            err.to_string(),
            "Configuration error: kafka topic audit is not configured"
        );
    }
}
