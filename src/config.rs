//! Topic configuration resolution.
//!
//! The application describes every topic it talks to in one JSON document,
//! keyed by an application-level alias (not necessarily the broker-side topic
//! name):
//!
//! ```json
//! {
//!   "orders": {
//!     "topic": "orders.v1",
//!     "brokers": ["broker-1:9093"],
//!     "username": "svc-orders",
//!     "passwordEnvVar": "ORDERS_PW",
//!     "consumerGroup": "orders-service",
//!     "authType": "scram-sha-512"
//!   }
//! }
//! ```
//!
//! [`resolve`] turns that document into ready-to-use [`TopicConfig`]s,
//! resolving secrets through an injected lookup function.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Key under which the topics document is looked up.
pub const KEY_KAFKA_TOPICS_CONFIG: &str = "KAFKA_TOPICS_CONFIG";

const DEFAULT_TOPICS_CONFIG: &str = "{}";

/// Credential-exchange mechanism for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthType {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "scram-sha-256")]
    ScramSha256,
    #[serde(rename = "scram-sha-512")]
    ScramSha512,
}

impl AuthType {
    /// Value used in the configuration document.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Plain => "plain",
            AuthType::ScramSha256 => "scram-sha-256",
            AuthType::ScramSha512 => "scram-sha-512",
        }
    }

    /// SASL mechanism name as announced to the broker.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthType::Plain => "PLAIN",
            AuthType::ScramSha256 => "SCRAM-SHA-256",
            AuthType::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl FromStr for AuthType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Mechanism names as brokers spell them are accepted too.
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(AuthType::Plain),
            "scram-sha-256" => Ok(AuthType::ScramSha256),
            "scram-sha-512" => Ok(AuthType::ScramSha512),
            _ => Err(()),
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untrusted form of a topic entry, as found in the configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTopicDescriptor {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_group: Option<String>,
    #[serde(default)]
    pub auth_type: String,
}

/// Resolved, immutable connection descriptor for one topic.
///
/// Only [`resolve`] constructs these, so the password is never empty and the
/// broker list is never empty.
#[derive(Clone, PartialEq, Eq)]
pub struct TopicConfig {
    topic_key: String,
    physical_topic: String,
    brokers: Vec<String>,
    username: String,
    password: String,
    consumer_group_id: Option<String>,
    auth_type: AuthType,
}

impl TopicConfig {
    pub fn topic_key(&self) -> &str {
        &self.topic_key
    }

    /// Broker-side topic name.
    pub fn physical_topic(&self) -> &str {
        &self.physical_topic
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn consumer_group_id(&self) -> Option<&str> {
        self.consumer_group_id.as_deref()
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    /// The consumer group, failing with [`ConfigError::MissingGroup`] when it
    /// is absent or empty.
    pub fn require_group(&self) -> Result<&str, ConfigError> {
        match self.consumer_group_id.as_deref() {
            Some(group) if !group.is_empty() => Ok(group),
            _ => Err(ConfigError::MissingGroup {
                topic_key: self.topic_key.clone(),
            }),
        }
    }
}

impl fmt::Debug for TopicConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicConfig")
            .field("topic_key", &self.topic_key)
            .field("physical_topic", &self.physical_topic)
            .field("brokers", &self.brokers)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("consumer_group_id", &self.consumer_group_id)
            .field("auth_type", &self.auth_type)
            .finish()
    }
}

/// Parses the topics document and resolves every entry.
///
/// Resolution is all-or-nothing: the first invalid entry fails the whole
/// call. `secret_lookup` returns an empty string for "not found".
pub fn resolve<F>(
    raw_json: &str,
    secret_lookup: F,
) -> Result<HashMap<String, TopicConfig>, ConfigError>
where
    F: Fn(&str) -> String,
{
    let raw: HashMap<String, RawTopicDescriptor> =
        serde_json::from_str(raw_json).map_err(ConfigError::Malformed)?;

    raw.into_iter()
        .map(|(key, descriptor)| {
            let config = resolve_descriptor(&key, descriptor, &secret_lookup)?;
            Ok((key, config))
        })
        .collect()
}

/// Resolves a single descriptor registered under `topic_key`.
pub fn resolve_descriptor<F>(
    topic_key: &str,
    raw: RawTopicDescriptor,
    secret_lookup: F,
) -> Result<TopicConfig, ConfigError>
where
    F: Fn(&str) -> String,
{
    let password = match (raw.password_env_var.as_deref(), raw.password) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::AmbiguousSecret {
                topic_key: topic_key.to_string(),
            })
        }
        (Some(var_name), None) => {
            let secret = secret_lookup(var_name);
            if secret.is_empty() {
                return Err(ConfigError::MissingSecret {
                    topic_key: topic_key.to_string(),
                    var_name: var_name.to_string(),
                });
            }
            secret
        }
        (None, Some(literal)) => {
            if literal.is_empty() {
                return Err(ConfigError::MissingSecret {
                    topic_key: topic_key.to_string(),
                    var_name: String::new(),
                });
            }
            literal
        }
        // We do not support accessing topics without a password
        (None, None) => {
            return Err(ConfigError::MissingSecret {
                topic_key: topic_key.to_string(),
                var_name: String::new(),
            })
        }
    };

    let auth_type = raw
        .auth_type
        .parse::<AuthType>()
        .map_err(|_| ConfigError::UnknownAuthType {
            topic_key: topic_key.to_string(),
            value: raw.auth_type.clone(),
        })?;

    if raw.brokers.is_empty() {
        return Err(ConfigError::NoBrokers {
            topic_key: topic_key.to_string(),
        });
    }
    for (field, value) in [("topic", &raw.topic), ("username", &raw.username)] {
        if value.is_empty() {
            return Err(ConfigError::MissingField {
                topic_key: topic_key.to_string(),
                field,
            });
        }
    }

    Ok(TopicConfig {
        topic_key: topic_key.to_string(),
        physical_topic: raw.topic,
        brokers: raw.brokers,
        username: raw.username,
        password,
        consumer_group_id: raw.consumer_group,
        auth_type,
    })
}

/// Default secret lookup backed by process environment variables.
pub fn env_lookup(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

/// The application's resolved topic map, with the validate/obtain lifecycle
/// configuration systems expect.
#[derive(Debug, Clone, Default)]
pub struct KafkaTopicsConfig {
    topics: HashMap<String, Arc<TopicConfig>>,
}

impl KafkaTopicsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-flight check: resolves the document behind
    /// [`KEY_KAFKA_TOPICS_CONFIG`] without storing the result.
    pub fn validate<G>(getter: G) -> Result<(), ConfigError>
    where
        G: Fn(&str) -> String,
    {
        resolve(&topics_document(&getter), &getter).map(|_| ())
    }

    /// Resolves and stores the topic map. `getter` serves both the document
    /// key and the secret variables it names.
    pub fn obtain<G>(&mut self, getter: G) -> Result<(), ConfigError>
    where
        G: Fn(&str) -> String,
    {
        let resolved = resolve(&topics_document(&getter), &getter)?;
        self.topics = resolved
            .into_iter()
            .map(|(key, config)| (key, Arc::new(config)))
            .collect();
        Ok(())
    }

    /// Convenience constructor reading everything from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new();
        config.obtain(env_lookup)?;
        Ok(config)
    }

    /// Reads the topics document from a file instead of
    /// [`KEY_KAFKA_TOPICS_CONFIG`]. Secrets still come from `secret_lookup`.
    pub fn from_file<P, G>(path: P, secret_lookup: G) -> crate::Result<Self>
    where
        P: AsRef<Path>,
        G: Fn(&str) -> String,
    {
        let document = std::fs::read_to_string(path)?;
        let resolved = resolve(&document, secret_lookup)?;
        Ok(Self {
            topics: resolved
                .into_iter()
                .map(|(key, config)| (key, Arc::new(config)))
                .collect(),
        })
    }

    /// Shared handle to the topic registered under `topic_key`.
    pub fn topic(&self, topic_key: &str) -> Result<Arc<TopicConfig>, ConfigError> {
        self.topics
            .get(topic_key)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownTopic(topic_key.to_string()))
    }

    pub fn topics(&self) -> impl Iterator<Item = (&str, &TopicConfig)> {
        self.topics.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

fn topics_document<G: Fn(&str) -> String>(getter: &G) -> String {
    let document = getter(KEY_KAFKA_TOPICS_CONFIG);
    if document.trim().is_empty() {
        DEFAULT_TOPICS_CONFIG.to_string()
    } else {
        document
    }
}
