//! Broker-client option building: TLS transport, SASL mechanism selection
//! and connection timeouts.
//!
//! # Example
//!
//! ```rust
//! use typed_kafka::auth::{AuthNegotiator, TlsPolicy};
//! use typed_kafka::config::resolve;
//!
//! let doc = r#"{"orders": {"topic":"orders","brokers":["b:9093"],"username":"u",
//!               "password":"p","authType":"scram-sha-512"}}"#;
//! let topics = resolve(doc, |_| String::new()).unwrap();
//!
//! let negotiator = AuthNegotiator::default();
//! let options = negotiator.build_client_options(&topics["orders"]).unwrap();
//! assert_eq!(options.mechanism_name(), "SCRAM-SHA-512");
//! assert_eq!(options.tls(), TlsPolicy::Verify);
//! ```

pub mod mechanism;
pub mod scram;

pub use mechanism::{
    negotiate, MechanismFactory, MechanismRegistry, PlainMechanism, PlainServer, SaslMechanism,
    SaslServer, ServerStep,
};
pub use scram::{ScramHash, ScramMechanism, ScramServer};

use crate::config::{AuthType, TopicConfig};
use crate::error::AuthError;
use rdkafka::ClientConfig;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Time allowed to establish a broker connection, including TLS and SASL.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Consumer-group session timeout; a member silent for this long is evicted.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer-group heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Whether the broker's certificate chain is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    #[default]
    Verify,
    /// Skip verification. Only for internal networks where the broker
    /// certificate cannot be validated.
    SkipVerification,
}

/// Canned broker-client settings for specific deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPreset {
    /// Kafka-compatible Azure Event Hubs endpoint.
    AzureEventHubs,
}

impl ClientPreset {
    fn properties(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ClientPreset::AzureEventHubs => &[
                ("socket.keepalive.enable", "true"),
                ("metadata.max.age.ms", "180000"),
                ("compression.type", "none"),
                ("request.timeout.ms", "60000"),
                ("message.max.bytes", "1000000"),
            ],
        }
    }
}

/// Builds [`ClientOptions`] from resolved topic configuration.
///
/// The negotiator owns the mechanism registry; nothing global is mutated.
#[derive(Debug, Clone)]
pub struct AuthNegotiator {
    registry: MechanismRegistry,
    tls: TlsPolicy,
}

impl AuthNegotiator {
    pub fn new(registry: MechanismRegistry) -> Self {
        Self {
            registry,
            tls: TlsPolicy::Verify,
        }
    }

    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Selects the credential exchange for `cfg.auth_type()` and assembles
    /// the client options. Does not open a connection.
    pub fn build_client_options(&self, cfg: &TopicConfig) -> Result<ClientOptions, AuthError> {
        let auth_type = cfg.auth_type();
        let mechanism = self
            .registry
            .get(auth_type)
            .ok_or_else(|| {
                AuthError::UnsupportedMechanism(auth_type.mechanism_name().to_string())
            })?;

        if self.tls == TlsPolicy::SkipVerification {
            warn!(
                topic_key = %cfg.topic_key(),
                "TLS certificate verification is disabled"
            );
        }
        debug!(
            topic_key = %cfg.topic_key(),
            mechanism = auth_type.mechanism_name(),
            "Built broker client options"
        );

        Ok(ClientOptions {
            client_id: cfg.topic_key().to_string(),
            brokers: cfg.brokers().to_vec(),
            username: cfg.username().to_string(),
            password: cfg.password().to_string(),
            auth_type,
            mechanism,
            tls: self.tls,
            dial_timeout: DIAL_TIMEOUT,
            session_timeout: SESSION_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            overrides: BTreeMap::new(),
        })
    }
}

impl Default for AuthNegotiator {
    fn default() -> Self {
        Self::new(MechanismRegistry::default())
    }
}

/// Everything needed to open an authenticated broker connection.
#[derive(Clone)]
pub struct ClientOptions {
    client_id: String,
    brokers: Vec<String>,
    username: String,
    password: String,
    auth_type: AuthType,
    mechanism: MechanismFactory,
    tls: TlsPolicy,
    dial_timeout: Duration,
    session_timeout: Duration,
    heartbeat_interval: Duration,
    overrides: BTreeMap<String, String>,
}

impl ClientOptions {
    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    pub fn mechanism_name(&self) -> &'static str {
        self.auth_type.mechanism_name()
    }

    pub fn tls(&self) -> TlsPolicy {
        self.tls
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// A fresh client-side mechanism for one credential exchange.
    pub fn authenticator(&self) -> Box<dyn SaslMechanism> {
        (self.mechanism)()
    }

    /// Adds a raw broker-client property, applied after every computed one.
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_preset(mut self, preset: ClientPreset) -> Self {
        for (key, value) in preset.properties() {
            self.overrides.insert((*key).to_string(), (*value).to_string());
        }
        self
    }

    /// Properties shared by consumers and producers.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("client.id", &self.client_id)
            .set("security.protocol", "SASL_SSL")
            .set("sasl.mechanism", self.mechanism_name())
            .set("sasl.username", &self.username)
            .set("sasl.password", &self.password)
            .set(
                "enable.ssl.certificate.verification",
                (self.tls == TlsPolicy::Verify).to_string(),
            )
            .set(
                "socket.connection.setup.timeout.ms",
                self.dial_timeout.as_millis().to_string(),
            )
            .set("socket.keepalive.enable", "true");
        self.apply_overrides(&mut config);
        config
    }

    /// Consumer-group properties. Offsets are stored explicitly after
    /// successful processing and committed by the client in the background.
    /// Assignment is eager: a rebalance revokes every claim of the member.
    pub fn consumer_config(&self, group_id: &str, initial_offset: &str) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("group.id", group_id)
            .set("partition.assignment.strategy", "range,roundrobin")
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set(
                "heartbeat.interval.ms",
                self.heartbeat_interval.as_millis().to_string(),
            )
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", initial_offset);
        self.apply_overrides(&mut config);
        config
    }

    pub fn producer_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("acks", "all")
            .set("compression.type", "none");
        self.apply_overrides(&mut config);
        config
    }

    fn apply_overrides(&self, config: &mut ClientConfig) {
        for (key, value) in &self.overrides {
            config.set(key, value);
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("client_id", &self.client_id)
            .field("brokers", &self.brokers)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth_type", &self.auth_type)
            .field("tls", &self.tls)
            .field("dial_timeout", &self.dial_timeout)
            .field("session_timeout", &self.session_timeout)
            .field("overrides", &self.overrides)
            .finish()
    }
}
