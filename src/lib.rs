//! Typed Kafka consumers and producers over authenticated broker
//! connections.
//!
//! Topics are described once in a JSON document ([`config`]), resolved into
//! immutable [`TopicConfig`]s, and turned into SASL/TLS client options by the
//! [`AuthNegotiator`]. [`ConsumerGroupRunner`] consumes a topic as a member
//! of a consumer group with at-least-once delivery; [`Producer`] and
//! [`AsyncProducer`] publish typed values.

pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod producer;

pub use auth::{AuthNegotiator, ClientOptions, MechanismRegistry, TlsPolicy};
pub use broker::memory::MemoryBroker;
pub use broker::{Ack, InitialOffset, Record};
pub use codec::{JsonCodec, MessageCodec};
pub use config::{AuthType, KafkaTopicsConfig, TopicConfig};
pub use consumer::{
    ConsumerGroupRunner, DecodeFailurePolicy, RecordContext, RecordHandler, RunnerHandle,
    RunnerOptions, RunnerState,
};
pub use error::{AuthError, ConfigError, DecodeError, Error, Result};
pub use producer::{
    AsyncProducer, AsyncProducerOptions, LogErrorCallback, NoopCallback, PostSendCallback,
    Producer,
};
