use crate::auth::scram::{ScramHash, ScramMechanism};
use crate::config::AuthType;
use crate::error::AuthError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Client side of a SASL credential exchange.
///
/// Driven as `begin`, then `step` once per server challenge (the first step
/// receives an empty challenge), until `done` reports completion.
pub trait SaslMechanism: Send {
    /// Mechanism name as announced to the broker.
    fn name(&self) -> &'static str;

    fn begin(&mut self, username: &str, password: &str, authz_id: &str) -> Result<(), AuthError>;

    fn step(&mut self, challenge: &str) -> Result<String, AuthError>;

    fn done(&self) -> bool;
}

/// Server side of a SASL exchange, as far as a client needs to talk to it.
pub trait SaslServer: Send {
    fn respond(&mut self, client_message: &str) -> Result<ServerStep, AuthError>;
}

/// What the server answered to one client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStep {
    /// Another round is needed; the payload is the next challenge.
    Challenge(String),
    /// The server accepted the client. The payload carries optional
    /// additional data the client must still verify (SCRAM server-final).
    Success(String),
}

/// Runs a complete exchange between `mechanism` and `server`.
///
/// The exchange fails if the server completes while the client has not
/// reached its own terminal state.
pub fn negotiate(
    mechanism: &mut dyn SaslMechanism,
    server: &mut dyn SaslServer,
    username: &str,
    password: &str,
) -> Result<(), AuthError> {
    mechanism.begin(username, password, "")?;

    let mut challenge = String::new();
    loop {
        let response = mechanism.step(&challenge)?;
        match server.respond(&response)? {
            ServerStep::Challenge(next) => challenge = next,
            ServerStep::Success(additional) => {
                if !mechanism.done() && !additional.is_empty() {
                    mechanism.step(&additional)?;
                }
                if !mechanism.done() {
                    return Err(AuthError::Incomplete);
                }
                return Ok(());
            }
        }
    }
}

/// Single-message credential exchange (RFC 4616).
#[derive(Debug, Default)]
pub struct PlainMechanism {
    message: Option<String>,
    sent: bool,
}

impl PlainMechanism {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SaslMechanism for PlainMechanism {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn begin(&mut self, username: &str, password: &str, authz_id: &str) -> Result<(), AuthError> {
        self.message = Some(format!("{}\0{}\0{}", authz_id, username, password));
        self.sent = false;
        Ok(())
    }

    fn step(&mut self, _challenge: &str) -> Result<String, AuthError> {
        if self.sent {
            return Err(AuthError::InvalidState("PLAIN sends exactly one message"));
        }
        let message = self
            .message
            .take()
            .ok_or(AuthError::InvalidState("step called before begin"))?;
        self.sent = true;
        Ok(message)
    }

    fn done(&self) -> bool {
        self.sent
    }
}

/// Builds a fresh mechanism for every connection attempt.
pub type MechanismFactory = Arc<dyn Fn() -> Box<dyn SaslMechanism> + Send + Sync>;

/// The `{mechanism -> factory}` map handed to the negotiator.
#[derive(Clone)]
pub struct MechanismRegistry {
    factories: HashMap<AuthType, MechanismFactory>,
}

impl MechanismRegistry {
    /// A registry without any mechanism.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(mut self, auth_type: AuthType, factory: F) -> Self
    where
        F: Fn() -> Box<dyn SaslMechanism> + Send + Sync + 'static,
    {
        self.factories.insert(auth_type, Arc::new(factory));
        self
    }

    pub fn get(&self, auth_type: AuthType) -> Option<MechanismFactory> {
        self.factories.get(&auth_type).cloned()
    }

    pub fn supports(&self, auth_type: AuthType) -> bool {
        self.factories.contains_key(&auth_type)
    }
}

impl Default for MechanismRegistry {
    /// PLAIN, SCRAM-SHA-256 and SCRAM-SHA-512.
    fn default() -> Self {
        Self::empty()
            .register(AuthType::Plain, || Box::new(PlainMechanism::new()))
            .register(AuthType::ScramSha256, || {
                Box::new(ScramMechanism::new(ScramHash::Sha256))
            })
            .register(AuthType::ScramSha512, || {
                Box::new(ScramMechanism::new(ScramHash::Sha512))
            })
    }
}

impl fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut mechanisms: Vec<&str> = self.factories.keys().map(|a| a.as_str()).collect();
        mechanisms.sort_unstable();
        f.debug_struct("MechanismRegistry")
            .field("mechanisms", &mechanisms)
            .finish()
    }
}

/// Verifies PLAIN credentials against a single known user.
pub struct PlainServer {
    username: String,
    password: String,
}

impl PlainServer {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl SaslServer for PlainServer {
    fn respond(&mut self, client_message: &str) -> Result<ServerStep, AuthError> {
        let mut parts = client_message.splitn(3, '\0');
        let (_authz, username, password) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(u), Some(p)) => (a, u, p),
            _ => {
                return Err(AuthError::InvalidServerMessage(
                    "malformed PLAIN message".to_string(),
                ))
            }
        };
        if username != self.username || password != self.password {
            return Err(AuthError::Rejected(format!("invalid credentials for {}", username)));
        }
        Ok(ServerStep::Success(String::new()))
    }
}
