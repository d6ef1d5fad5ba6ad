//! SCRAM (RFC 5802) credential exchange for SHA-256 and SHA-512.
//!
//! [`ScramMechanism`] is the client state machine handed out by the
//! negotiator's mechanism registry. [`ScramServer`] is the matching verifier,
//! used by the in-process broker to authenticate connecting clients.
//!
//! The exchange:
//!
//! 1. Client → Server: client-first-message (`n,,n=user,r=<client nonce>`)
//! 2. Server → Client: server-first-message (`r=<nonce>,s=<salt>,i=<iterations>`)
//! 3. Client → Server: client-final-message (`c=biws,r=<nonce>,p=<proof>`)
//! 4. Server → Client: server-final-message (`v=<server signature>`)

use crate::auth::mechanism::{SaslMechanism, SaslServer, ServerStep};
use crate::error::AuthError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};

const NONCE_LENGTH: usize = 24;

/// Hash function behind a SCRAM mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScramHash {
    Sha256,
    Sha512,
}

impl ScramHash {
    pub fn mechanism_name(self) -> &'static str {
        match self {
            ScramHash::Sha256 => "SCRAM-SHA-256",
            ScramHash::Sha512 => "SCRAM-SHA-512",
        }
    }

    fn output_len(self) -> usize {
        match self {
            ScramHash::Sha256 => 32,
            ScramHash::Sha512 => 64,
        }
    }

    // Hi(password, salt, i)
    fn salted_password(self, password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0u8; self.output_len()];
        match self {
            ScramHash::Sha256 => {
                pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out)
            }
            ScramHash::Sha512 => {
                pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut out)
            }
        }
        out
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError> {
        let invalid_key = |_| AuthError::InvalidState("hmac key rejected");
        Ok(match self {
            ScramHash::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(invalid_key)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            ScramHash::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(invalid_key)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha256 => Sha256::digest(data).to_vec(),
            ScramHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// (ClientKey, StoredKey, ServerKey) for a salted password.
    fn derive_keys(
        self,
        salted_password: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), AuthError> {
        let client_key = self.hmac(salted_password, b"Client Key")?;
        let stored_key = self.digest(&client_key);
        let server_key = self.hmac(salted_password, b"Server Key")?;
        Ok((client_key, stored_key, server_key))
    }
}

fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LENGTH)
        .map(char::from)
        .collect()
}

// saslname: "=" and "," must be escaped.
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn unescape_name(name: &str) -> String {
    name.replace("=2C", ",").replace("=3D", "=")
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

fn invalid(message: impl Into<String>) -> AuthError {
    AuthError::InvalidServerMessage(message.into())
}

/// Splits `k=v,k=v` into attribute pairs.
fn attributes(message: &str) -> Result<Vec<(&str, &str)>, AuthError> {
    message
        .split(',')
        .filter(|attr| !attr.is_empty())
        .map(|attr| {
            attr.split_once('=')
                .ok_or_else(|| invalid(format!("invalid attribute: {}", attr)))
        })
        .collect()
}

fn attribute<'a>(attrs: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

enum ClientState {
    Initial,
    Started {
        username: String,
        password: String,
        authz_id: String,
    },
    FirstSent {
        password: String,
        gs2_header: String,
        client_first_bare: String,
        client_nonce: String,
    },
    FinalSent {
        server_signature: Vec<u8>,
    },
    Done,
}

/// SCRAM client state machine.
pub struct ScramMechanism {
    hash: ScramHash,
    client_nonce: Option<String>,
    state: ClientState,
}

impl ScramMechanism {
    pub fn new(hash: ScramHash) -> Self {
        Self {
            hash,
            client_nonce: None,
            state: ClientState::Initial,
        }
    }

    /// Uses a fixed client nonce instead of a random one.
    pub fn with_client_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.client_nonce = Some(nonce.into());
        self
    }

    fn client_first(
        &mut self,
        username: String,
        password: String,
        authz_id: String,
    ) -> String {
        let gs2_header = if authz_id.is_empty() {
            "n,,".to_string()
        } else {
            format!("n,a={},", escape_name(&authz_id))
        };
        let client_nonce = self.client_nonce.clone().unwrap_or_else(generate_nonce);
        let client_first_bare = format!("n={},r={}", escape_name(&username), client_nonce);
        let message = format!("{}{}", gs2_header, client_first_bare);

        self.state = ClientState::FirstSent {
            password,
            gs2_header,
            client_first_bare,
            client_nonce,
        };
        message
    }

    fn client_final(
        &self,
        server_first: &str,
        password: &str,
        gs2_header: &str,
        client_first_bare: &str,
        client_nonce: &str,
    ) -> Result<(String, Vec<u8>), AuthError> {
        let attrs = attributes(server_first)?;
        if let Some(error) = attribute(&attrs, "e") {
            return Err(AuthError::Rejected(error.to_string()));
        }
        if attribute(&attrs, "m").is_some() {
            return Err(invalid("mandatory extensions are not supported"));
        }

        let nonce = attribute(&attrs, "r").ok_or_else(|| invalid("missing nonce (r=)"))?;
        if !nonce.starts_with(client_nonce) || nonce.len() <= client_nonce.len() {
            return Err(AuthError::NonceMismatch);
        }
        let salt = attribute(&attrs, "s")
            .ok_or_else(|| invalid("missing salt (s=)"))
            .and_then(|s| STANDARD.decode(s).map_err(|e| invalid(format!("salt: {}", e))))?;
        let iterations: u32 = attribute(&attrs, "i")
            .ok_or_else(|| invalid("missing iteration count (i=)"))?
            .parse()
            .map_err(|_| invalid("iteration count is not a number"))?;
        if iterations == 0 {
            return Err(invalid("iteration count must be positive"));
        }

        let salted_password = self.hash.salted_password(password, &salt, iterations);
        let (client_key, stored_key, server_key) = self.hash.derive_keys(&salted_password)?;

        let without_proof = format!("c={},r={}", STANDARD.encode(gs2_header), nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_signature = self.hash.hmac(&stored_key, auth_message.as_bytes())?;
        let proof = xor(&client_key, &client_signature);
        let server_signature = self.hash.hmac(&server_key, auth_message.as_bytes())?;

        Ok((
            format!("{},p={}", without_proof, STANDARD.encode(proof)),
            server_signature,
        ))
    }
}

impl SaslMechanism for ScramMechanism {
    fn name(&self) -> &'static str {
        self.hash.mechanism_name()
    }

    fn begin(&mut self, username: &str, password: &str, authz_id: &str) -> Result<(), AuthError> {
        self.state = ClientState::Started {
            username: username.to_string(),
            password: password.to_string(),
            authz_id: authz_id.to_string(),
        };
        Ok(())
    }

    fn step(&mut self, challenge: &str) -> Result<String, AuthError> {
        match std::mem::replace(&mut self.state, ClientState::Initial) {
            ClientState::Initial => Err(AuthError::InvalidState("step called before begin")),
            ClientState::Started {
                username,
                password,
                authz_id,
            } => Ok(self.client_first(username, password, authz_id)),
            ClientState::FirstSent {
                password,
                gs2_header,
                client_first_bare,
                client_nonce,
            } => {
                let (message, server_signature) = self.client_final(
                    challenge,
                    &password,
                    &gs2_header,
                    &client_first_bare,
                    &client_nonce,
                )?;
                self.state = ClientState::FinalSent { server_signature };
                Ok(message)
            }
            ClientState::FinalSent { server_signature } => {
                let attrs = attributes(challenge)?;
                if let Some(error) = attribute(&attrs, "e") {
                    return Err(AuthError::Rejected(error.to_string()));
                }
                let verifier = attribute(&attrs, "v")
                    .ok_or_else(|| invalid("missing server signature (v=)"))
                    .and_then(|v| {
                        STANDARD
                            .decode(v)
                            .map_err(|e| invalid(format!("server signature: {}", e)))
                    })?;
                if verifier != server_signature {
                    return Err(AuthError::ServerSignatureMismatch);
                }
                self.state = ClientState::Done;
                Ok(String::new())
            }
            ClientState::Done => {
                self.state = ClientState::Done;
                Err(AuthError::InvalidState("exchange already complete"))
            }
        }
    }

    fn done(&self) -> bool {
        matches!(self.state, ClientState::Done)
    }
}

enum ServerState {
    AwaitClientFirst,
    AwaitClientFinal {
        gs2_header: String,
        nonce: String,
        auth_prefix: String,
    },
    Done,
}

/// SCRAM verifier for a single user.
pub struct ScramServer {
    hash: ScramHash,
    username: String,
    salt: Vec<u8>,
    iterations: u32,
    stored_key: Vec<u8>,
    server_key: Vec<u8>,
    server_nonce: Option<String>,
    state: ServerState,
}

impl ScramServer {
    pub fn new(
        hash: ScramHash,
        username: &str,
        password: &str,
        salt: &[u8],
        iterations: u32,
    ) -> Result<Self, AuthError> {
        let salted_password = hash.salted_password(password, salt, iterations);
        let (_, stored_key, server_key) = hash.derive_keys(&salted_password)?;
        Ok(Self {
            hash,
            username: username.to_string(),
            salt: salt.to_vec(),
            iterations,
            stored_key,
            server_key,
            server_nonce: None,
            state: ServerState::AwaitClientFirst,
        })
    }

    /// Uses a fixed server nonce suffix instead of a random one.
    pub fn with_server_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.server_nonce = Some(nonce.into());
        self
    }

    fn server_first(&mut self, client_first: &str) -> Result<String, AuthError> {
        let mut parts = client_first.splitn(3, ',');
        let (cbind_flag, authz, bare) = match (parts.next(), parts.next(), parts.next()) {
            (Some(c), Some(a), Some(b)) => (c, a, b),
            _ => return Err(invalid("client-first message must have a GS2 header")),
        };
        if cbind_flag.starts_with('p') {
            return Err(invalid("channel binding is not supported"));
        }
        let gs2_header = format!("{},{},", cbind_flag, authz);

        let attrs = attributes(bare)?;
        let username = attribute(&attrs, "n")
            .map(unescape_name)
            .ok_or_else(|| invalid("missing username (n=)"))?;
        let client_nonce = attribute(&attrs, "r").ok_or_else(|| invalid("missing nonce (r=)"))?;
        if username != self.username {
            return Err(AuthError::Rejected(format!("unknown user {}", username)));
        }

        let server_nonce = self.server_nonce.clone().unwrap_or_else(generate_nonce);
        let nonce = format!("{}{}", client_nonce, server_nonce);
        let server_first = format!(
            "r={},s={},i={}",
            nonce,
            STANDARD.encode(&self.salt),
            self.iterations
        );

        self.state = ServerState::AwaitClientFinal {
            gs2_header,
            nonce,
            auth_prefix: format!("{},{}", bare, server_first),
        };
        Ok(server_first)
    }

    fn server_final(
        &self,
        client_final: &str,
        gs2_header: &str,
        nonce: &str,
        auth_prefix: &str,
    ) -> Result<String, AuthError> {
        let (without_proof, proof) = client_final
            .rsplit_once(",p=")
            .ok_or_else(|| invalid("missing proof (p=)"))?;
        let attrs = attributes(without_proof)?;

        if attribute(&attrs, "c") != Some(STANDARD.encode(gs2_header).as_str()) {
            return Err(AuthError::Rejected("channel binding mismatch".to_string()));
        }
        if attribute(&attrs, "r") != Some(nonce) {
            return Err(AuthError::NonceMismatch);
        }
        let proof = STANDARD
            .decode(proof)
            .map_err(|e| invalid(format!("proof: {}", e)))?;

        let auth_message = format!("{},{}", auth_prefix, without_proof);
        let client_signature = self.hash.hmac(&self.stored_key, auth_message.as_bytes())?;
        let client_key = xor(&proof, &client_signature);
        if proof.len() != client_signature.len()
            || self.hash.digest(&client_key) != self.stored_key
        {
            return Err(AuthError::Rejected(format!(
                "invalid credentials for {}",
                self.username
            )));
        }

        let server_signature = self.hash.hmac(&self.server_key, auth_message.as_bytes())?;
        Ok(format!("v={}", STANDARD.encode(server_signature)))
    }
}

impl SaslServer for ScramServer {
    fn respond(&mut self, client_message: &str) -> Result<ServerStep, AuthError> {
        match std::mem::replace(&mut self.state, ServerState::Done) {
            ServerState::AwaitClientFirst => {
                Ok(ServerStep::Challenge(self.server_first(client_message)?))
            }
            ServerState::AwaitClientFinal {
                gs2_header,
                nonce,
                auth_prefix,
            } => Ok(ServerStep::Success(self.server_final(
                client_message,
                &gs2_header,
                &nonce,
                &auth_prefix,
            )?)),
            ServerState::Done => Err(AuthError::InvalidState("exchange already complete")),
        }
    }
}
