use crate::error::DecodeError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Converts between a typed payload and its wire bytes.
///
/// Injected into consumers and producers so the payload type stays checked
/// at compile time while the wire format remains pluggable.
pub trait MessageCodec<E>: Send + Sync + 'static {
    fn decode(&self, bytes: &[u8]) -> Result<E, DecodeError>;

    fn encode(&self, value: &E) -> Result<Vec<u8>, serde_json::Error>;
}

/// UTF-8 JSON payloads, the default wire format.
pub struct JsonCodec<E> {
    _payload: PhantomData<fn() -> E>,
}

impl<E> JsonCodec<E> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<E> Default for JsonCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for JsonCodec<E> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E> MessageCodec<E> for JsonCodec<E>
where
    E: Serialize + DeserializeOwned + 'static,
{
    fn decode(&self, bytes: &[u8]) -> Result<E, DecodeError> {
        serde_json::from_slice(bytes).map_err(DecodeError::from)
    }

    fn encode(&self, value: &E) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(value)
    }
}

/// Decodes a record key: raw bytes to string, empty if absent. Invalid UTF-8
/// is replaced rather than failing the record.
pub fn decode_key(key: Option<&[u8]>) -> String {
    key.map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default()
}
