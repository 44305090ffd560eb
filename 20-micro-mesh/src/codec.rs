//! Value codec: turns typed payloads into single-line JSON and back.
//!
//! The type identifier sent alongside each payload selects the decoder. The
//! server side resolves identifiers through an explicit [`Registry`] filled
//! in by the application; nothing is looked up by reflection.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// A decoded value whose concrete type is only known to the handler.
pub type AnyValue = Box<dyn Any + Send>;

/// A value that can travel over the wire.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    /// Identifier written next to every encoded value of this type.
    const TYPE_ID: &'static str;
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no decoder registered for type `{0}`")]
    UnknownType(String),
    #[error("value type is not registered")]
    Unregistered,
    #[error("malformed `{type_id}` payload: {source}")]
    Malformed {
        type_id: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn encode<T: Payload>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|source| CodecError::Malformed {
        type_id: T::TYPE_ID.to_string(),
        source,
    })
}

pub fn decode<T: Payload>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|source| CodecError::Malformed {
        type_id: T::TYPE_ID.to_string(),
        source,
    })
}

type DecodeFn = fn(&str) -> Result<AnyValue, CodecError>;
type EncodeFn = fn(&(dyn Any + Send)) -> Result<String, CodecError>;

struct Encoder {
    type_id: &'static str,
    encode: EncodeFn,
}

/// Maps wire type identifiers to decoders and Rust types to encoders.
#[derive(Default)]
pub struct Registry {
    decoders: HashMap<&'static str, DecodeFn>,
    encoders: HashMap<TypeId, Encoder>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Payload>(&mut self) -> &mut Self {
        self.decoders.insert(T::TYPE_ID, decode_any::<T>);
        self.encoders.insert(
            TypeId::of::<T>(),
            Encoder {
                type_id: T::TYPE_ID,
                encode: encode_any::<T>,
            },
        );
        self
    }

    pub fn with<T: Payload>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.decoders.contains_key(type_id)
    }

    pub fn decode(&self, type_id: &str, text: &str) -> Result<AnyValue, CodecError> {
        let decode = self
            .decoders
            .get(type_id)
            .ok_or_else(|| CodecError::UnknownType(type_id.to_string()))?;
        decode(text)
    }

    /// Encodes a handler reply, returning the identifier to send with it.
    pub fn encode(&self, value: &(dyn Any + Send)) -> Result<(&'static str, String), CodecError> {
        let encoder = self
            .encoders
            .get(&(*value).type_id())
            .ok_or(CodecError::Unregistered)?;
        let text = (encoder.encode)(value)?;
        Ok((encoder.type_id, text))
    }
}

fn decode_any<T: Payload>(text: &str) -> Result<AnyValue, CodecError> {
    Ok(Box::new(decode::<T>(text)?))
}

fn encode_any<T: Payload>(value: &(dyn Any + Send)) -> Result<String, CodecError> {
    let value = value.downcast_ref::<T>().ok_or(CodecError::Unregistered)?;
    encode(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        id: u32,
        name: String,
    }

    impl Payload for Ping {
        const TYPE_ID: &'static str = "ping";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Stranger;

    impl Payload for Stranger {
        const TYPE_ID: &'static str = "stranger";
    }

    #[test]
    fn registered_type_decodes_to_concrete_value() {
        let registry = Registry::new().with::<Ping>();
        let value = registry
            .decode("ping", r#"{"id":7,"name":"x"}"#)
            .expect("decode ping");
        let ping = value.downcast::<Ping>().expect("concrete type");
        assert_eq!(
            *ping,
            Ping {
                id: 7,
                name: "x".into()
            }
        );
    }

    #[test]
    fn unknown_type_id_is_rejected() {
        let registry = Registry::new().with::<Ping>();
        let err = registry.decode("nope", "{}").expect_err("unknown type");
        assert!(matches!(err, CodecError::UnknownType(id) if id == "nope"));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let registry = Registry::new().with::<Ping>();
        let err = registry.decode("ping", "{not json").expect_err("bad json");
        assert!(matches!(err, CodecError::Malformed { type_id, .. } if type_id == "ping"));
    }

    #[test]
    fn encode_uses_the_registered_identifier() {
        let registry = Registry::new().with::<Ping>();
        let reply: AnyValue = Box::new(Ping {
            id: 1,
            name: "Joe".into(),
        });
        let (type_id, text) = registry.encode(reply.as_ref()).expect("encode");
        assert_eq!(type_id, "ping");
        assert_eq!(text, r#"{"id":1,"name":"Joe"}"#);
    }

    #[test]
    fn unregistered_reply_cannot_be_encoded() {
        let registry = Registry::new().with::<Ping>();
        let reply: AnyValue = Box::new(Stranger);
        assert!(matches!(
            registry.encode(reply.as_ref()),
            Err(CodecError::Unregistered)
        ));
    }
}
