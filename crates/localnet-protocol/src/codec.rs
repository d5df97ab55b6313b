//! JSON envelope codec with a runtime registry of application types.
//!
//! Every envelope is a JSON object whose `type` field selects the variant.
//! Built-in variants are always known; application variants become
//! decodable once registered. Unknown fields are ignored on decode.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use localnet_types::{Envelope, EnvelopeType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ProtocolError;

/// Name of the discriminator field.
pub const TYPE_FIELD: &str = "type";

const BUILTIN_TAGS: [&str; 4] = [
    "UserConnected",
    "UserDisconnected",
    "ServerDownDetected",
    "ServerStarted",
];

type DecodeFn = fn(Value) -> Result<Envelope, serde_json::Error>;

/// Wire form of the built-in variants.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum BuiltinWire {
    UserConnected {
        id: String,
        #[serde(rename = "isHost")]
        is_host: bool,
    },
    UserDisconnected {
        id: String,
    },
    ServerDownDetected,
    ServerStarted,
}

/// Pairs a wire tag with the decoder for one application envelope type.
#[derive(Clone, Copy)]
pub struct EnvelopeRegistration {
    tag: &'static str,
    decode: DecodeFn,
}

impl EnvelopeRegistration {
    /// Registration for the application type `T`.
    pub fn of<T: EnvelopeType>() -> Self {
        Self {
            tag: T::TAG,
            decode: decode_custom::<T>,
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }
}

impl std::fmt::Debug for EnvelopeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeRegistration")
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

fn decode_custom<T: EnvelopeType>(payload: Value) -> Result<Envelope, serde_json::Error> {
    match serde_json::from_value::<T>(payload.clone()) {
        Ok(value) => Ok(Envelope::custom(value)),
        // Unit structs serialise to `null`, so an empty object stands for one.
        Err(e) => match payload {
            Value::Object(map) if map.is_empty() => {
                serde_json::from_value::<T>(Value::Null).map(Envelope::custom).map_err(|_| e)
            }
            _ => Err(e),
        },
    }
}

/// Encoder/decoder for [`Envelope`] with an additive type registry.
///
/// Registration takes `&self`, so one codec can be shared behind an `Arc`
/// and extended at any point, including before its first use.
#[derive(Default)]
pub struct EnvelopeCodec {
    decoders: RwLock<HashMap<&'static str, DecodeFn>>,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register application envelope types.
    ///
    /// Re-registering a tag replaces its decoder. Tags that collide with a
    /// built-in variant are rejected and nothing from the batch is applied.
    pub fn register(
        &self,
        registrations: impl IntoIterator<Item = EnvelopeRegistration>,
    ) -> Result<(), ProtocolError> {
        let registrations: Vec<_> = registrations.into_iter().collect();
        if let Some(clash) = registrations.iter().find(|r| BUILTIN_TAGS.contains(&r.tag)) {
            return Err(ProtocolError::Registration(format!(
                "tag {} is reserved for a built-in envelope",
                clash.tag
            )));
        }

        let mut decoders = self.decoders.write().unwrap_or_else(PoisonError::into_inner);
        for registration in registrations {
            debug!(tag = registration.tag, "registered envelope type");
            decoders.insert(registration.tag, registration.decode);
        }
        Ok(())
    }

    /// Whether `tag` can be decoded.
    pub fn is_registered(&self, tag: &str) -> bool {
        BUILTIN_TAGS.contains(&tag)
            || self
                .decoders
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(tag)
    }

    /// Encode an envelope to its JSON text form.
    pub fn encode(&self, envelope: &Envelope) -> Result<String, ProtocolError> {
        let wire = match envelope {
            Envelope::UserConnected { id, is_host } => BuiltinWire::UserConnected {
                id: id.clone(),
                is_host: *is_host,
            },
            Envelope::UserDisconnected { id } => BuiltinWire::UserDisconnected { id: id.clone() },
            Envelope::ServerDownDetected => BuiltinWire::ServerDownDetected,
            Envelope::ServerStarted => BuiltinWire::ServerStarted,
            Envelope::Custom(custom) => {
                let payload = custom
                    .to_json()
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                let mut object = match payload {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    other => {
                        return Err(ProtocolError::Serialization(format!(
                            "envelope {} must serialise to a JSON object, got {other}",
                            custom.tag()
                        )))
                    }
                };
                if object.contains_key(TYPE_FIELD) {
                    return Err(ProtocolError::Serialization(format!(
                        "envelope {} already has a `{TYPE_FIELD}` field",
                        custom.tag()
                    )));
                }
                object.insert(TYPE_FIELD.to_string(), Value::String(custom.tag().to_string()));
                return Ok(Value::Object(object).to_string());
            }
        };
        serde_json::to_string(&wire).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode an envelope from its JSON text form.
    pub fn decode(&self, text: &str) -> Result<Envelope, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::Deserialization(
                "envelope is not a JSON object".to_string(),
            ));
        };
        let tag = match object.get(TYPE_FIELD) {
            Some(Value::String(tag)) => tag.clone(),
            _ => {
                return Err(ProtocolError::Deserialization(format!(
                    "envelope has no string `{TYPE_FIELD}` field"
                )))
            }
        };

        if BUILTIN_TAGS.contains(&tag.as_str()) {
            let wire: BuiltinWire = serde_json::from_value(Value::Object(object))
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
            return Ok(match wire {
                BuiltinWire::UserConnected { id, is_host } => Envelope::UserConnected { id, is_host },
                BuiltinWire::UserDisconnected { id } => Envelope::UserDisconnected { id },
                BuiltinWire::ServerDownDetected => Envelope::ServerDownDetected,
                BuiltinWire::ServerStarted => Envelope::ServerStarted,
            });
        }

        let decode = self
            .decoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag.as_str())
            .copied()
            .ok_or_else(|| ProtocolError::UnknownEnvelope(tag.clone()))?;

        object.remove(TYPE_FIELD);
        decode(Value::Object(object)).map_err(|e| ProtocolError::Deserialization(format!("{tag}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct AddCard {
        id: String,
        card_text: String,
    }

    impl EnvelopeType for AddCard {
        const TAG: &'static str = "AddCard";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ContinueGame;

    impl EnvelopeType for ContinueGame {
        const TAG: &'static str = "ContinueGame";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Bogus;

    impl EnvelopeType for Bogus {
        const TAG: &'static str = "ServerStarted";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Score(u32);

    impl EnvelopeType for Score {
        const TAG: &'static str = "Score";
    }

    fn codec() -> EnvelopeCodec {
        let codec = EnvelopeCodec::new();
        codec
            .register([
                EnvelopeRegistration::of::<AddCard>(),
                EnvelopeRegistration::of::<ContinueGame>(),
            ])
            .unwrap();
        codec
    }

    #[test]
    fn builtin_wire_shape() {
        let text = EnvelopeCodec::new()
            .encode(&Envelope::UserConnected {
                id: "42".into(),
                is_host: true,
            })
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "UserConnected");
        assert_eq!(value["id"], "42");
        assert_eq!(value["isHost"], true);
    }

    #[test]
    fn builtins_roundtrip() {
        let codec = EnvelopeCodec::new();
        for env in [
            Envelope::UserConnected {
                id: "7".into(),
                is_host: false,
            },
            Envelope::UserDisconnected { id: "7".into() },
            Envelope::ServerDownDetected,
            Envelope::ServerStarted,
        ] {
            let text = codec.encode(&env).unwrap();
            assert_eq!(codec.decode(&text).unwrap(), env);
        }
    }

    #[test]
    fn custom_roundtrip() {
        let codec = codec();
        let env = Envelope::custom(AddCard {
            id: "3".into(),
            card_text: "a cat".into(),
        });
        let text = codec.encode(&env).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "AddCard");
        assert_eq!(value["cardText"], "a cat");
        assert_eq!(codec.decode(&text).unwrap(), env);
    }

    #[test]
    fn unit_struct_roundtrip() {
        let codec = codec();
        let env = Envelope::custom(ContinueGame);
        let text = codec.encode(&env).unwrap();
        assert_eq!(text, r#"{"type":"ContinueGame"}"#);
        assert_eq!(codec.decode(&text).unwrap(), env);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let codec = codec();
        let env = codec
            .decode(r#"{"type":"UserDisconnected","id":"5","reason":"bye"}"#)
            .unwrap();
        assert_eq!(env, Envelope::UserDisconnected { id: "5".into() });

        let env = codec
            .decode(r#"{"type":"AddCard","id":"1","cardText":"x","extra":[1,2]}"#)
            .unwrap();
        assert_eq!(env.downcast_ref::<AddCard>().unwrap().card_text, "x");
    }

    #[test]
    fn unregistered_tag_is_rejected() {
        let err = EnvelopeCodec::new()
            .decode(r#"{"type":"AddCard","id":"1","cardText":"x"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEnvelope(tag) if tag == "AddCard"));
    }

    #[test]
    fn registration_is_additive() {
        let codec = EnvelopeCodec::new();
        assert!(!codec.is_registered("AddCard"));
        codec.register([EnvelopeRegistration::of::<AddCard>()]).unwrap();
        codec.register([EnvelopeRegistration::of::<ContinueGame>()]).unwrap();
        assert!(codec.is_registered("AddCard"));
        assert!(codec.is_registered("ContinueGame"));
        assert!(codec.is_registered("ServerStarted"));
    }

    #[test]
    fn builtin_tag_cannot_be_registered() {
        let codec = EnvelopeCodec::new();
        let err = codec
            .register([
                EnvelopeRegistration::of::<AddCard>(),
                EnvelopeRegistration::of::<Bogus>(),
            ])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Registration(_)));
        assert!(!codec.is_registered("AddCard"));
    }

    #[test]
    fn non_object_payload_fails_to_encode() {
        let codec = EnvelopeCodec::new();
        codec.register([EnvelopeRegistration::of::<Score>()]).unwrap();
        let err = codec.encode(&Envelope::custom(Score(3))).unwrap_err();
        assert!(matches!(err, ProtocolError::Serialization(_)));
    }

    #[test]
    fn malformed_text_is_an_error() {
        let codec = codec();
        assert!(codec.decode("not json").is_err());
        assert!(codec.decode("[1,2,3]").is_err());
        assert!(codec.decode(r#"{"id":"1"}"#).is_err());
        assert!(codec.decode(r#"{"type":"UserConnected"}"#).is_err());
    }
}
