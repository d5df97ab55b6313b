//! Application envelope types.
//!
//! Envelopes are exchanged as JSON text frames between the host's session
//! hub and its clients. The four built-in variants carry connection
//! lifecycle events; applications add their own variants at runtime by
//! implementing [`EnvelopeType`] and registering the type with the codec.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// An application-level message.
#[derive(Debug, Clone)]
pub enum Envelope {
    /// A peer joined the host's hub.
    UserConnected {
        id: String,
        /// Whether the joining peer is the host itself.
        is_host: bool,
    },

    /// A peer left or was dropped.
    UserDisconnected { id: String },

    /// The host became unreachable or closed abnormally.
    ServerDownDetected,

    /// The local hub started accepting peers.
    ServerStarted,

    /// An application-registered variant.
    Custom(Arc<dyn CustomEnvelope>),
}

impl Envelope {
    /// Wrap an application value as a custom envelope.
    pub fn custom<T: EnvelopeType>(value: T) -> Self {
        Self::Custom(Arc::new(value))
    }

    /// The stable type tag written to the wire.
    pub fn tag(&self) -> &str {
        match self {
            Self::UserConnected { .. } => "UserConnected",
            Self::UserDisconnected { .. } => "UserDisconnected",
            Self::ServerDownDetected => "ServerDownDetected",
            Self::ServerStarted => "ServerStarted",
            Self::Custom(custom) => custom.tag(),
        }
    }

    /// Borrow the payload of a custom envelope as its concrete type.
    pub fn downcast_ref<T: EnvelopeType>(&self) -> Option<&T> {
        match self {
            Self::Custom(custom) => custom.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Whether this is one of the built-in lifecycle variants.
    pub fn is_builtin(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::UserConnected { id: a, is_host: ha },
                Self::UserConnected { id: b, is_host: hb },
            ) => a == b && ha == hb,
            (Self::UserDisconnected { id: a }, Self::UserDisconnected { id: b }) => a == b,
            (Self::ServerDownDetected, Self::ServerDownDetected)
            | (Self::ServerStarted, Self::ServerStarted) => true,
            (Self::Custom(a), Self::Custom(b)) => a.dyn_eq(b.as_ref()),
            _ => false,
        }
    }
}

/// A concrete application message type that can travel inside an
/// [`Envelope`].
///
/// The payload must serialise to a JSON object; the codec adds the `type`
/// field carrying [`EnvelopeType::TAG`].
pub trait EnvelopeType:
    Serialize + DeserializeOwned + fmt::Debug + Clone + PartialEq + Send + Sync + 'static
{
    /// Stable wire tag. Must not collide with the built-in tags.
    const TAG: &'static str;
}

/// Object-safe view of a registered envelope payload.
///
/// Implemented for every [`EnvelopeType`]; applications never implement it
/// by hand.
pub trait CustomEnvelope: fmt::Debug + Send + Sync + 'static {
    fn tag(&self) -> &'static str;

    /// Serialise the payload (without the `type` field).
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;

    fn dyn_eq(&self, other: &dyn CustomEnvelope) -> bool;
}

impl<T: EnvelopeType> CustomEnvelope for T {
    fn tag(&self) -> &'static str {
        T::TAG
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn CustomEnvelope) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AddCard {
        id: String,
        card_text: String,
    }

    impl EnvelopeType for AddCard {
        const TAG: &'static str = "AddCard";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SetReady {
        id: String,
    }

    impl EnvelopeType for SetReady {
        const TAG: &'static str = "SetReady";
    }

    #[test]
    fn builtin_tags() {
        assert_eq!(Envelope::ServerStarted.tag(), "ServerStarted");
        assert_eq!(Envelope::ServerDownDetected.tag(), "ServerDownDetected");
        assert_eq!(
            Envelope::UserDisconnected { id: "4".into() }.tag(),
            "UserDisconnected"
        );
    }

    #[test]
    fn custom_envelope_downcast() {
        let env = Envelope::custom(AddCard {
            id: "4".into(),
            card_text: "hello".into(),
        });
        assert_eq!(env.tag(), "AddCard");
        assert!(!env.is_builtin());
        let card = env.downcast_ref::<AddCard>().unwrap();
        assert_eq!(card.card_text, "hello");
        assert!(env.downcast_ref::<SetReady>().is_none());
    }

    #[test]
    fn custom_equality_compares_payloads() {
        let a = Envelope::custom(SetReady { id: "1".into() });
        let b = Envelope::custom(SetReady { id: "1".into() });
        let c = Envelope::custom(SetReady { id: "2".into() });
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn custom_never_equals_other_type() {
        let a = Envelope::custom(SetReady { id: "1".into() });
        let b = Envelope::custom(AddCard {
            id: "1".into(),
            card_text: String::new(),
        });
        assert_ne!(a, b);
        assert_ne!(a, Envelope::ServerStarted);
    }

    #[test]
    fn builtin_equality() {
        assert_eq!(
            Envelope::UserConnected {
                id: "3".into(),
                is_host: true
            },
            Envelope::UserConnected {
                id: "3".into(),
                is_host: true
            }
        );
        assert_ne!(
            Envelope::UserConnected {
                id: "3".into(),
                is_host: true
            },
            Envelope::UserConnected {
                id: "3".into(),
                is_host: false
            }
        );
    }
}
