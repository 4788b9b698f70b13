//! Serializer contract and the JSON implementation.
//!
//! Payloads travel through the pipeline type-erased (`Arc<dyn Any>`). The
//! [`TypeMap`] binds each registered Rust type to a stable message type name,
//! so handlers can be routed by name and downcast to the concrete type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A deserialized event payload.
pub type Payload = Arc<dyn Any + Send + Sync>;

type EncodeFn = fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>, SerializationError>;
type DecodeFn = fn(&[u8]) -> Result<Payload, SerializationError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("type '{0}' is not registered")]
    UnregisteredType(String),

    #[error("message type '{name}' is already bound to a different type")]
    DuplicateRegistration { name: String },

    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),

    #[error("failed to encode '{message_type}': {reason}")]
    Encode { message_type: String, reason: String },

    #[error("failed to decode '{message_type}': {reason}")]
    Decode { message_type: String, reason: String },
}

/// Serialized form of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedEvent {
    pub event_type: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Serializer/deserializer contract supplied to stores and subscriptions.
pub trait EventSerializer: Send + Sync {
    /// Serialize a registered payload.
    fn serialize(&self, payload: &(dyn Any + Send + Sync)) -> Result<SerializedEvent, SerializationError>;

    /// Deserialize `data`. `Ok(None)` means the message type is not known to
    /// this serializer, which is not an error.
    fn deserialize(
        &self,
        content_type: &str,
        message_type: &str,
        data: &[u8],
    ) -> Result<Option<Payload>, SerializationError>;
}

impl<S> EventSerializer for Arc<S>
where
    S: EventSerializer + ?Sized,
{
    fn serialize(&self, payload: &(dyn Any + Send + Sync)) -> Result<SerializedEvent, SerializationError> {
        (**self).serialize(payload)
    }

    fn deserialize(
        &self,
        content_type: &str,
        message_type: &str,
        data: &[u8],
    ) -> Result<Option<Payload>, SerializationError> {
        (**self).deserialize(content_type, message_type, data)
    }
}

#[derive(Clone)]
struct Registration {
    type_id: TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Registry of message types and their JSON codecs.
#[derive(Clone, Default)]
pub struct TypeMap {
    by_name: HashMap<String, Registration>,
    by_type: HashMap<TypeId, String>,
}

impl core::fmt::Debug for TypeMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TypeMap")
            .field("types", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `T` to `name`. Registering the same pair twice is a no-op.
    pub fn register<T>(&mut self, name: impl Into<String>) -> Result<(), SerializationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let name = name.into();
        let type_id = TypeId::of::<T>();

        if let Some(existing) = self.by_name.get(&name) {
            if existing.type_id == type_id {
                return Ok(());
            }
            return Err(SerializationError::DuplicateRegistration { name });
        }
        if self.by_type.contains_key(&type_id) {
            return Err(SerializationError::DuplicateRegistration { name });
        }

        self.by_name.insert(
            name.clone(),
            Registration {
                type_id,
                encode: encode_json::<T>,
                decode: decode_json::<T>,
            },
        );
        self.by_type.insert(type_id, name);
        Ok(())
    }

    /// Builder-style registration.
    pub fn with<T>(mut self, name: impl Into<String>) -> Result<Self, SerializationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register::<T>(name)?;
        Ok(self)
    }

    pub fn name_of<T: 'static>(&self) -> Option<&str> {
        self.by_type.get(&TypeId::of::<T>()).map(String::as_str)
    }

    pub fn name_of_val(&self, value: &(dyn Any + Send + Sync)) -> Option<&str> {
        self.by_type.get(&(*value).type_id()).map(String::as_str)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

fn encode_json<T>(value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, SerializationError>
where
    T: Serialize + 'static,
{
    let typed = value
        .downcast_ref::<T>()
        .ok_or_else(|| SerializationError::UnregisteredType(std::any::type_name::<T>().to_string()))?;
    serde_json::to_vec(typed).map_err(|e| SerializationError::Encode {
        message_type: std::any::type_name::<T>().to_string(),
        reason: e.to_string(),
    })
}

fn decode_json<T>(data: &[u8]) -> Result<Payload, SerializationError>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let typed: T = serde_json::from_slice(data).map_err(|e| SerializationError::Decode {
        message_type: std::any::type_name::<T>().to_string(),
        reason: e.to_string(),
    })?;
    Ok(Arc::new(typed))
}

/// JSON serializer backed by a [`TypeMap`].
#[derive(Debug, Clone)]
pub struct JsonEventSerializer {
    types: Arc<TypeMap>,
}

impl JsonEventSerializer {
    pub fn new(types: TypeMap) -> Self {
        Self {
            types: Arc::new(types),
        }
    }

    pub fn types(&self) -> &TypeMap {
        &self.types
    }
}

impl EventSerializer for JsonEventSerializer {
    fn serialize(&self, payload: &(dyn Any + Send + Sync)) -> Result<SerializedEvent, SerializationError> {
        let name = self
            .types
            .name_of_val(payload)
            .ok_or_else(|| SerializationError::UnregisteredType(format!("{:?}", (*payload).type_id())))?;

        let registration = &self.types.by_name[name];
        let data = (registration.encode)(payload).map_err(|e| match e {
            SerializationError::Encode { reason, .. } => SerializationError::Encode {
                message_type: name.to_string(),
                reason,
            },
            other => other,
        })?;

        Ok(SerializedEvent {
            event_type: name.to_string(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            data,
        })
    }

    fn deserialize(
        &self,
        content_type: &str,
        message_type: &str,
        data: &[u8],
    ) -> Result<Option<Payload>, SerializationError> {
        let Some(registration) = self.types.by_name.get(message_type) else {
            return Ok(None);
        };
        if content_type != JSON_CONTENT_TYPE {
            return Err(SerializationError::UnsupportedContentType(content_type.to_string()));
        }

        (registration.decode)(data)
            .map(Some)
            .map_err(|e| match e {
                SerializationError::Decode { reason, .. } => SerializationError::Decode {
                    message_type: message_type.to_string(),
                    reason,
                },
                other => other,
            })
    }
}
