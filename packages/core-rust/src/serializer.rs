//! Body serialization for application messages.
//!
//! Bodies are `MsgPack` encoded with `rmp_serde::to_vec_named()` so field
//! names survive schema evolution on either side of a queue.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::{MessageType, TransportMessage};

/// Errors from encoding or decoding message bodies.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("failed to encode '{message_type}': {source}")]
    Encode {
        message_type: &'static str,
        #[source]
        source: rmp_serde::encode::Error,
    },
    #[error("failed to decode '{message_type}': {source}")]
    Decode {
        message_type: String,
        #[source]
        source: rmp_serde::decode::Error,
    },
    #[error("message type mismatch: expected '{expected}', found '{actual}'")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },
}

/// Encodes an application message into a transport envelope.
///
/// # Errors
///
/// Returns `SerializationError::Encode` when the body cannot be encoded.
pub fn encode<M>(message: &M, sent_at_ms: u64) -> Result<TransportMessage, SerializationError>
where
    M: MessageType + Serialize,
{
    let body = rmp_serde::to_vec_named(message).map_err(|source| SerializationError::Encode {
        message_type: M::MESSAGE_TYPE,
        source,
    })?;
    Ok(TransportMessage::new(M::MESSAGE_TYPE, body, sent_at_ms))
}

/// Decodes the body of a transport envelope into `M`.
///
/// The envelope's full type name must equal `M::MESSAGE_TYPE`.
///
/// # Errors
///
/// Returns `SerializationError::TypeMismatch` for a foreign message and
/// `SerializationError::Decode` for a malformed body.
pub fn decode<M>(message: &TransportMessage) -> Result<M, SerializationError>
where
    M: MessageType + DeserializeOwned,
{
    if message.full_type_name() != M::MESSAGE_TYPE {
        return Err(SerializationError::TypeMismatch {
            expected: M::MESSAGE_TYPE,
            actual: message.message_type.clone(),
        });
    }
    rmp_serde::from_slice(&message.body).map_err(|source| SerializationError::Decode {
        message_type: message.message_type.clone(),
        source,
    })
}
