//! Conversion between [`Message`], the stored content and the wire envelope.
//!
//! Payload encoding is the publisher's business (typed payloads go through
//! `serde_json`); a [`Serializer`] only decides how a whole message is laid
//! out on the wire and in the `content` column.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    message::{headers, Headers, Message, TransportMessage},
};

pub trait Serializer: Send + Sync + 'static {
    fn serialize(&self, message: &Message) -> Result<TransportMessage>;

    /// Fails for envelopes lacking the id or name headers.
    fn deserialize(&self, transport: TransportMessage) -> Result<Message>;

    fn serialize_content(&self, message: &Message) -> Result<Bytes>;

    fn deserialize_content(&self, content: &[u8]) -> Result<Message>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

#[derive(Serialize, Deserialize)]
struct StoredEnvelope {
    headers: Headers,
    /// base64
    body: String,
}

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &Message) -> Result<TransportMessage> {
        Ok(TransportMessage::new(
            message.headers.clone(),
            message.body.clone(),
        ))
    }

    fn deserialize(&self, transport: TransportMessage) -> Result<Message> {
        let message = Message::new(transport.headers, transport.body);
        message.id()?;
        if message.name().is_none() {
            return Err(Error::missing_header(headers::MESSAGE_NAME));
        }
        Ok(message)
    }

    fn serialize_content(&self, message: &Message) -> Result<Bytes> {
        let envelope = StoredEnvelope {
            headers: message.headers.clone(),
            body: STANDARD.encode(&message.body),
        };
        Ok(serde_json::to_vec(&envelope)?.into())
    }

    fn deserialize_content(&self, content: &[u8]) -> Result<Message> {
        let envelope: StoredEnvelope = serde_json::from_slice(content)?;
        let body = STANDARD
            .decode(envelope.body)
            .map_err(|e| Error::decode(format!("message body: {e}")))?;
        Ok(Message::new(envelope.headers, body))
    }
}
