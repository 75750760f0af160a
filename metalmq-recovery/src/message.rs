use crate::topology::{FieldTable, FieldValue};
use bytes::Bytes;

/// A message sent to the server or received from the server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Content {
    pub body: Bytes,
    pub headers: FieldTable,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// 1 - non-persistent, 2 - persistent
    pub delivery_mode: Option<u8>,
}

impl Content {
    pub fn text(mut self, text: &str) -> Self {
        self.body = Bytes::copy_from_slice(text.as_bytes());
        self.content_type = Some("text/plain".to_string());
        self
    }

    pub fn header(mut self, name: &str, value: FieldValue) -> Self {
        self.headers.insert(name.to_string(), value);
        self
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A delivered message.
///
/// With the `consumer_tag` and `delivery_tag` a client can send back acknowledgements to the
/// server, saying that the message was successfully arrived.
#[derive(Debug, Default)]
pub struct DeliveredMessage {
    pub content: Content,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}
