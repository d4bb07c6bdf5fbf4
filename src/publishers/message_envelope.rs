use amq_protocol_types::{FieldTable, ShortString};
use lapin::BasicProperties;

/// A message to be published via [`Publisher`](super::Publisher).
#[derive(Debug, Default, Clone)]
pub struct MessageEnvelope {
    /// The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    /// The name of the exchange we are publishing the message to.
    /// The empty string is the default exchange.
    pub exchange_name: String,
    pub routing_key: String,
    pub properties: BasicProperties,
}

impl MessageEnvelope {
    #[must_use]
    pub fn with_payload(mut self, value: Vec<u8>) -> Self {
        self.payload = value;
        self
    }

    #[must_use]
    pub fn with_exchange_name(mut self, value: String) -> Self {
        self.exchange_name = value;
        self
    }

    #[must_use]
    pub fn with_routing_key(mut self, value: String) -> Self {
        self.routing_key = value;
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, value: ShortString) -> Self {
        self.properties = self.properties.with_content_type(value);
        self
    }

    #[must_use]
    pub fn with_headers(mut self, value: FieldTable) -> Self {
        self.properties = self.properties.with_headers(value);
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, value: ShortString) -> Self {
        self.properties = self.properties.with_correlation_id(value);
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, value: ShortString) -> Self {
        self.properties = self.properties.with_reply_to(value);
        self
    }
}
