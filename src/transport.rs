//! # Replication Transport Contract
//!
//! The replication actor consumes its transport as a request/response channel:
//! inbound messages carry a property bag and a body and can be answered once,
//! either with a response message or with an error in a named domain (`BLIP`
//! for protocol errors, `HTTP` for status-code errors). Outbound requests go
//! through a [`MessageSink`].
//!
//! The wire itself (framing, compression, sockets) is someone else's problem;
//! in tests the sink is a collecting stub and responses travel over a oneshot
//! channel.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{Error, Result};

/// Error domain for protocol-level failures.
pub const BLIP_DOMAIN: &str = "BLIP";
/// Error domain for HTTP-status failures.
pub const HTTP_DOMAIN: &str = "HTTP";

// =============================================================================
// Outbound Messages
// =============================================================================

/// Builder for an outbound message (request or response).
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    pub name: String,
    pub properties: HashMap<String, String>,
    pub body: Vec<u8>,
    /// The receiver should not answer this message.
    pub no_reply: bool,
    /// The body is large enough to be worth compressing on the wire.
    pub compressed: bool,
}

impl MessageBuilder {
    pub fn new(name: impl Into<String>) -> MessageBuilder {
        MessageBuilder {
            name: name.into(),
            ..MessageBuilder::default()
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> MessageBuilder {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> MessageBuilder {
        self.body = body;
        self
    }

    pub fn json_body(mut self, value: &serde_json::Value) -> MessageBuilder {
        self.body = value.to_string().into_bytes();
        self
    }
}

/// Where outgoing requests go. One per peer connection.
pub trait MessageSink: Send + Sync {
    fn send_request(&self, message: MessageBuilder, on_progress: Option<ProgressCallback>);
}

/// Invoked as an outgoing message makes progress. Its mere presence requests a
/// reply; without one the message goes out `no_reply`.
pub type ProgressCallback = Box<dyn Fn() + Send + Sync>;

// =============================================================================
// Inbound Messages
// =============================================================================

/// The answer to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok {
        properties: HashMap<String, String>,
        body: Vec<u8>,
    },
    Error {
        domain: String,
        code: i32,
    },
}

impl Response {
    /// The response property with this key, for `Ok` responses.
    pub fn property(&self, key: &str) -> Option<&str> {
        match self {
            Response::Ok { properties, .. } => properties.get(key).map(String::as_str),
            Response::Error { .. } => None,
        }
    }

    /// The `(domain, code)` of an error response.
    pub fn error(&self) -> Option<(&str, i32)> {
        match self {
            Response::Error { domain, code } => Some((domain.as_str(), *code)),
            Response::Ok { .. } => None,
        }
    }
}

/// An inbound request: property bag, body, and a single-use responder.
pub struct MessageIn {
    name: String,
    properties: HashMap<String, String>,
    body: Vec<u8>,
    responder: Mutex<Option<oneshot::Sender<Response>>>,
}

impl std::fmt::Debug for MessageIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageIn")
            .field("name", &self.name)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl MessageIn {
    /// Creates a request and the channel its response arrives on.
    pub fn new(
        name: impl Into<String>,
        properties: HashMap<String, String>,
        body: Vec<u8>,
    ) -> (MessageIn, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            MessageIn {
                name: name.into(),
                properties,
                body,
                responder: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body parsed as JSON.
    pub fn json_body(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::InvalidParameter(format!("malformed JSON message body: {e}")))
    }

    /// Answers with a response message. Only the first answer counts.
    pub fn respond(&self, message: MessageBuilder) {
        self.send(Response::Ok {
            properties: message.properties,
            body: message.body,
        });
    }

    /// Answers with an error in the given domain.
    pub fn respond_with_error(&self, domain: &str, code: i32) {
        self.send(Response::Error {
            domain: domain.to_string(),
            code,
        });
    }

    fn send(&self, response: Response) {
        match self.responder.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => warn!("dropping duplicate response to '{}' message", self.name),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_response_round_trip() {
        let (msg, rx) = MessageIn::new(
            "getCheckpoint",
            HashMap::from([("client".to_string(), "abc".to_string())]),
            Vec::new(),
        );
        assert_eq!(msg.property("client"), Some("abc"));
        assert_eq!(msg.property("missing"), None);

        msg.respond(MessageBuilder::new("").property("rev", "1-cc").body(b"B".to_vec()));
        let response = rx.blocking_recv().unwrap();
        assert_eq!(response.property("rev"), Some("1-cc"));
        assert!(response.error().is_none());
    }

    #[test]
    fn test_error_response() {
        let (msg, rx) = MessageIn::new("setCheckpoint", HashMap::new(), Vec::new());
        msg.respond_with_error(HTTP_DOMAIN, 409);
        assert_eq!(rx.blocking_recv().unwrap().error(), Some(("HTTP", 409)));
    }

    #[test]
    fn test_duplicate_response_is_dropped() {
        let (msg, rx) = MessageIn::new("x", HashMap::new(), Vec::new());
        msg.respond_with_error(HTTP_DOMAIN, 404);
        msg.respond_with_error(HTTP_DOMAIN, 500); // ignored
        assert_eq!(rx.blocking_recv().unwrap().error(), Some(("HTTP", 404)));
    }

    #[test]
    fn test_json_body() {
        let (msg, _rx) = MessageIn::new("changes", HashMap::new(), b"[[1,\"d\",\"r\"]]".to_vec());
        let json = msg.json_body().unwrap();
        assert_eq!(json[0][1], "d");

        let (bad, _rx) = MessageIn::new("changes", HashMap::new(), b"not json".to_vec());
        assert!(bad.json_body().is_err());
    }
}
