//! The generic JSON envelope carried on every connection.
//!
//! A message is one top-level JSON object. Requests carry an `action`,
//! responses carry a numeric `status` (and `responseText` on failure).
//! The `type` field is optional on the wire; when absent the kind is
//! inferred from the presence of `action`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::RequestError;
use crate::protocol::Action;

const MALFORMED: &str = "Malformed JSON request: ";

/// Direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.trim().eq_ignore_ascii_case("response") {
            Ok(MessageKind::Response)
        } else {
            Ok(MessageKind::Request)
        }
    }
}

/// A request or response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<MessageKind>,
    #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
    message_id: Option<u64>,
    #[serde(flatten)]
    body: Map<String, Value>,
}

impl Message {
    /// Empty request for `action`.
    pub fn request(action: Action) -> Self {
        let mut body = Map::new();
        body.insert("action".into(), Value::String(action.as_str().into()));
        Self {
            kind: Some(MessageKind::Request),
            message_id: None,
            body,
        }
    }

    /// Request for `action` whose remaining fields come from `payload`.
    ///
    /// `payload` must serialize to a JSON object.
    pub fn request_with<T: Serialize>(action: Action, payload: &T) -> Result<Self, RequestError> {
        let mut message = Self::request(action);
        message.merge(payload)?;
        Ok(message)
    }

    /// Successful (200) response with no extra fields.
    pub fn ok() -> Self {
        let mut body = Map::new();
        body.insert("status".into(), Value::from(200u16));
        Self {
            kind: Some(MessageKind::Response),
            message_id: None,
            body,
        }
    }

    /// Successful response whose remaining fields come from `payload`.
    pub fn ok_with<T: Serialize>(payload: &T) -> Result<Self, RequestError> {
        let mut message = Self::ok();
        message.merge(payload)?;
        Ok(message)
    }

    /// Failure response mapped from a `RequestError`.
    pub fn error(err: &RequestError) -> Self {
        let mut body = Map::new();
        body.insert("status".into(), Value::from(err.status));
        body.insert("responseText".into(), Value::String(err.message.clone()));
        Self {
            kind: Some(MessageKind::Response),
            message_id: None,
            body,
        }
    }

    /// Build a message from a decoded JSON value; only objects are accepted.
    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        if !value.is_object() {
            return Err(RequestError::bad_request(format!(
                "{MALFORMED}expected a JSON object"
            )));
        }
        serde_json::from_value(value)
            .map_err(|e| RequestError::bad_request(format!("{MALFORMED}{e}")))
    }

    /// Explicit or inferred kind.
    pub fn kind(&self) -> MessageKind {
        match self.kind {
            Some(kind) => kind,
            None if self.body.contains_key("action") => MessageKind::Request,
            None => MessageKind::Response,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind() == MessageKind::Request
    }

    pub fn message_id(&self) -> Option<u64> {
        self.message_id
    }

    pub fn set_message_id(&mut self, id: Option<u64>) {
        self.message_id = id;
    }

    pub fn with_message_id(mut self, id: Option<u64>) -> Self {
        self.message_id = id;
        self
    }

    /// Raw `action` string, if any.
    pub fn action_name(&self) -> Option<&str> {
        self.body.get("action").and_then(Value::as_str)
    }

    /// Parsed `action`; unknown or missing actions are protocol errors.
    pub fn action(&self) -> Result<Action, RequestError> {
        let raw = self
            .action_name()
            .ok_or_else(|| RequestError::bad_request(format!("{MALFORMED}action not found")))?;
        Action::parse(raw)
            .ok_or_else(|| RequestError::bad_request(format!("Unknown request action: {raw}")))
    }

    /// Response status; a missing or non-numeric status counts as 500.
    pub fn status(&self) -> u16 {
        match self.body.get("status") {
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()).unwrap_or(500),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(500),
            _ => 500,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == 200
    }

    pub fn response_text(&self) -> Option<&str> {
        self.body.get("responseText").and_then(Value::as_str)
    }

    /// Turn a failure response back into the `RequestError` it carries.
    pub fn into_result(self) -> Result<Self, RequestError> {
        if self.is_success() {
            Ok(self)
        } else {
            let text = self.response_text().unwrap_or("request failed").to_string();
            Err(RequestError::new(self.status(), text))
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    /// Set a single field, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.body.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Decode one required field into `T`.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<T, RequestError> {
        let value = self
            .body
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| RequestError::bad_request(format!("{MALFORMED}{name} not found")))?;
        serde_json::from_value(value.clone()).map_err(|e| {
            RequestError::bad_request(format!("{MALFORMED}{name} has the wrong type: {e}"))
        })
    }

    /// Decode a non-empty string field.
    pub fn string_field(&self, name: &str) -> Result<String, RequestError> {
        let value: String = self.field(name)?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(RequestError::bad_request(format!("{MALFORMED}{name} can't be empty")));
        }
        Ok(trimmed.to_string())
    }

    /// Decode the whole body into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|e| RequestError::bad_request(format!("{MALFORMED}{e}")))
    }

    /// Copy every field of `payload` into the body.
    fn merge<T: Serialize>(&mut self, payload: &T) -> Result<(), RequestError> {
        match serde_json::to_value(payload) {
            Ok(Value::Object(fields)) => {
                self.body.extend(fields);
                Ok(())
            }
            Ok(_) => Err(RequestError::internal("payload is not a JSON object")),
            Err(e) => Err(RequestError::internal(format!("failed to encode payload: {e}"))),
        }
    }
}
